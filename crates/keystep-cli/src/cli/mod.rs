//! CLI command definitions for the `keystep` binary.
//!
//! Uses clap derive macros for argument parsing. Commands are flat verbs
//! (`keystep run`, `keystep resume`, `keystep runs`).

pub mod history;
pub mod run;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use keystep_types::workflow::{RunStatus, StepStatus};
use uuid::Uuid;

/// Run checkpointed multi-step workflows.
#[derive(Parser)]
#[command(name = "keystep", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed output (-v for verbose, -vv for debug/trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, global = true, hide = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a new run of a workflow.
    Run {
        /// Workflow YAML file, or the name of a workflow in the workflows directory.
        workflow: String,

        /// Run input as KEY=VALUE (VALUE is parsed as JSON, else kept as a string).
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// Use this run id instead of generating one.
        #[arg(long)]
        run_id: Option<Uuid>,
    },

    /// Resume a failed, cancelled or interrupted run.
    Resume {
        /// Run to resume.
        run_id: Uuid,

        /// Workflow YAML file, or the name of a workflow in the workflows directory.
        workflow: String,
    },

    /// Check a workflow file and print its execution plan.
    Validate {
        /// Path to the workflow YAML file.
        file: PathBuf,
    },

    /// List workflows found in the workflows directory.
    #[command(alias = "ls")]
    Workflows,

    /// Show recent runs of a workflow.
    Runs {
        /// Workflow name.
        workflow: String,

        /// Maximum number of runs to display.
        #[arg(long, default_value = "10")]
        limit: u32,
    },

    /// Show the step checkpoints of a run.
    Steps {
        /// Run id.
        run_id: Uuid,
    },

    /// List runs left in `running` status by a process that is gone.
    Interrupted,

    /// List registered step handlers.
    Handlers,

    /// Generate shell completions.
    Completions {
        /// Target shell.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared formatting helpers
// ---------------------------------------------------------------------------

pub(crate) fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub(crate) fn format_run_status(status: RunStatus) -> Cell {
    match status {
        RunStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        RunStatus::Running => Cell::new("running").fg(Color::Blue),
        RunStatus::Success => Cell::new("success").fg(Color::Green),
        RunStatus::Failure => Cell::new("failure").fg(Color::Red),
        RunStatus::Cancelled => Cell::new("cancelled").fg(Color::DarkYellow),
    }
}

pub(crate) fn format_step_status(status: StepStatus) -> Cell {
    match status {
        StepStatus::Success => Cell::new("success").fg(Color::Green),
        StepStatus::Failed => Cell::new("failed").fg(Color::Red),
        StepStatus::Skipped => Cell::new("skipped").fg(Color::DarkYellow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_run_with_inputs() {
        let cli = Cli::try_parse_from([
            "keystep", "--json", "run", "digest.yaml", "-i", "topic=rust", "--input", "n=3",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run {
                workflow, inputs, run_id,
            } => {
                assert_eq!(workflow, "digest.yaml");
                assert_eq!(inputs, vec!["topic=rust", "n=3"]);
                assert!(run_id.is_none());
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn resume_requires_valid_uuid() {
        assert!(Cli::try_parse_from(["keystep", "resume", "not-a-uuid", "digest.yaml"]).is_err());
        let id = Uuid::now_v7();
        let cli =
            Cli::try_parse_from(["keystep", "resume", &id.to_string(), "digest.yaml"]).unwrap();
        assert!(matches!(cli.command, Commands::Resume { run_id, .. } if run_id == id));
    }

    #[test]
    fn short_id_is_eight_chars() {
        assert_eq!(short_id(&Uuid::now_v7()).len(), 8);
    }
}
