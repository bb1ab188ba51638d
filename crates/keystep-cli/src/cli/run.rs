//! CLI run and resume subcommands.
//!
//! Both drive the orchestrator in the foreground, print step progress from
//! the event bus as it happens, and turn Ctrl-C into a cooperative cancel.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use keystep_core::workflow::executor::WorkflowExecutor;
use keystep_types::event::EngineEvent;
use keystep_types::workflow::{Outputs, RunResult, RunStatus, StepStatus, WorkflowDefinition};

use super::short_id;
use super::workflow::resolve_definition;
use crate::state::AppState;

/// Output preferences shared by run and resume.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub json: bool,
    pub quiet: bool,
}

impl OutputMode {
    fn styled(self) -> bool {
        !self.json && !self.quiet
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(
    state: &AppState,
    workflow: &str,
    raw_inputs: &[String],
    run_id: Option<Uuid>,
    mode: OutputMode,
) -> Result<()> {
    let def = resolve_definition(state, workflow)?;
    let inputs = parse_inputs(raw_inputs)?;
    let run_id = run_id.unwrap_or_else(Uuid::now_v7);

    if mode.styled() {
        println!();
        println!(
            "  {} Running '{}' v{} as {}",
            style("*").green().bold(),
            style(&def.name).cyan(),
            def.version,
            style(short_id(&run_id)).dim()
        );
        println!();
    }

    let result = drive(state, &def, inputs, Some(run_id), None, mode).await?;
    report(&result, mode)
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

pub async fn handle_resume(
    state: &AppState,
    run_id: Uuid,
    workflow: &str,
    mode: OutputMode,
) -> Result<()> {
    let def = resolve_definition(state, workflow)?;

    if mode.styled() {
        println!();
        println!(
            "  {} Resuming run {} of '{}'",
            style("*").green().bold(),
            style(short_id(&run_id)).cyan(),
            style(&def.name).cyan()
        );
        println!();
    }

    let result = drive(state, &def, Outputs::new(), None, Some(run_id), mode).await?;
    report(&result, mode)
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Execute in the foreground; the first Ctrl-C requests cancellation and the
/// run stops at the next level boundary.
async fn drive(
    state: &AppState,
    def: &WorkflowDefinition,
    inputs: Outputs,
    run_id: Option<Uuid>,
    resume_from: Option<Uuid>,
    mode: OutputMode,
) -> Result<RunResult> {
    let orchestrator = &state.orchestrator;
    let Some(target) = resume_from.or(run_id) else {
        bail!("a run id is required");
    };

    let printer = mode
        .styled()
        .then(|| spawn_progress_printer(orchestrator.event_bus().subscribe(), target));

    let execution = orchestrator.execute(def, inputs, run_id, resume_from);
    tokio::pin!(execution);

    let mut cancelling = false;
    let outcome = loop {
        tokio::select! {
            result = &mut execution => break result,
            Ok(()) = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                if orchestrator.cancel(target) && !mode.quiet {
                    eprintln!(
                        "  {} Cancelling after the current level finishes...",
                        style("!").yellow().bold()
                    );
                }
            }
        }
    };

    if let Some(mut printer) = printer {
        // Let the printer drain what is buffered, then stop listening.
        if tokio::time::timeout(Duration::from_millis(250), &mut printer)
            .await
            .is_err()
        {
            printer.abort();
        }
    }

    outcome.with_context(|| format!("Workflow '{}' could not be executed", def.name))
}

fn spawn_progress_printer(
    mut events: broadcast::Receiver<EngineEvent>,
    run_id: Uuid,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) if event.run_id() == run_id => {
                    print_event(&event);
                    if matches!(event, EngineEvent::RunFinished { .. }) {
                        break;
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "progress printer lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::RunStarted {
            resumed: true,
            skipped_steps,
            ..
        } if *skipped_steps > 0 => {
            println!(
                "  {} {skipped_steps} step(s) already checkpointed",
                style("=").dim()
            );
        }
        EngineEvent::LevelStarted { level, steps, .. } => {
            println!(
                "  {} level {level}: {}",
                style(">").cyan(),
                steps.join(", ")
            );
        }
        EngineEvent::StepRetrying {
            step_name,
            attempt,
            error,
            ..
        } => {
            println!(
                "    {} {step_name} attempt {attempt} failed: {}",
                style("~").yellow(),
                style(error).dim()
            );
        }
        EngineEvent::StepFinished {
            step_name,
            status,
            duration_ms,
            attempts,
            ..
        } => {
            let mark = match status {
                StepStatus::Success => style("✓").green(),
                StepStatus::Skipped => style("-").yellow(),
                StepStatus::Failed => style("✗").red(),
            };
            let retries = if *attempts > 1 {
                format!(", {attempts} attempts")
            } else {
                String::new()
            };
            println!("    {mark} {step_name} ({duration_ms}ms{retries})");
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Reporting
// ---------------------------------------------------------------------------

fn report(result: &RunResult, mode: OutputMode) -> Result<()> {
    if mode.json {
        println!("{}", serde_json::to_string_pretty(result)?);
    } else if !mode.quiet {
        print_result(result);
    }

    match result.status {
        RunStatus::Success => Ok(()),
        status => Err(anyhow!(
            "Run {} finished with status {status}{}",
            result.run_id,
            result
                .failed_step
                .as_deref()
                .map(|s| format!(" at step '{s}'"))
                .unwrap_or_default()
        )),
    }
}

fn print_result(result: &RunResult) {
    println!();
    match result.status {
        RunStatus::Success => println!(
            "  {} Run {} succeeded",
            style("*").green().bold(),
            style(short_id(&result.run_id)).cyan()
        ),
        status => {
            println!(
                "  {} Run {} finished: {}",
                style("!").red().bold(),
                style(short_id(&result.run_id)).cyan(),
                status
            );
            if let Some(ref err) = result.error {
                println!("  Error: {}", style(err).red());
            }
            println!(
                "  Resume with: {}",
                style(format!("keystep resume {} <workflow>", result.run_id)).dim()
            );
        }
    }

    if !result.outputs.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![Cell::new("Step").fg(Color::Cyan), Cell::new("Outputs")]);
        for (step, outputs) in &result.outputs {
            table.add_row(vec![Cell::new(step), Cell::new(outputs.to_string())]);
        }
        println!();
        println!("{table}");
    }
    println!();
}

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// Parse `KEY=VALUE` pairs. VALUE is JSON when it parses as JSON, else a string.
pub fn parse_inputs(raw: &[String]) -> Result<Outputs> {
    let mut inputs = Outputs::new();
    for pair in raw {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Invalid input '{pair}': expected KEY=VALUE"))?;
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid input '{pair}': key must not be empty");
        }
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        inputs.insert(key.to_string(), value);
    }
    Ok(inputs)
}
