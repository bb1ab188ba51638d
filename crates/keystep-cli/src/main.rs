//! keystep CLI entry point.
//!
//! Binary name: `keystep`
//!
//! Parses CLI arguments, initializes tracing, the checkpoint database and the
//! orchestrator, then dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;

use cli::run::OutputMode;
use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Verbosity maps to the default filter; RUST_LOG still wins when set.
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "warn",
        1 => "info,keystep_core=debug,keystep_infra=debug",
        _ => "trace",
    };
    keystep_observe::init_tracing(filter, cli.otel)
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;

    let result = dispatch(cli).await;
    keystep_observe::shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "keystep", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;
    tracing::debug!(
        data_dir = %state.data_dir.display(),
        max_parallel_steps = ?state.config.max_parallel_steps,
        "keystep initialized"
    );

    let mode = OutputMode {
        json: cli.json,
        quiet: cli.quiet,
    };

    let outcome = match cli.command {
        Commands::Run {
            workflow,
            inputs,
            run_id,
        } => cli::run::handle_run(&state, &workflow, &inputs, run_id, mode).await,

        Commands::Resume { run_id, workflow } => {
            cli::run::handle_resume(&state, run_id, &workflow, mode).await
        }

        Commands::Validate { file } => cli::workflow::handle_validate(&state, &file, cli.json),

        Commands::Workflows => cli::workflow::handle_workflows(&state, cli.json),

        Commands::Runs { workflow, limit } => {
            cli::history::handle_runs(&state, &workflow, limit, cli.json).await
        }

        Commands::Steps { run_id } => cli::history::handle_steps(&state, run_id, cli.json).await,

        Commands::Interrupted => cli::history::handle_interrupted(&state, cli.json).await,

        Commands::Handlers => cli::workflow::handle_handlers(&state, cli.json),

        Commands::Completions { .. } => Ok(()),
    };

    state.db_pool.close().await;
    outcome
}
