//! CLI run history subcommands: runs, steps, interrupted.

use anyhow::{Result, anyhow};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use serde_json::Value;
use uuid::Uuid;

use keystep_core::repository::CheckpointStore;
use keystep_types::workflow::{StepCheckpoint, WorkflowRun};

use super::{format_run_status, format_step_status, short_id};
use crate::state::AppState;

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

pub async fn handle_runs(state: &AppState, workflow: &str, limit: u32, json: bool) -> Result<()> {
    let runs = state
        .store()
        .list_runs(workflow, limit)
        .await
        .map_err(|e| anyhow!("Failed to list runs: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No runs for workflow '{workflow}'.");
        println!();
        return Ok(());
    }

    println!();
    println!("  Runs for workflow '{}'", style(workflow).cyan());
    println!();
    println!("{}", runs_table(&runs));
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Interrupted
// ---------------------------------------------------------------------------

pub async fn handle_interrupted(state: &AppState, json: bool) -> Result<()> {
    let runs = state
        .store()
        .list_interrupted_runs()
        .await
        .map_err(|e| anyhow!("Failed to list interrupted runs: {e}"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No interrupted runs.");
        println!();
        return Ok(());
    }

    println!();
    println!("{}", runs_table(&runs));
    println!();
    println!(
        "  Continue one with: {}",
        style("keystep resume <run-id> <workflow>").dim()
    );
    println!();

    Ok(())
}

fn runs_table(runs: &[WorkflowRun]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Started"),
            Cell::new("Completed"),
            Cell::new("Failed step"),
        ]);

    for r in runs {
        let completed = r
            .completed_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(short_id(&r.id)),
            Cell::new(format!("{} v{}", r.workflow_name, r.workflow_version)),
            format_run_status(r.status),
            Cell::new(r.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(completed),
            Cell::new(r.failed_step.as_deref().unwrap_or("-")),
        ]);
    }
    table
}

// ---------------------------------------------------------------------------
// Steps
// ---------------------------------------------------------------------------

pub async fn handle_steps(state: &AppState, run_id: Uuid, json: bool) -> Result<()> {
    let store = state.store();
    let run = store
        .get_run(&run_id)
        .await
        .map_err(|e| anyhow!("Failed to get run: {e}"))?
        .ok_or_else(|| anyhow!("Run '{run_id}' not found"))?;
    let checkpoints = store
        .list_step_checkpoints(&run_id)
        .await
        .map_err(|e| anyhow!("Failed to list step checkpoints: {e}"))?;

    if json {
        let out = serde_json::json!({
            "run": run,
            "steps": checkpoints,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} {} ({} v{})",
        style("Run").bold(),
        style(short_id(&run.id)).cyan(),
        run.workflow_name,
        run.workflow_version
    );
    println!("  Status: {}", run.status);
    if let Some(ref err) = run.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    if checkpoints.is_empty() {
        println!("  No steps checkpointed yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Attempts"),
            Cell::new("Duration"),
            Cell::new("Completed"),
            Cell::new("Note"),
        ]);

    for c in &checkpoints {
        table.add_row(vec![
            Cell::new(&c.step_name),
            format_step_status(c.status),
            Cell::new(c.attempt_count),
            Cell::new(format!("{}ms", c.duration_ms)),
            Cell::new(c.completed_at.format("%H:%M:%S").to_string()),
            Cell::new(step_note(c)),
        ]);
    }

    println!("{table}");
    println!();

    Ok(())
}

/// Warning or error recorded in a checkpoint's metadata, truncated for display.
fn step_note(checkpoint: &StepCheckpoint) -> String {
    ["warning", "error"]
        .iter()
        .find_map(|key| checkpoint.metadata.get(*key).and_then(Value::as_str))
        .map(|note| note.chars().take(60).collect())
        .unwrap_or_else(|| "-".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use keystep_types::workflow::{Outputs, StepStatus};
    use serde_json::json;

    fn checkpoint(metadata: Outputs) -> StepCheckpoint {
        let now = Utc::now();
        StepCheckpoint {
            run_id: Uuid::now_v7(),
            step_name: "gather".to_string(),
            status: StepStatus::Skipped,
            outputs: Outputs::new(),
            attempt_count: 3,
            started_at: now,
            completed_at: now,
            duration_ms: 12,
            metadata,
        }
    }

    #[test]
    fn step_note_prefers_warning() {
        let mut metadata = Outputs::new();
        metadata.insert("error".to_string(), json!("boom"));
        metadata.insert("warning".to_string(), json!("skipped after 3 attempt(s)"));
        assert_eq!(step_note(&checkpoint(metadata)), "skipped after 3 attempt(s)");
    }

    #[test]
    fn step_note_truncates_and_defaults() {
        assert_eq!(step_note(&checkpoint(Outputs::new())), "-");

        let mut metadata = Outputs::new();
        metadata.insert("error".to_string(), json!("x".repeat(200)));
        assert_eq!(step_note(&checkpoint(metadata)).len(), 60);
    }
}
