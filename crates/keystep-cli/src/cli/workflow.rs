//! CLI workflow definition subcommands.
//!
//! Provides validate, workflows (discovery listing) and handlers, plus the
//! definition lookup shared by `run` and `resume`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use keystep_core::workflow::dag::compile;
use keystep_core::workflow::definition::{WorkflowError, discover_workflows, load_workflow_file};
use keystep_types::workflow::WorkflowDefinition;

use crate::state::AppState;

/// Load a workflow from a file path, or by name from the workflows directory.
pub fn resolve_definition(state: &AppState, target: &str) -> Result<WorkflowDefinition> {
    let path = Path::new(target);
    if path.is_file() {
        return load_workflow_file(path).map_err(|e| describe_load_error(path, e));
    }

    let discovered = discover_workflows(&state.workflows_dir).with_context(|| {
        format!(
            "Failed to scan workflows directory {}",
            state.workflows_dir.display()
        )
    })?;

    discovered
        .into_iter()
        .find(|(_, def)| def.name == target)
        .map(|(_, def)| def)
        .ok_or_else(|| {
            anyhow::anyhow!(
                "'{}' is neither a workflow file nor a workflow in {}",
                target,
                state.workflows_dir.display()
            )
        })
}

fn describe_load_error(path: &Path, e: WorkflowError) -> anyhow::Error {
    match e {
        WorkflowError::ParseError(msg) => {
            anyhow::anyhow!("Failed to parse workflow YAML {}: {msg}", path.display())
        }
        WorkflowError::ValidationError(msg) => {
            anyhow::anyhow!("Workflow validation failed for {}: {msg}", path.display())
        }
        other => anyhow::anyhow!("Failed to load workflow {}: {other}", path.display()),
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(state: &AppState, file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file).map_err(|e| describe_load_error(file, e))?;
    let plan = compile(&def).map_err(|e| anyhow::anyhow!("Workflow '{}' is invalid: {e}", def.name))?;
    state
        .orchestrator
        .registry()
        .validate(&def)
        .map_err(|e| anyhow::anyhow!("Workflow '{}' is invalid: {e}", def.name))?;

    if json {
        let out = serde_json::json!({
            "name": def.name,
            "version": def.version,
            "valid": true,
            "steps": plan.step_count(),
            "levels": &plan.levels,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Workflow '{}' v{} is valid",
        style("*").green().bold(),
        style(&def.name).cyan(),
        def.version
    );
    println!();
    for (idx, level) in plan.levels.iter().enumerate() {
        println!("  Level {idx}: {}", level.join(", "));
    }
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Workflows
// ---------------------------------------------------------------------------

pub fn handle_workflows(state: &AppState, json: bool) -> Result<()> {
    let discovered = discover_workflows(&state.workflows_dir).with_context(|| {
        format!(
            "Failed to scan workflows directory {}",
            state.workflows_dir.display()
        )
    })?;

    if json {
        let out: Vec<_> = discovered
            .iter()
            .map(|(path, def)| {
                serde_json::json!({
                    "name": def.name,
                    "version": def.version,
                    "description": def.description,
                    "steps": def.steps.len(),
                    "file": path.display().to_string(),
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    if discovered.is_empty() {
        println!();
        println!(
            "  No workflows in {}.",
            style(state.workflows_dir.display()).dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Name").fg(Color::Cyan),
            Cell::new("Version"),
            Cell::new("Steps"),
            Cell::new("Description"),
            Cell::new("File"),
        ]);

    for (path, def) in &discovered {
        let file = path
            .strip_prefix(&state.workflows_dir)
            .unwrap_or(path)
            .display()
            .to_string();
        table.add_row(vec![
            Cell::new(&def.name),
            Cell::new(&def.version),
            Cell::new(def.steps.len()),
            Cell::new(def.description.as_deref().unwrap_or("-")),
            Cell::new(file),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

pub fn handle_handlers(state: &AppState, json: bool) -> Result<()> {
    let ids = state.orchestrator.registry().handler_ids();
    if ids.is_empty() {
        bail!("No step handlers are registered");
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&ids)?);
        return Ok(());
    }

    println!();
    for id in ids {
        println!("  {} {}", style("-").dim(), style(id).cyan());
    }
    println!();

    Ok(())
}
