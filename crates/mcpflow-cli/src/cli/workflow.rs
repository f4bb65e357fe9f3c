//! CLI workflow definition subcommands.
//!
//! Import, validate, list, show, activate, archive, delete and summarize
//! workflow definitions held by the store.

use std::path::{Path, PathBuf};

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;

use mcpflow_core::repository::workflow::WorkflowFilter;
use mcpflow_core::workflow::definition::load_workflow_file;
use mcpflow_core::workflow::validator::validate_workflow;
use mcpflow_types::workflow::{WorkflowDefinition, WorkflowStatus};

use super::{format_duration, parse_id, print_json};
use crate::state::AppState;

/// Workflow definition subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Create an empty draft workflow.
    Create {
        /// Workflow name.
        name: String,

        #[arg(long, default_value = "")]
        description: String,

        #[arg(long)]
        category: Option<String>,

        /// Author recorded on the definition.
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Import (create or replace) a workflow from a JSON file.
    Import {
        /// Path to the workflow JSON file.
        file: PathBuf,
    },

    /// Check a workflow JSON file without saving it.
    Validate {
        /// Path to the workflow JSON file.
        file: PathBuf,
    },

    /// List stored workflows.
    #[command(alias = "ls")]
    List {
        /// Only workflows with this status (draft, active, archived).
        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        category: Option<String>,

        #[arg(long)]
        created_by: Option<String>,
    },

    /// Show one workflow with its steps and connections.
    Show {
        /// Workflow UUID.
        id: String,
    },

    /// Mark a workflow active so it can be run. Fails if it is invalid.
    Activate {
        /// Workflow UUID.
        id: String,
    },

    /// Archive a workflow.
    Archive {
        /// Workflow UUID.
        id: String,
    },

    /// Delete a workflow and its execution history.
    #[command(alias = "rm")]
    Delete {
        /// Workflow UUID.
        id: String,
    },

    /// Counts and success rates across all workflows.
    Stats,
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(cmd: WorkflowCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        WorkflowCommand::Create {
            name,
            description,
            category,
            by,
        } => {
            let def = state
                .store
                .create_workflow(&name, &description, &by, category.as_deref())
                .await?;
            print_saved("Created", &def, json)
        }
        WorkflowCommand::Import { file } => handle_import(&file, state, json).await,
        WorkflowCommand::Validate { file } => handle_validate(&file, json),
        WorkflowCommand::List {
            status,
            category,
            created_by,
        } => {
            let filter = WorkflowFilter {
                status: status.as_deref().map(parse_status).transpose()?,
                category,
                created_by,
            };
            handle_list(&filter, state, json)
        }
        WorkflowCommand::Show { id } => handle_show(&id, state, json).await,
        WorkflowCommand::Activate { id } => handle_set_status(&id, WorkflowStatus::Active, state, json).await,
        WorkflowCommand::Archive { id } => handle_set_status(&id, WorkflowStatus::Archived, state, json).await,
        WorkflowCommand::Delete { id } => handle_delete(&id, state, json).await,
        WorkflowCommand::Stats => handle_stats(state, json),
    }
}

fn parse_status(raw: &str) -> Result<WorkflowStatus> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_lowercase()))
        .map_err(|_| anyhow::anyhow!("Unknown workflow status '{raw}' (expected draft, active or archived)"))
}

fn print_saved(verb: &str, def: &WorkflowDefinition, json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "id": def.id.to_string(),
            "name": def.name,
            "version": def.version,
            "status": def.status,
            "steps": def.steps.len(),
        }));
    }

    println!();
    println!(
        "  {} {} workflow '{}'",
        style("*").green().bold(),
        verb,
        style(&def.name).cyan()
    );
    println!("  ID: {}", def.id);
    println!("  Version: {}", def.version);
    println!("  Status: {}", def.status);
    println!("  Steps: {}", def.steps.len());
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Import / Validate
// ---------------------------------------------------------------------------

async fn handle_import(file: &Path, state: &AppState, json: bool) -> Result<()> {
    let def = load_workflow_file(file).map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", file.display()))?;
    let def = state.store.save_workflow(def).await?;
    print_saved("Imported", &def, json)
}

fn handle_validate(file: &Path, json: bool) -> Result<()> {
    let def = load_workflow_file(file).map_err(|e| anyhow::anyhow!("Failed to load {}: {e}", file.display()))?;
    let report = validate_workflow(&def);

    if json {
        print_json(&serde_json::json!({
            "name": def.name,
            "valid": report.is_valid(),
            "errors": report.errors,
        }))?;
    } else if report.is_valid() {
        println!();
        println!(
            "  {} '{}' is valid ({} steps, {} connections)",
            style("✓").green(),
            style(&def.name).cyan(),
            def.steps.len(),
            def.connections.len()
        );
        println!();
    } else {
        println!();
        println!("  {} '{}' is invalid:", style("✗").red(), style(&def.name).cyan());
        for error in &report.errors {
            println!("    - {error}");
        }
        println!();
    }

    if !report.is_valid() {
        bail!("workflow has {} validation error(s)", report.errors.len());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// List / Show
// ---------------------------------------------------------------------------

fn handle_list(filter: &WorkflowFilter, state: &AppState, json: bool) -> Result<()> {
    let defs = state.store.list_workflows(filter);

    if json {
        let out: Vec<_> = defs
            .iter()
            .map(|d| {
                serde_json::json!({
                    "id": d.id.to_string(),
                    "name": d.name,
                    "version": d.version,
                    "status": d.status,
                    "category": d.category,
                    "steps": d.steps.len(),
                    "execution_count": d.stats.execution_count,
                    "updated_at": d.updated_at.to_rfc3339(),
                })
            })
            .collect();
        return print_json(&out);
    }

    if defs.is_empty() {
        println!();
        println!("  No workflows found.");
        println!(
            "  Import one with: {}",
            style("mcpflow workflow import <file.json>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("ID").fg(Color::Cyan),
            Cell::new("Name"),
            Cell::new("Version"),
            Cell::new("Status"),
            Cell::new("Category"),
            Cell::new("Steps"),
            Cell::new("Runs"),
        ]);

    for d in &defs {
        let status = match d.status {
            WorkflowStatus::Active => Cell::new(d.status).fg(Color::Green),
            WorkflowStatus::Draft => Cell::new(d.status).fg(Color::Yellow),
            WorkflowStatus::Archived => Cell::new(d.status).fg(Color::DarkGrey),
        };
        table.add_row(vec![
            Cell::new(d.id),
            Cell::new(&d.name),
            Cell::new(&d.version),
            status,
            Cell::new(&d.category),
            Cell::new(d.steps.len()),
            Cell::new(d.stats.execution_count),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id, "workflow")?;
    let def = state.store.require_workflow(&id).await?;

    if json {
        return print_json(&def);
    }

    println!();
    println!(
        "  {} {} {}",
        style("Workflow:").bold(),
        style(&def.name).cyan(),
        style(format!("v{}", def.version)).dim()
    );
    if !def.description.is_empty() {
        println!("  {}", def.description);
    }
    println!("  ID: {}", def.id);
    println!("  Status: {}", def.status);
    println!("  Mode: {:?}  Errors: {:?}", def.execution_mode, def.error_handling);
    println!(
        "  Limits: {}s per run, {} parallel steps",
        def.max_execution_time, def.max_parallel_steps
    );
    println!(
        "  Runs: {} ({} succeeded, avg {})",
        def.stats.execution_count,
        def.stats.success_count,
        format_duration((def.stats.execution_count > 0).then_some(def.stats.average_execution_time))
    );

    if !def.steps.is_empty() {
        let mut table = Table::new();
        table
            .load_preset(presets::UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec![
                Cell::new("Step").fg(Color::Cyan),
                Cell::new("Tool"),
                Cell::new("Timeout"),
                Cell::new("Retries"),
                Cell::new("Group"),
                Cell::new("Flags"),
            ]);
        for step in &def.steps {
            let mut flags = Vec::new();
            if !step.enabled {
                flags.push("disabled");
            }
            if step.optional {
                flags.push("optional");
            }
            if !step.conditions.is_empty() {
                flags.push("conditional");
            }
            table.add_row(vec![
                Cell::new(&step.id),
                Cell::new(&step.tool_id),
                Cell::new(format!("{}s", step.timeout)),
                Cell::new(step.retry_count),
                Cell::new(step.parallel_group.as_deref().unwrap_or("-")),
                Cell::new(flags.join(", ")),
            ]);
        }
        println!();
        println!("{table}");
    }

    if !def.connections.is_empty() {
        println!();
        println!("  {}", style("Connections:").bold());
        for conn in &def.connections {
            println!(
                "    {} -> {} {}",
                conn.source_step_id,
                conn.target_step_id,
                style(format!("({:?})", conn.connection_type)).dim()
            );
        }
    }
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Status changes / Delete / Stats
// ---------------------------------------------------------------------------

async fn handle_set_status(id: &str, status: WorkflowStatus, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id, "workflow")?;
    let def = state.store.set_status(&id, status).await?;
    let verb = match status {
        WorkflowStatus::Active => "Activated",
        WorkflowStatus::Archived => "Archived",
        WorkflowStatus::Draft => "Reverted to draft",
    };
    print_saved(verb, &def, json)
}

async fn handle_delete(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id, "workflow")?;
    if !state.store.delete_workflow(&id).await? {
        bail!("Workflow {id} not found");
    }

    if json {
        print_json(&serde_json::json!({ "deleted": id.to_string() }))
    } else {
        println!();
        println!("  {} Deleted workflow {}", style("*").green().bold(), id);
        println!();
        Ok(())
    }
}

fn handle_stats(state: &AppState, json: bool) -> Result<()> {
    let stats = state.store.get_workflow_statistics();

    if json {
        return print_json(&stats);
    }

    println!();
    println!("  {}", style("Workflow statistics").bold());
    println!();
    println!("  Workflows:   {}", stats.total_workflows);
    for (status, count) in &stats.status_counts {
        println!("    {status}: {count}");
    }
    if !stats.category_counts.is_empty() {
        let categories: Vec<String> = stats
            .category_counts
            .iter()
            .map(|(c, n)| format!("{c} ({n})"))
            .collect();
        println!("  Categories:  {}", categories.join(", "));
    }
    println!("  Executions:  {}", stats.total_executions);
    println!("  Success:     {:.1}%", stats.success_rate * 100.0);
    println!(
        "  Avg time:    {}",
        format_duration((stats.total_executions > 0).then_some(stats.average_execution_time))
    );
    println!();
    Ok(())
}
