//! CLI execution subcommands and the top-level `run` command.
//!
//! `run` starts a workflow through the executor, streams step events while it
//! runs and prints the final outcome. Ctrl+C cancels the run. The remaining
//! subcommands read execution history from the repository.

use anyhow::{Result, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use tokio::sync::broadcast::error::RecvError;

use mcpflow_core::repository::workflow::WorkflowRepository;
use mcpflow_types::event::WorkflowEvent;
use mcpflow_types::execution::{ExecutionStatus, StepExecutionRecord, WorkflowExecution};

use super::{
    execution_status_cell, format_duration, parse_id, parse_params, print_json, short_id, step_status_cell,
};
use crate::state::AppState;

/// Execution history subcommands.
#[derive(Subcommand)]
pub enum ExecutionCommand {
    /// List recent executions.
    #[command(alias = "ls")]
    List {
        /// Only executions of this workflow UUID.
        #[arg(long)]
        workflow: Option<String>,

        /// Maximum number of executions to display.
        #[arg(long, default_value = "20")]
        limit: u32,
    },

    /// Show one execution with its step records.
    Show {
        /// Execution UUID.
        id: String,
    },

    /// Status counts and timings.
    Stats {
        /// Only executions of this workflow UUID.
        #[arg(long)]
        workflow: Option<String>,
    },
}

/// Handle an execution subcommand.
pub async fn handle_execution_command(cmd: ExecutionCommand, state: &AppState, json: bool) -> Result<()> {
    match cmd {
        ExecutionCommand::List { workflow, limit } => handle_list(workflow.as_deref(), limit, state, json).await,
        ExecutionCommand::Show { id } => handle_show(&id, state, json).await,
        ExecutionCommand::Stats { workflow } => handle_stats(workflow.as_deref(), state, json).await,
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Start a workflow and block until it reaches a terminal status.
pub async fn run_workflow(
    state: &AppState,
    workflow_id: &str,
    params: &[String],
    executed_by: &str,
    trigger_type: &str,
    json: bool,
) -> Result<()> {
    let workflow_id = parse_id(workflow_id, "workflow")?;
    let inputs = parse_params(params)?;

    // Subscribe first so the start event is not missed.
    let mut events = state.executor.subscribe();
    let started = state
        .executor
        .execute_workflow(&workflow_id, inputs, executed_by, trigger_type)
        .await?;
    let execution_id = started.id;

    if !json {
        println!();
        println!(
            "  {} Started execution {}",
            style("*").green().bold(),
            style(short_id(&execution_id)).cyan()
        );
    }

    let completion = state.executor.wait_for_completion(&execution_id);
    tokio::pin!(completion);
    let mut cancelled = false;

    let finished = loop {
        tokio::select! {
            result = &mut completion => break result?,
            event = events.recv() => match event {
                Ok(event) if event.execution_id() == execution_id && !json => print_event(&event),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::debug!("skipped {n} workflow events"),
                Err(RecvError::Closed) => {}
            },
            _ = tokio::signal::ctrl_c(), if !cancelled => {
                cancelled = true;
                if !json {
                    println!("  {} Cancelling...", style("!").yellow().bold());
                }
                state.executor.cancel_execution(&execution_id).await?;
            }
        }
    };

    let steps = state.store.repository().list_step_executions(&execution_id).await?;
    display_execution(&finished, &steps, json)?;

    match finished.status {
        ExecutionStatus::Completed => Ok(()),
        status => bail!(
            "execution {} {}{}",
            execution_id,
            status,
            finished
                .error_message
                .as_deref()
                .map(|m| format!(": {m}"))
                .unwrap_or_default()
        ),
    }
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::StepStarted { step_id, tool_id, .. } => {
            println!("    {} {} {}", style("→").dim(), step_id, style(format!("({tool_id})")).dim());
        }
        WorkflowEvent::StepCompleted {
            step_id, duration_ms, ..
        } => {
            println!(
                "    {} {} {}",
                style("✓").green(),
                step_id,
                style(format!("{duration_ms}ms")).dim()
            );
        }
        WorkflowEvent::StepFailed {
            step_id,
            error,
            will_retry,
            ..
        } => {
            let suffix = if *will_retry { " (retrying)" } else { "" };
            println!("    {} {}: {}{}", style("✗").red(), step_id, error, suffix);
        }
        WorkflowEvent::StepSkipped { step_id, .. } => {
            println!("    {} {} {}", style("-").blue(), step_id, style("skipped").dim());
        }
        WorkflowEvent::ExecutionStarted { workflow_name, .. } => {
            println!("  Running '{}'", style(workflow_name).cyan());
        }
        WorkflowEvent::ExecutionFinished { .. } | WorkflowEvent::ExecutionCancelled { .. } => {}
    }
}

// ---------------------------------------------------------------------------
// Display
// ---------------------------------------------------------------------------

fn display_execution(execution: &WorkflowExecution, steps: &[StepExecutionRecord], json: bool) -> Result<()> {
    if json {
        return print_json(&serde_json::json!({
            "execution": execution,
            "steps": steps,
        }));
    }

    println!();
    println!(
        "  {} {}",
        style("Execution:").bold(),
        style(execution.id).cyan()
    );
    println!("  Workflow: {} (v{})", execution.workflow_id, execution.workflow_version);
    println!("  Status: {}", execution.status);
    println!("  By: {} ({})", execution.executed_by, execution.trigger_type);
    if let Some(start) = execution.start_time {
        println!("  Started: {}", start.format("%Y-%m-%d %H:%M:%S"));
    }
    println!("  Duration: {}", format_duration(execution.execution_time));
    if let Some(err) = &execution.error_message {
        println!("  Error: {}", style(err).red());
    }

    if steps.is_empty() && !execution.step_executions.is_empty() {
        // Steps that never started have no record; fall back to the summary.
        let mut table = step_table(&["Step", "Status"]);
        for (step_id, outcome) in &execution.step_executions {
            table.add_row(vec![Cell::new(step_id), step_status_cell(outcome.status)]);
        }
        println!();
        println!("{table}");
    } else if !steps.is_empty() {
        let mut table = step_table(&["Step", "Tool", "Status", "Retries", "Duration", "Error"]);
        for record in steps {
            table.add_row(vec![
                Cell::new(&record.step_id),
                Cell::new(&record.tool_id),
                step_status_cell(record.status),
                Cell::new(record.retry_count),
                Cell::new(format_duration(record.execution_time)),
                Cell::new(record.error_message.as_deref().unwrap_or("")),
            ]);
        }
        println!();
        println!("{table}");
    }

    if let Some(result) = &execution.result {
        if !result.is_empty() {
            println!();
            println!("  {}", style("Result:").bold());
            let pretty = serde_json::to_string_pretty(result)?;
            for line in pretty.lines() {
                println!("    {line}");
            }
        }
    }
    println!();
    Ok(())
}

fn step_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .iter()
                .enumerate()
                .map(|(i, h)| if i == 0 { Cell::new(h).fg(Color::Cyan) } else { Cell::new(h) })
                .collect::<Vec<_>>(),
        );
    table
}

// ---------------------------------------------------------------------------
// List / Show / Stats
// ---------------------------------------------------------------------------

async fn handle_list(workflow: Option<&str>, limit: u32, state: &AppState, json: bool) -> Result<()> {
    let workflow_id = workflow.map(|w| parse_id(w, "workflow")).transpose()?;
    let executions = state
        .store
        .repository()
        .list_executions(workflow_id.as_ref(), limit)
        .await?;

    if json {
        return print_json(&executions);
    }

    if executions.is_empty() {
        println!();
        println!("  No executions recorded.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Execution").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("By"),
            Cell::new("Created"),
            Cell::new("Duration"),
        ]);

    for e in &executions {
        table.add_row(vec![
            Cell::new(e.id),
            Cell::new(short_id(&e.workflow_id)),
            execution_status_cell(e.status),
            Cell::new(&e.executed_by),
            Cell::new(e.created_at.format("%Y-%m-%d %H:%M").to_string()),
            Cell::new(format_duration(e.execution_time)),
        ]);
    }

    println!();
    println!("{table}");
    println!();
    Ok(())
}

async fn handle_show(id: &str, state: &AppState, json: bool) -> Result<()> {
    let id = parse_id(id, "execution")?;
    let execution = match state.executor.get_execution(&id).await? {
        Some(execution) => execution,
        None => bail!("Execution {id} not found"),
    };
    let steps = state.store.repository().list_step_executions(&id).await?;
    display_execution(&execution, &steps, json)
}

async fn handle_stats(workflow: Option<&str>, state: &AppState, json: bool) -> Result<()> {
    let workflow_id = workflow.map(|w| parse_id(w, "workflow")).transpose()?;
    let stats = state.executor.get_execution_statistics(workflow_id.as_ref()).await?;

    if json {
        return print_json(&stats);
    }

    println!();
    println!("  {}", style("Execution statistics").bold());
    println!();
    println!("  Total:     {}", stats.total_executions);
    println!("  Active:    {}", stats.active_executions);
    for (status, count) in &stats.status_counts {
        println!("    {status}: {count}");
    }
    println!(
        "  Avg time:  {}",
        format_duration((stats.total_executions > 0).then_some(stats.average_execution_time))
    );
    if !stats.recent.is_empty() {
        println!();
        println!("  {}", style("Recent:").bold());
        for e in &stats.recent {
            println!(
                "    {}  {:<9}  {}",
                short_id(&e.id),
                e.status.as_str(),
                e.created_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }
    println!();
    Ok(())
}
