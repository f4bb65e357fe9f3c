//! CLI command definitions and dispatch for the `mcpflow` binary.
//!
//! Uses clap derive macros for argument parsing. Resources are nouns with
//! verb subcommands (e.g., `mcpflow workflow list`), except `run`, which is
//! used often enough to sit at the top level.

pub mod execution;
pub mod template;
pub mod workflow;

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use comfy_table::{Cell, Color};
use console::style;
use mcpflow_core::repository::workflow::WorkflowFilter;
use mcpflow_types::execution::{ExecutionStatus, StepStatus};
use serde_json::Value;
use uuid::Uuid;

use crate::state::AppState;

/// Build, store and run MCP tool workflows.
#[derive(Parser)]
#[command(name = "mcpflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all log output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Write logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "MCPFLOW_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Manage workflow definitions.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Run an active workflow and wait for it to finish.
    Run {
        /// Workflow UUID.
        workflow_id: String,

        /// Input parameter as key=value (value parsed as JSON when possible).
        #[arg(long, short = 'p')]
        param: Vec<String>,

        /// Who is running the workflow.
        #[arg(long, default_value = "cli")]
        by: String,

        /// Trigger type recorded on the execution.
        #[arg(long, default_value = "manual")]
        trigger: String,
    },

    /// Inspect workflow executions.
    #[command(alias = "exec")]
    Execution {
        #[command(subcommand)]
        action: execution::ExecutionCommand,
    },

    /// Manage workflow templates.
    Template {
        #[command(subcommand)]
        action: template::TemplateCommand,
    },

    /// Show data directory, database and configured tools.
    Status,

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Parse a UUID argument, naming what it identifies in the error.
pub fn parse_id(raw: &str, what: &str) -> Result<Uuid> {
    raw.trim()
        .parse::<Uuid>()
        .with_context(|| format!("Invalid {what} ID: '{raw}'"))
}

/// Parse `key=value` pairs. Values that parse as JSON keep their type;
/// anything else is taken as a string.
pub fn parse_params(pairs: &[String]) -> Result<HashMap<String, Value>> {
    let mut params = HashMap::new();
    for pair in pairs {
        let Some((key, raw)) = pair.split_once('=') else {
            bail!("Invalid parameter '{pair}': expected key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid parameter '{pair}': empty key");
        }
        let value = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
        params.insert(key.to_string(), value);
    }
    Ok(params)
}

pub fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn short_id(id: &Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

pub fn execution_status_cell(status: ExecutionStatus) -> Cell {
    let color = match status {
        ExecutionStatus::Pending => Color::DarkGrey,
        ExecutionStatus::Active => Color::Yellow,
        ExecutionStatus::Completed => Color::Green,
        ExecutionStatus::Failed => Color::Red,
        ExecutionStatus::Cancelled => Color::Magenta,
    };
    Cell::new(status).fg(color)
}

pub fn step_status_cell(status: StepStatus) -> Cell {
    let color = match status {
        StepStatus::Pending => Color::DarkGrey,
        StepStatus::Running => Color::Yellow,
        StepStatus::Completed => Color::Green,
        StepStatus::Failed => Color::Red,
        StepStatus::Skipped => Color::Blue,
    };
    Cell::new(status).fg(color)
}

pub fn format_duration(secs: Option<f64>) -> String {
    match secs {
        Some(s) if s < 1.0 => format!("{:.0}ms", s * 1000.0),
        Some(s) => format!("{s:.2}s"),
        None => "-".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

pub fn status(state: &AppState, json: bool) -> Result<()> {
    let workflows = state.store.list_workflows(&WorkflowFilter::default());
    let templates = state.store.list_templates(None);
    let mut tools: Vec<&String> = state.config.tools.keys().collect();
    tools.sort();

    if json {
        return print_json(&serde_json::json!({
            "data_dir": state.data_dir.display().to_string(),
            "database": state.database_url,
            "backups_enabled": state.config.backups_enabled,
            "workflows": workflows.len(),
            "templates": templates.len(),
            "max_concurrent_runs": state.config.executor.max_concurrent_runs,
            "tools": tools,
        }));
    }

    println!();
    println!("  {}", style("mcpflow status").bold());
    println!();
    println!("  Data dir:   {}", state.data_dir.display());
    println!("  Database:   {}", state.database_url);
    println!(
        "  Backups:    {}",
        if state.config.backups_enabled {
            style("enabled").green()
        } else {
            style("disabled").dim()
        }
    );
    println!("  Workflows:  {}", workflows.len());
    println!("  Templates:  {}", templates.len());
    println!("  Run slots:  {}", state.config.executor.max_concurrent_runs);
    if tools.is_empty() {
        println!(
            "  Tools:      {}",
            style("none configured (add [tools.<id>] to config.toml)").yellow()
        );
    } else {
        println!(
            "  Tools:      {}",
            tools.iter().map(|t| t.as_str()).collect::<Vec<_>>().join(", ")
        );
    }
    println!();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn params_keep_json_types() {
        let params = parse_params(&[
            "count=3".to_string(),
            "name=report".to_string(),
            "flags={\"dry\":true}".to_string(),
            "expr=a=b".to_string(),
        ])
        .unwrap();
        assert_eq!(params["count"], json!(3));
        assert_eq!(params["name"], json!("report"));
        assert_eq!(params["flags"], json!({"dry": true}));
        assert_eq!(params["expr"], json!("a=b"));
    }

    #[test]
    fn params_reject_malformed_pairs() {
        assert!(parse_params(&["novalue".to_string()]).is_err());
        assert!(parse_params(&["=3".to_string()]).is_err());
    }

    #[test]
    fn ids_and_durations() {
        let id = Uuid::now_v7();
        assert_eq!(parse_id(&id.to_string(), "workflow").unwrap(), id);
        let err = parse_id("nope", "workflow").unwrap_err();
        assert!(err.to_string().contains("Invalid workflow ID"));

        assert_eq!(short_id(&id).len(), 8);
        assert_eq!(format_duration(Some(0.25)), "250ms");
        assert_eq!(format_duration(Some(2.5)), "2.50s");
        assert_eq!(format_duration(None), "-");
    }

    #[test]
    fn cli_parses_run_with_params() {
        let cli = Cli::try_parse_from([
            "mcpflow", "--json", "run", "0190a0e4-0000-7000-8000-000000000000", "-p", "a=1", "--param", "b=x",
        ])
        .unwrap();
        assert!(cli.json);
        match cli.command {
            Commands::Run { param, by, .. } => {
                assert_eq!(param, vec!["a=1".to_string(), "b=x".to_string()]);
                assert_eq!(by, "cli");
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        <Cli as clap::CommandFactory>::command().debug_assert();
    }
}
