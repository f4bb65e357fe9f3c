//! mcpflow command-line entry point.
//!
//! Binary name: `mcpflow`
//!
//! Parses CLI arguments, initializes the database and services, then
//! dispatches to the matching command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use mcpflow_observe::tracing_setup::{LogFormat, init_tracing, shutdown_tracing, verbosity_filter};

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let format = if cli.log_json {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    };
    if let Err(e) = init_tracing(verbosity_filter(cli.verbose, cli.quiet), format, cli.otel) {
        eprintln!("Warning: failed to initialize logging: {e}");
    }

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "mcpflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    let result = match cli.command {
        Commands::Workflow { action } => cli::workflow::handle_workflow_command(action, &state, cli.json).await,
        Commands::Run {
            workflow_id,
            param,
            by,
            trigger,
        } => cli::execution::run_workflow(&state, &workflow_id, &param, &by, &trigger, cli.json).await,
        Commands::Execution { action } => cli::execution::handle_execution_command(action, &state, cli.json).await,
        Commands::Template { action } => cli::template::handle_template_command(action, &state, cli.json).await,
        Commands::Status => cli::status(&state, cli.json),
        Commands::Completions { .. } => Ok(()),
    };

    shutdown_tracing();
    result
}
