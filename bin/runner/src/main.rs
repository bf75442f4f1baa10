//! Local runner for switchyard workflows.

mod cli;
mod commands;
mod error;

use crate::cli::{Cli, Command};
use crate::error::RunnerError;
use clap::Parser;
use rootcause::prelude::Report;
use std::process;
use std::sync::Arc;
use switchyard_workflow::{EngineConfig, ExecutionStatus, NodeRegistry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(error) = run(Cli::parse()).await {
        tracing::error!(error = %error, "switchyard runner failed");
        process::exit(1);
    }
}

fn builtin_registry() -> Result<Arc<NodeRegistry>, Report<RunnerError>> {
    let registry = NodeRegistry::with_builtins().map_err(|e| RunnerError::Engine {
        details: e.to_string(),
    })?;
    Ok(Arc::new(registry))
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Report<RunnerError>> {
    let text = serde_json::to_string_pretty(value).map_err(|e| RunnerError::Engine {
        details: format!("failed to render output: {e}"),
    })?;
    println!("{text}");
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Report<RunnerError>> {
    let registry = builtin_registry()?;

    match cli.command {
        Command::Run { file, payload } => {
            let config = EngineConfig::from_env().map_err(|e| RunnerError::Config {
                details: e.to_string(),
            })?;
            let definition = commands::load_definition(&file)?;
            commands::validate(&definition, &registry)?;
            let payload = commands::parse_payload(&payload)?;

            let name = file
                .file_stem()
                .map_or_else(|| "workflow".to_string(), |s| s.to_string_lossy().into_owned());
            let summary = commands::execute(&name, definition, payload, &config, registry).await?;
            print_json(&summary)?;

            if summary.status() != ExecutionStatus::Completed {
                return Err(RunnerError::RunNotCompleted {
                    run_id: summary.run.id,
                    status: summary.status(),
                }
                .into());
            }
        }
        Command::Validate { file } => {
            let definition = commands::load_definition(&file)?;
            let order = commands::validate(&definition, &registry)?;
            tracing::info!(path = %file.display(), nodes = order.len(), "definition is valid");
            print_json(&order)?;
        }
        Command::Nodes => print_json(&registry.schemas())?,
    }

    Ok(())
}
