//! Command-line arguments.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Runs switchyard workflow definitions locally.
///
/// Engine settings are read from `SWITCHYARD__*` environment variables.
#[derive(Debug, Parser)]
#[command(name = "switchyard")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Execute a definition to completion with in-memory storage.
    Run {
        /// Path to a workflow definition (JSON).
        file: PathBuf,

        /// Trigger payload as a JSON document.
        #[arg(long, default_value = "{}")]
        payload: String,
    },

    /// Check a definition's graph and node types without running it.
    Validate {
        /// Path to a workflow definition (JSON).
        file: PathBuf,
    },

    /// Print the schema of every registered node type.
    Nodes,
}
