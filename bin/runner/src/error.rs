//! Error types for the runner.

use std::fmt;
use std::path::PathBuf;
use switchyard_core::WorkflowRunId;
use switchyard_workflow::ExecutionStatus;

/// Errors raised by runner commands.
#[derive(Debug)]
pub enum RunnerError {
    /// The definition file could not be read.
    ReadFailed { path: PathBuf, details: String },
    /// The definition file is not a valid definition document.
    InvalidDefinition { path: PathBuf, details: String },
    /// The trigger payload is not valid JSON.
    InvalidPayload { details: String },
    /// The graph failed structural validation.
    InvalidGraph { details: String },
    /// Nodes reference types that are not registered.
    UnknownNodeTypes { node_types: Vec<String> },
    /// Engine configuration could not be loaded.
    Config { details: String },
    /// The engine or one of its collaborators failed.
    Engine { details: String },
    /// The run finished in a status other than completed.
    RunNotCompleted {
        run_id: WorkflowRunId,
        status: ExecutionStatus,
    },
}

impl fmt::Display for RunnerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadFailed { path, details } => {
                write!(f, "failed to read {}: {details}", path.display())
            }
            Self::InvalidDefinition { path, details } => {
                write!(f, "invalid workflow definition in {}: {details}", path.display())
            }
            Self::InvalidPayload { details } => write!(f, "invalid trigger payload: {details}"),
            Self::InvalidGraph { details } => write!(f, "invalid workflow graph: {details}"),
            Self::UnknownNodeTypes { node_types } => {
                write!(f, "unknown node types: {}", node_types.join(", "))
            }
            Self::Config { details } => write!(f, "configuration error: {details}"),
            Self::Engine { details } => write!(f, "engine error: {details}"),
            Self::RunNotCompleted { run_id, status } => {
                write!(f, "run {run_id} finished as {status}")
            }
        }
    }
}

impl std::error::Error for RunnerError {}
