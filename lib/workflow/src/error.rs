//! Error types shared across the workflow crate.
//!
//! Errors follow the layering used throughout switchyard:
//! - `GraphError`: structural problems with a definition, raised before dispatch
//! - `EngineError`: host-facing failures, carried inside a `rootcause::Report`
//!
//! Component errors (store, queue, scheduler, worker, node execution) live
//! next to the component that raises them.

use crate::definition::NodeId;
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};
use std::fmt;

/// Structural errors found while analyzing a workflow graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// The graph contains one or more cycles.
    Cyclic { cycles: Vec<Vec<NodeId>> },
    /// An edge references a node that is not in the definition.
    DanglingEdge { source: NodeId, target: NodeId },
    /// Two nodes share the same id.
    DuplicateNode { node_id: NodeId },
    /// A trigger node has an incoming edge.
    TriggerHasIncoming { node_id: NodeId },
    /// Every node has an incoming edge, so nothing can start.
    NoStartNodes,
    /// A node referenced at runtime is missing from the definition.
    NodeNotFound { node_id: NodeId },
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cyclic { cycles } => {
                let rendered: Vec<String> = cycles
                    .iter()
                    .map(|cycle| {
                        cycle
                            .iter()
                            .map(NodeId::as_str)
                            .collect::<Vec<_>>()
                            .join(" -> ")
                    })
                    .collect();
                write!(f, "workflow contains cycles: [{}]", rendered.join("], ["))
            }
            Self::DanglingEdge { source, target } => {
                write!(f, "edge {source} -> {target} references a missing node")
            }
            Self::DuplicateNode { node_id } => write!(f, "duplicate node id: {node_id}"),
            Self::TriggerHasIncoming { node_id } => {
                write!(f, "trigger node {node_id} must not have incoming edges")
            }
            Self::NoStartNodes => write!(f, "workflow has no start nodes"),
            Self::NodeNotFound { node_id } => write!(f, "node not found: {node_id}"),
        }
    }
}

impl std::error::Error for GraphError {}

/// Errors surfaced to hosts of the engine.
///
/// Lower layers are attached as the report's cause; these variants name the
/// operation that failed and the entity it was working on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Workflow not found.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// Run (execution) not found.
    ExecutionNotFound { run_id: WorkflowRunId },
    /// Node run not found.
    NodeRunNotFound { node_run_id: NodeRunId },
    /// Saving a workflow failed.
    SaveFailed { workflow_id: WorkflowId, reason: String },
    /// Starting a run failed.
    StartFailed { workflow_id: WorkflowId, reason: String },
    /// Cancelling a run failed.
    CancelFailed { run_id: WorkflowRunId, reason: String },
    /// Retrying a node run failed.
    RetryFailed { node_run_id: NodeRunId, reason: String },
    /// Loading options for a node failed.
    OptionsFailed { node_type: String, reason: String },
    /// Processing a work item failed.
    WorkFailed { node_run_id: NodeRunId, reason: String },
    /// Receiving from the work source failed.
    QueueFailed { reason: String },
    /// Reading run state failed.
    StoreFailed { reason: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::ExecutionNotFound { run_id } => write!(f, "execution not found: {run_id}"),
            Self::NodeRunNotFound { node_run_id } => {
                write!(f, "node run not found: {node_run_id}")
            }
            Self::SaveFailed {
                workflow_id,
                reason,
            } => write!(f, "failed to save workflow {workflow_id}: {reason}"),
            Self::StartFailed {
                workflow_id,
                reason,
            } => write!(f, "failed to start workflow {workflow_id}: {reason}"),
            Self::CancelFailed { run_id, reason } => {
                write!(f, "failed to cancel run {run_id}: {reason}")
            }
            Self::RetryFailed {
                node_run_id,
                reason,
            } => write!(f, "failed to retry node run {node_run_id}: {reason}"),
            Self::OptionsFailed { node_type, reason } => {
                write!(f, "failed to load options for {node_type}: {reason}")
            }
            Self::WorkFailed {
                node_run_id,
                reason,
            } => write!(f, "failed to process node run {node_run_id}: {reason}"),
            Self::QueueFailed { reason } => write!(f, "failed to receive work: {reason}"),
            Self::StoreFailed { reason } => write!(f, "failed to read run state: {reason}"),
        }
    }
}

impl std::error::Error for EngineError {}
