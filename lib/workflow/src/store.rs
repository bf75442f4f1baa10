//! Persistence collaborators.
//!
//! The engine keeps no state of its own between invocations; every decision
//! re-reads workflow runs and node runs through these traits. Implementations
//! must offer read-after-write consistency, and
//! [`RunStore::insert_node_run_unless_exists`] must be atomic so concurrent
//! completions cannot schedule the same fan-in node twice.

use crate::definition::{NodeId, Workflow};
use crate::execution::{NodeRun, WorkflowRun};
use crate::status::ExecutionStatus;
use async_trait::async_trait;
use std::fmt;
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};

/// Errors from persistence operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The record to update does not exist.
    NotFound { entity: &'static str, id: String },
    /// A record with the same id already exists.
    Conflict { entity: &'static str, id: String },
    /// The backend failed.
    Backend { message: String },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict { entity, id } => write!(f, "{entity} already exists: {id}"),
            Self::Backend { message } => write!(f, "store backend error: {message}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Storage for workflow definitions.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Inserts or replaces a workflow.
    async fn save_workflow(&self, workflow: Workflow) -> Result<(), StoreError>;

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError>;
}

/// Storage for workflow runs and node runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn insert_run(&self, run: WorkflowRun) -> Result<(), StoreError>;

    async fn get_run(&self, id: WorkflowRunId) -> Result<Option<WorkflowRun>, StoreError>;

    /// Replaces a stored run.
    async fn update_run(&self, run: &WorkflowRun) -> Result<(), StoreError>;

    async fn insert_node_run(&self, node_run: NodeRun) -> Result<(), StoreError>;

    /// Inserts `node_run` unless the same run already holds a node run for
    /// the same node whose status is in `blocking`.
    ///
    /// Returns true if the node run was inserted. Check and insert happen
    /// as one atomic step.
    async fn insert_node_run_unless_exists(
        &self,
        node_run: NodeRun,
        blocking: &[ExecutionStatus],
    ) -> Result<bool, StoreError>;

    async fn get_node_run(&self, id: NodeRunId) -> Result<Option<NodeRun>, StoreError>;

    /// Replaces a stored node run.
    async fn update_node_run(&self, node_run: &NodeRun) -> Result<(), StoreError>;

    /// Node runs of `run_id` whose status is in `statuses`, in creation order.
    async fn find_node_runs(
        &self,
        run_id: WorkflowRunId,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<NodeRun>, StoreError>;

    /// Node runs of `run_id` for one node, in creation order.
    async fn find_node_runs_for_node(
        &self,
        run_id: WorkflowRunId,
        node_id: &NodeId,
    ) -> Result<Vec<NodeRun>, StoreError>;
}
