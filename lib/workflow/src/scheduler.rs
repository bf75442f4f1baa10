//! Run-level scheduling.
//!
//! The scheduler is stateless between calls. It is invoked once per trigger
//! ([`Scheduler::start_workflow`]) and once per node completion
//! ([`Scheduler::handle_node_completion`]), possibly from many workers at
//! once, and re-reads persisted runs and node runs for every decision.
//!
//! Routing after a completion follows the completed node's [`FlowControl`]:
//! - `Branch`: only edges whose label matches the output's branch label
//! - `FanOut`: every outgoing target once per item of the output
//! - `Linear` / `FanIn`: every outgoing target once
//!
//! Fan-in targets are deferred while some of their sources have not
//! completed and other work is still active. The last branch to finish
//! schedules them; an atomic insert keeps concurrent finishers from
//! scheduling twice.

use crate::definition::{EdgeDefinition, NodeDefinition, NodeId, Workflow, WorkflowDefinition};
use crate::envelope::Envelope;
use crate::error::GraphError;
use crate::events::{EventPublisher, LifecycleEvent, emit};
use crate::execution::{NodeRun, WorkflowRun};
use crate::failure::{ErrorCategory, FailureReport};
use crate::graph;
use crate::node::{BranchKind, FlowControl};
use crate::nodes::{DEFAULT_CASE, truthy};
use crate::queue::{QueueError, QueueRouter, TaskQueue, WorkItem};
use crate::registry::NodeRegistry;
use crate::status::ExecutionStatus;
use crate::store::{RunStore, StoreError, WorkflowStore};
use serde_json::{Map, Value as JsonValue, json};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};

/// Display label that marks a node as a fan-in point whatever its type.
pub const FAN_IN_LABEL: &str = "Fan In";

/// Existing node runs in these statuses block another fan-in dispatch.
const FAN_IN_BLOCKING: [ExecutionStatus; 3] = [
    ExecutionStatus::Pending,
    ExecutionStatus::Running,
    ExecutionStatus::Completed,
];

/// Errors from scheduling operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Persistence failed.
    Store(StoreError),
    /// Dispatch failed.
    Queue(QueueError),
    /// Workflow not found.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The workflow is disabled.
    WorkflowDisabled { workflow_id: WorkflowId },
    /// Run not found.
    RunNotFound { run_id: WorkflowRunId },
    /// Node run not found.
    NodeRunNotFound { node_run_id: NodeRunId },
    /// A node referenced by a run is missing from the definition.
    NodeNotFound { node_id: NodeId },
    /// Only failed node runs can be retried.
    NotRetryable {
        node_run_id: NodeRunId,
        status: ExecutionStatus,
    },
    /// The run is in a status that does not accept the operation.
    RunNotActive {
        run_id: WorkflowRunId,
        status: ExecutionStatus,
    },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Queue(e) => write!(f, "queue error: {e}"),
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::WorkflowDisabled { workflow_id } => {
                write!(f, "workflow is disabled: {workflow_id}")
            }
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::NodeRunNotFound { node_run_id } => {
                write!(f, "node run not found: {node_run_id}")
            }
            Self::NodeNotFound { node_id } => write!(f, "node not found in workflow: {node_id}"),
            Self::NotRetryable {
                node_run_id,
                status,
            } => write!(f, "node run {node_run_id} is {status}, only failed node runs can be retried"),
            Self::RunNotActive { run_id, status } => write!(f, "run {run_id} is {status}"),
        }
    }
}

impl std::error::Error for SchedulerError {}

impl From<StoreError> for SchedulerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<QueueError> for SchedulerError {
    fn from(e: QueueError) -> Self {
        Self::Queue(e)
    }
}

/// Result of [`Scheduler::start_workflow`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartOutcome {
    /// Start nodes were dispatched.
    Started { scheduled: Vec<NodeRunId> },
    /// The graph failed validation; the run was failed before dispatch.
    Rejected { error: GraphError },
    /// The run could not enter `running` from its current status.
    Skipped { status: ExecutionStatus },
}

/// Result of offering one node to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// A node run was created and enqueued.
    Scheduled(NodeRunId),
    /// A fan-in node is still waiting for other branches.
    Deferred,
    /// A fan-in node already has a node run.
    Debounced,
}

/// What [`Scheduler::handle_node_completion`] did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompletionOutcome {
    pub scheduled: Vec<NodeRunId>,
    pub deferred: Vec<NodeId>,
    pub debounced: Vec<NodeId>,
    /// True if this completion finished the run.
    pub run_completed: bool,
}

/// Drives runs through their graphs.
pub struct Scheduler {
    workflows: Arc<dyn WorkflowStore>,
    runs: Arc<dyn RunStore>,
    queue: Arc<dyn TaskQueue>,
    events: Arc<dyn EventPublisher>,
    registry: Arc<NodeRegistry>,
    router: QueueRouter,
}

impl Scheduler {
    /// Creates a scheduler with the default queue routes.
    #[must_use]
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        runs: Arc<dyn RunStore>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn EventPublisher>,
        registry: Arc<NodeRegistry>,
    ) -> Self {
        Self {
            workflows,
            runs,
            queue,
            events,
            registry,
            router: QueueRouter::default(),
        }
    }

    #[must_use]
    pub fn with_router(mut self, router: QueueRouter) -> Self {
        self.router = router;
        self
    }

    async fn load_workflow(&self, workflow_id: WorkflowId) -> Result<Workflow, SchedulerError> {
        self.workflows
            .get_workflow(workflow_id)
            .await?
            .ok_or(SchedulerError::WorkflowNotFound { workflow_id })
    }

    async fn load_run(&self, run_id: WorkflowRunId) -> Result<WorkflowRun, SchedulerError> {
        self.runs
            .get_run(run_id)
            .await?
            .ok_or(SchedulerError::RunNotFound { run_id })
    }

    async fn load_node_run(&self, node_run_id: NodeRunId) -> Result<NodeRun, SchedulerError> {
        self.runs
            .get_node_run(node_run_id)
            .await?
            .ok_or(SchedulerError::NodeRunNotFound { node_run_id })
    }

    /// Creates a pending run for an enabled workflow.
    ///
    /// # Errors
    ///
    /// Returns an error if the workflow is missing or disabled, or the run
    /// cannot be stored.
    #[tracing::instrument(skip(self, trigger_payload))]
    pub async fn create_run(
        &self,
        workflow_id: WorkflowId,
        trigger_payload: JsonValue,
    ) -> Result<WorkflowRun, SchedulerError> {
        let workflow = self.load_workflow(workflow_id).await?;
        if !workflow.is_enabled() {
            return Err(SchedulerError::WorkflowDisabled { workflow_id });
        }

        let run = WorkflowRun::new(workflow_id, trigger_payload);
        self.runs.insert_run(run.clone()).await?;
        tracing::debug!(run_id = %run.id, "created workflow run");
        Ok(run)
    }

    /// Moves a run to `running`, validates its graph and dispatches the
    /// start nodes with the trigger payload as input.
    ///
    /// A graph that fails validation fails the run before any node run is
    /// created; that is reported as [`StartOutcome::Rejected`], not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if records cannot be loaded or stored, or dispatch
    /// fails.
    #[tracing::instrument(skip(self))]
    pub async fn start_workflow(&self, run_id: WorkflowRunId) -> Result<StartOutcome, SchedulerError> {
        let mut run = self.load_run(run_id).await?;
        let workflow = match self.load_workflow(run.workflow_id).await {
            Ok(workflow) => workflow,
            Err(e) => {
                self.fail_run(run_id, &e.to_string()).await?;
                return Err(e);
            }
        };

        if !run.transition_to(ExecutionStatus::Running).is_applied() {
            tracing::warn!(run_id = %run_id, status = %run.status(), "run cannot be started");
            return Ok(StartOutcome::Skipped {
                status: run.status(),
            });
        }
        self.runs.update_run(&run).await?;
        emit(
            self.events.as_ref(),
            run_id,
            LifecycleEvent::run_started(workflow.id, run_id),
        )
        .await;
        tracing::info!(run_id = %run_id, workflow_id = %workflow.id, "workflow run started");

        let start_nodes = match self.check_graph(&workflow.definition) {
            Ok(nodes) => nodes,
            Err(error) => {
                self.fail_run(run_id, &format!("Invalid workflow graph: {error}"))
                    .await?;
                return Ok(StartOutcome::Rejected { error });
            }
        };

        let mut scheduled = Vec::new();
        for node_id in &start_nodes {
            let node = workflow
                .definition
                .node(node_id)
                .ok_or_else(|| SchedulerError::NodeNotFound {
                    node_id: node_id.clone(),
                })?;
            if let Dispatch::Scheduled(id) = self
                .dispatch(&workflow, run_id, node, run.trigger_payload.clone())
                .await?
            {
                scheduled.push(id);
            }
        }

        Ok(StartOutcome::Started { scheduled })
    }

    /// Structural checks run before dispatch; returns the start nodes.
    fn check_graph(&self, definition: &WorkflowDefinition) -> Result<Vec<NodeId>, GraphError> {
        graph::validate(definition)?;

        if let Some(node) = definition.nodes.iter().find(|n| {
            self.registry.is_trigger(&n.node_type)
                && !definition.incoming_edges(&n.node_id).is_empty()
        }) {
            return Err(GraphError::TriggerHasIncoming {
                node_id: node.node_id.clone(),
            });
        }

        let start = graph::start_nodes(&definition.nodes, &definition.edges);
        if start.is_empty() {
            return Err(GraphError::NoStartNodes);
        }
        Ok(start)
    }

    /// Offers one node of a run for dispatch.
    ///
    /// # Errors
    ///
    /// Returns an error if the run, its workflow or the node is missing, or
    /// dispatch fails.
    #[tracing::instrument(skip(self, input))]
    pub async fn schedule_node(
        &self,
        run_id: WorkflowRunId,
        node_id: &NodeId,
        input: JsonValue,
    ) -> Result<Dispatch, SchedulerError> {
        let run = self.load_run(run_id).await?;
        let workflow = self.load_workflow(run.workflow_id).await?;
        let node = workflow
            .definition
            .node(node_id)
            .ok_or_else(|| SchedulerError::NodeNotFound {
                node_id: node_id.clone(),
            })?;
        self.dispatch(&workflow, run_id, node, input).await
    }

    fn is_fan_in(&self, node: &NodeDefinition) -> bool {
        self.registry.flow(&node.node_type) == FlowControl::FanIn
            || node.label.as_deref() == Some(FAN_IN_LABEL)
    }

    async fn dispatch(
        &self,
        workflow: &Workflow,
        run_id: WorkflowRunId,
        node: &NodeDefinition,
        input: JsonValue,
    ) -> Result<Dispatch, SchedulerError> {
        let node_run = NodeRun::new(run_id, node.node_id.clone(), node.node_type.clone(), input);
        let node_run_id = node_run.id;

        if self.is_fan_in(node) {
            if self
                .should_defer(&workflow.definition, run_id, &node.node_id)
                .await?
            {
                tracing::info!(run_id = %run_id, node_id = %node.node_id, "fan-in waiting for incoming branches");
                return Ok(Dispatch::Deferred);
            }
            if !self
                .runs
                .insert_node_run_unless_exists(node_run.clone(), &FAN_IN_BLOCKING)
                .await?
            {
                tracing::info!(run_id = %run_id, node_id = %node.node_id, "fan-in already scheduled");
                return Ok(Dispatch::Debounced);
            }
            tracing::info!(run_id = %run_id, node_id = %node.node_id, "fan-in converged");
        } else {
            self.runs.insert_node_run(node_run.clone()).await?;
        }

        self.enqueue(node_run).await?;
        Ok(Dispatch::Scheduled(node_run_id))
    }

    /// A fan-in waits while some source has not completed, unless nothing
    /// else is active and no completion could ever arrive.
    async fn should_defer(
        &self,
        definition: &WorkflowDefinition,
        run_id: WorkflowRunId,
        node_id: &NodeId,
    ) -> Result<bool, SchedulerError> {
        let sources: HashSet<&NodeId> = definition
            .incoming_edges(node_id)
            .into_iter()
            .map(|edge| &edge.source)
            .collect();
        let completed: HashSet<NodeId> = self
            .runs
            .find_node_runs(run_id, &[ExecutionStatus::Completed])
            .await?
            .into_iter()
            .map(|nr| nr.node_id)
            .collect();

        let waiting = sources.iter().filter(|s| !completed.contains(**s)).count();
        if waiting == 0 {
            return Ok(false);
        }

        let active = self
            .runs
            .find_node_runs(run_id, &ExecutionStatus::ACTIVE)
            .await?;
        tracing::debug!(
            run_id = %run_id,
            node_id = %node_id,
            waiting,
            active = active.len(),
            "fan-in sources outstanding"
        );
        Ok(!active.is_empty())
    }

    async fn enqueue(&self, mut node_run: NodeRun) -> Result<(), SchedulerError> {
        let queue = self
            .router
            .route(self.registry.canonical(&node_run.node_type))
            .to_string();
        let item = WorkItem {
            run_id: node_run.run_id,
            node_run_id: node_run.id,
            node_type: node_run.node_type.clone(),
            queue: queue.clone(),
        };

        if let Err(error) = self.queue.enqueue(&queue, Envelope::new(item)).await {
            let report = FailureReport::new(error.to_string(), ErrorCategory::ExternalServiceError);
            node_run.fail(report, 0);
            self.runs.update_node_run(&node_run).await?;
            self.fail_run(
                node_run.run_id,
                &format!("Node {} could not be dispatched: {error}", node_run.node_id),
            )
            .await?;
            return Err(error.into());
        }

        emit(
            self.events.as_ref(),
            node_run.run_id,
            LifecycleEvent::node_scheduled(&node_run.node_id, node_run.id),
        )
        .await;
        tracing::info!(
            run_id = %node_run.run_id,
            node_id = %node_run.node_id,
            node_run_id = %node_run.id,
            queue = %queue,
            "node scheduled"
        );
        Ok(())
    }

    /// Routes a completed node's output to its successors and completes the
    /// run once nothing is left to do.
    ///
    /// Completions against a run that is not `running` are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if records cannot be loaded or stored, or dispatch
    /// fails.
    #[tracing::instrument(skip(self, output))]
    pub async fn handle_node_completion(
        &self,
        node_run_id: NodeRunId,
        output: &JsonValue,
    ) -> Result<CompletionOutcome, SchedulerError> {
        let node_run = self.load_node_run(node_run_id).await?;
        let run = self.load_run(node_run.run_id).await?;
        if run.status() != ExecutionStatus::Running {
            tracing::debug!(
                run_id = %run.id,
                status = %run.status(),
                "ignoring completion for inactive run"
            );
            return Ok(CompletionOutcome::default());
        }

        let workflow = self.load_workflow(run.workflow_id).await?;
        let definition = &workflow.definition;
        let outgoing = definition.outgoing_edges(&node_run.node_id);

        let mut targets: Vec<(NodeId, JsonValue)> = Vec::new();
        match self.registry.flow(&node_run.node_type) {
            FlowControl::Branch(kind) => {
                let branch = branch_label(kind, output);
                let selected = select_branch_edges(&outgoing, &branch);
                if selected.is_empty() && !outgoing.is_empty() {
                    tracing::warn!(
                        run_id = %run.id,
                        node_id = %node_run.node_id,
                        branch = %branch,
                        "no edge matches branch, dropping it"
                    );
                }
                targets.extend(
                    selected
                        .into_iter()
                        .map(|edge| (edge.target.clone(), output.clone())),
                );
            }
            FlowControl::FanOut => {
                let items = loop_items(output);
                if items.is_empty() {
                    tracing::warn!(run_id = %run.id, node_id = %node_run.node_id, "loop produced no items");
                }
                let total = items.len();
                for (index, item) in items.iter().enumerate() {
                    let payload = loop_payload(output, item, index, total);
                    for edge in &outgoing {
                        targets.push((edge.target.clone(), payload.clone()));
                    }
                }
            }
            FlowControl::Linear | FlowControl::FanIn => {
                targets.extend(
                    outgoing
                        .iter()
                        .map(|edge| (edge.target.clone(), output.clone())),
                );
            }
        }

        let mut outcome = CompletionOutcome::default();
        for (target, input) in targets {
            let node = definition
                .node(&target)
                .ok_or_else(|| SchedulerError::NodeNotFound {
                    node_id: target.clone(),
                })?;
            match self.dispatch(&workflow, run.id, node, input).await? {
                Dispatch::Scheduled(id) => outcome.scheduled.push(id),
                Dispatch::Deferred => outcome.deferred.push(target),
                Dispatch::Debounced => outcome.debounced.push(target),
            }
        }

        if outcome.scheduled.is_empty() {
            outcome.run_completed = self.complete_if_idle(run.id).await?;
        }
        Ok(outcome)
    }

    async fn complete_if_idle(&self, run_id: WorkflowRunId) -> Result<bool, SchedulerError> {
        let active = self
            .runs
            .find_node_runs(run_id, &ExecutionStatus::ACTIVE)
            .await?;
        if !active.is_empty() {
            return Ok(false);
        }

        let mut run = self.load_run(run_id).await?;
        if run.status().is_terminal() || !run.transition_to(ExecutionStatus::Completed).is_applied()
        {
            return Ok(false);
        }
        self.runs.update_run(&run).await?;
        emit(
            self.events.as_ref(),
            run_id,
            LifecycleEvent::run_completed(run_id),
        )
        .await;
        tracing::info!(run_id = %run_id, "workflow run completed");
        Ok(true)
    }

    /// Fails a run with a summary message. Returns false if the run was
    /// already terminal.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be loaded or stored.
    #[tracing::instrument(skip(self))]
    pub async fn fail_run(&self, run_id: WorkflowRunId, message: &str) -> Result<bool, SchedulerError> {
        let mut run = self.load_run(run_id).await?;
        if !run.fail(message).is_applied() {
            return Ok(false);
        }
        self.runs.update_run(&run).await?;
        tracing::error!(run_id = %run_id, error = %message, "workflow run failed");
        emit(
            self.events.as_ref(),
            run_id,
            LifecycleEvent::run_failed(run_id, message),
        )
        .await;
        Ok(true)
    }

    /// Cancels a run. Node runs already dispatched keep going; their
    /// completions become no-ops. Returns false if the run cannot be
    /// cancelled from its current status.
    ///
    /// # Errors
    ///
    /// Returns an error if the run cannot be loaded or stored.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_run(&self, run_id: WorkflowRunId) -> Result<bool, SchedulerError> {
        let mut run = self.load_run(run_id).await?;
        if !run.transition_to(ExecutionStatus::Cancelled).is_applied() {
            return Ok(false);
        }
        self.runs.update_run(&run).await?;
        emit(
            self.events.as_ref(),
            run_id,
            LifecycleEvent::run_cancelled(run_id),
        )
        .await;
        tracing::info!(run_id = %run_id, "workflow run cancelled");
        Ok(true)
    }

    /// Re-opens a failed node run and dispatches it again, resuming its run
    /// if the failure had stopped it.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::NotRetryable`] unless the node run failed,
    /// and [`SchedulerError::RunNotActive`] if its run was completed or
    /// cancelled.
    #[tracing::instrument(skip(self))]
    pub async fn retry_node_run(&self, node_run_id: NodeRunId) -> Result<(), SchedulerError> {
        let mut node_run = self.load_node_run(node_run_id).await?;
        if node_run.status() != ExecutionStatus::Failed {
            return Err(SchedulerError::NotRetryable {
                node_run_id,
                status: node_run.status(),
            });
        }

        let mut run = self.load_run(node_run.run_id).await?;
        match run.status() {
            ExecutionStatus::Running => {}
            ExecutionStatus::Failed => {
                run.transition_to(ExecutionStatus::Running);
                run.error = None;
                self.runs.update_run(&run).await?;
                tracing::info!(run_id = %run.id, "workflow run resumed for retry");
            }
            status => {
                return Err(SchedulerError::RunNotActive {
                    run_id: run.id,
                    status,
                });
            }
        }

        node_run.reopen();
        self.runs.update_node_run(&node_run).await?;
        self.enqueue(node_run).await
    }
}

/// Extracts the branch label from a branch node's output.
///
/// An array output uses its first element. `If` reads `result` (or the
/// whole output) as a boolean; `Switch` reads `matched`, lowercased.
#[must_use]
pub fn branch_label(kind: BranchKind, output: &JsonValue) -> String {
    let first;
    let output = match output {
        JsonValue::Array(items) => {
            first = items.first().cloned().unwrap_or_default();
            &first
        }
        other => other,
    };

    match kind {
        BranchKind::If => {
            let value = output.get("result").unwrap_or(output);
            let label = if truthy(value) { "true" } else { "false" };
            label.to_string()
        }
        BranchKind::Switch => {
            let matched = match output.get("matched") {
                Some(JsonValue::String(s)) => s.trim().to_lowercase(),
                Some(JsonValue::Null) | None => String::new(),
                Some(other) => other.to_string().to_lowercase(),
            };
            if matched.is_empty() {
                DEFAULT_CASE.to_string()
            } else {
                matched
            }
        }
    }
}

/// Picks the outgoing edges a branch label selects.
///
/// Labeled edges decide whenever one matches. Otherwise two deprecated
/// heuristics apply to unlabeled edges: a lone outgoing edge is followed,
/// then edge ids naming the branch (`…-true-…`, `…-true`).
#[must_use]
pub fn select_branch_edges<'a>(
    edges: &[&'a EdgeDefinition],
    branch: &str,
) -> Vec<&'a EdgeDefinition> {
    let labeled: Vec<&EdgeDefinition> = edges
        .iter()
        .copied()
        .filter(|edge| {
            edge.label
                .as_deref()
                .is_some_and(|label| label.trim().to_lowercase() == branch)
        })
        .collect();
    if !labeled.is_empty() {
        return labeled;
    }

    let unlabeled: Vec<&EdgeDefinition> = edges
        .iter()
        .copied()
        .filter(|edge| edge.label.as_deref().is_none_or(|l| l.trim().is_empty()))
        .collect();

    if edges.len() == 1 && unlabeled.len() == 1 {
        tracing::warn!(
            branch = %branch,
            target = %unlabeled[0].target,
            "branch followed through its only unlabeled edge; label the edge"
        );
        return unlabeled;
    }

    let by_id: Vec<&EdgeDefinition> = unlabeled
        .into_iter()
        .filter(|edge| {
            edge.edge_id
                .as_deref()
                .is_some_and(|id| edge_id_names_branch(id, branch))
        })
        .collect();
    for edge in &by_id {
        tracing::warn!(
            branch = %branch,
            target = %edge.target,
            "branch matched by edge id; label the edge"
        );
    }
    by_id
}

fn edge_id_names_branch(edge_id: &str, branch: &str) -> bool {
    let edge_id = edge_id.to_lowercase();
    edge_id.contains(&format!("-{branch}-")) || edge_id.ends_with(&format!("-{branch}"))
}

/// Item list of a fan-out output: the output itself if it is an array,
/// else its `items` or `data` array.
#[must_use]
pub fn loop_items(output: &JsonValue) -> Vec<JsonValue> {
    match output {
        JsonValue::Array(items) => items.clone(),
        JsonValue::Object(fields) => ["items", "data"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(JsonValue::as_array))
            .cloned()
            .unwrap_or_default(),
        _ => Vec::new(),
    }
}

fn loop_payload(output: &JsonValue, item: &JsonValue, index: usize, total: usize) -> JsonValue {
    let mut payload = match output {
        JsonValue::Object(fields) => fields.clone(),
        other => {
            let mut fields = Map::new();
            fields.insert("data".to_string(), other.clone());
            fields
        }
    };
    payload.insert(
        "loop".to_string(),
        json!({ "item": item, "index": index, "total": total }),
    );
    payload.insert("item".to_string(), item.clone());
    JsonValue::Object(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventKind;
    use crate::memory::{InMemoryQueue, InMemoryStore, MemoryEventLog};

    struct Harness {
        store: Arc<InMemoryStore>,
        queue: Arc<InMemoryQueue>,
        events: Arc<MemoryEventLog>,
        scheduler: Scheduler,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let queue = Arc::new(InMemoryQueue::new());
        let events = Arc::new(MemoryEventLog::new());
        let registry = Arc::new(NodeRegistry::with_builtins().expect("builtins"));
        let scheduler = Scheduler::new(
            store.clone(),
            store.clone(),
            queue.clone(),
            events.clone(),
            registry,
        );
        Harness {
            store,
            queue,
            events,
            scheduler,
        }
    }

    impl Harness {
        async fn run(&self, definition: WorkflowDefinition, payload: JsonValue) -> WorkflowRunId {
            let workflow = Workflow::new("test", definition);
            self.store
                .save_workflow(workflow.clone())
                .await
                .expect("save");
            self.scheduler
                .create_run(workflow.id, payload)
                .await
                .expect("create")
                .id
        }

        fn node_runs(&self, run_id: WorkflowRunId, node: &str) -> Vec<NodeRun> {
            self.store
                .node_runs(run_id)
                .into_iter()
                .filter(|nr| nr.node_id.as_str() == node)
                .collect()
        }

        /// Marks the first node run of `node` completed and hands it back.
        async fn finish(
            &self,
            run_id: WorkflowRunId,
            node: &str,
            output: JsonValue,
        ) -> CompletionOutcome {
            let mut node_run = self
                .node_runs(run_id, node)
                .into_iter()
                .find(|nr| nr.status() == ExecutionStatus::Pending)
                .expect("pending node run");
            node_run.transition_to(ExecutionStatus::Running);
            node_run.complete(output.clone(), 1);
            self.store.update_node_run(&node_run).await.expect("update");
            self.scheduler
                .handle_node_completion(node_run.id, &output)
                .await
                .expect("handle")
        }

        async fn status(&self, run_id: WorkflowRunId) -> ExecutionStatus {
            self.store
                .get_run(run_id)
                .await
                .expect("get")
                .expect("run")
                .status()
        }
    }

    struct RejectingQueue;

    #[async_trait::async_trait]
    impl TaskQueue for RejectingQueue {
        async fn enqueue(&self, queue: &str, _item: Envelope<WorkItem>) -> Result<(), QueueError> {
            Err(QueueError::EnqueueFailed {
                queue: queue.to_string(),
                message: "stream unavailable".to_string(),
            })
        }
    }

    fn def(nodes: &[(&str, &str)], edges: Vec<EdgeDefinition>) -> WorkflowDefinition {
        WorkflowDefinition::new(
            nodes
                .iter()
                .map(|(id, ty)| NodeDefinition::new(*id, *ty))
                .collect(),
            edges,
        )
    }

    #[tokio::test]
    async fn enqueue_failure_fails_the_run() {
        let store = Arc::new(InMemoryStore::new());
        let events = Arc::new(MemoryEventLog::new());
        let scheduler = Scheduler::new(
            store.clone(),
            store.clone(),
            Arc::new(RejectingQueue),
            events.clone(),
            Arc::new(NodeRegistry::with_builtins().expect("builtins")),
        );
        let workflow = Workflow::new("test", def(&[("t", "trigger.manual")], Vec::new()));
        store.save_workflow(workflow.clone()).await.expect("save");
        let run = scheduler
            .create_run(workflow.id, json!({}))
            .await
            .expect("create");

        let err = scheduler.start_workflow(run.id).await.expect_err("enqueue");
        assert!(matches!(err, SchedulerError::Queue(_)));

        let node_runs = store.node_runs(run.id);
        assert_eq!(node_runs.len(), 1);
        assert_eq!(node_runs[0].status(), ExecutionStatus::Failed);

        let run = store.get_run(run.id).await.expect("get").expect("run");
        assert_eq!(run.status(), ExecutionStatus::Failed);
        assert!(run.error.as_deref().is_some_and(|e| e.contains("could not be dispatched")));
        assert_eq!(events.kinds(run.id).last(), Some(&EventKind::RunFailed));
    }

    #[tokio::test]
    async fn start_dispatches_start_nodes_with_trigger_payload() {
        let h = harness();
        let run_id = h
            .run(
                def(
                    &[("t", "trigger.manual"), ("a", "utility.noop")],
                    vec![EdgeDefinition::new("t", "a")],
                ),
                json!({"x": 1}),
            )
            .await;

        let outcome = h.scheduler.start_workflow(run_id).await.expect("start");
        assert!(matches!(outcome, StartOutcome::Started { ref scheduled } if scheduled.len() == 1));
        assert_eq!(h.status(run_id).await, ExecutionStatus::Running);

        let history = h.queue.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].node_type, "trigger.manual");
        assert_eq!(history[0].queue, "trigger_queue");
        assert_eq!(h.node_runs(run_id, "t")[0].input, json!({"x": 1}));
        assert_eq!(
            h.events.kinds(run_id),
            vec![EventKind::RunStarted, EventKind::NodeScheduled]
        );
    }

    #[tokio::test]
    async fn cyclic_graph_fails_run_without_node_runs() {
        let h = harness();
        let run_id = h
            .run(
                def(
                    &[("a", "utility.noop"), ("b", "utility.noop")],
                    vec![EdgeDefinition::new("a", "b"), EdgeDefinition::new("b", "a")],
                ),
                json!({}),
            )
            .await;

        let outcome = h.scheduler.start_workflow(run_id).await.expect("start");
        assert!(matches!(
            outcome,
            StartOutcome::Rejected {
                error: GraphError::Cyclic { .. }
            }
        ));
        assert_eq!(h.status(run_id).await, ExecutionStatus::Failed);
        assert!(h.store.node_runs(run_id).is_empty());
        assert_eq!(
            h.events.kinds(run_id),
            vec![EventKind::RunStarted, EventKind::RunFailed]
        );
    }

    #[tokio::test]
    async fn trigger_with_incoming_edge_is_rejected() {
        let h = harness();
        let run_id = h
            .run(
                def(
                    &[("a", "utility.noop"), ("t", "trigger.manual")],
                    vec![EdgeDefinition::new("a", "t")],
                ),
                json!({}),
            )
            .await;

        let outcome = h.scheduler.start_workflow(run_id).await.expect("start");
        assert_eq!(
            outcome,
            StartOutcome::Rejected {
                error: GraphError::TriggerHasIncoming {
                    node_id: NodeId::from("t")
                }
            }
        );
        assert!(h.store.node_runs(run_id).is_empty());
    }

    #[tokio::test]
    async fn empty_graph_has_no_start_nodes() {
        let h = harness();
        let run_id = h.run(WorkflowDefinition::default(), json!({})).await;
        let outcome = h.scheduler.start_workflow(run_id).await.expect("start");
        assert_eq!(
            outcome,
            StartOutcome::Rejected {
                error: GraphError::NoStartNodes
            }
        );
        assert_eq!(h.status(run_id).await, ExecutionStatus::Failed);
    }

    #[tokio::test]
    async fn if_branch_follows_matching_label_only() {
        let h = harness();
        let run_id = h
            .run(
                def(
                    &[("b", "logic.if"), ("c", "utility.noop"), ("d", "utility.noop")],
                    vec![
                        EdgeDefinition::new("b", "c").with_label("true"),
                        EdgeDefinition::new("b", "d").with_label("false"),
                    ],
                ),
                json!({}),
            )
            .await;
        h.scheduler.start_workflow(run_id).await.expect("start");

        let outcome = h
            .finish(run_id, "b", json!({"result": true, "branch_taken": "true"}))
            .await;
        assert_eq!(outcome.scheduled.len(), 1);
        assert_eq!(h.node_runs(run_id, "c").len(), 1);
        assert!(h.node_runs(run_id, "d").is_empty());

        let outcome = h.finish(run_id, "c", json!({})).await;
        assert!(outcome.run_completed);
        assert_eq!(h.status(run_id).await, ExecutionStatus::Completed);
        assert_eq!(h.events.kinds(run_id).last(), Some(&EventKind::RunCompleted));
    }

    #[tokio::test]
    async fn fan_in_defers_until_every_branch_completes() {
        let h = harness();
        let run_id = h
            .run(
                def(
                    &[
                        ("t", "trigger.manual"),
                        ("a", "utility.noop"),
                        ("b", "utility.noop"),
                        ("c", "utility.noop"),
                        ("m", "logic.merge"),
                    ],
                    vec![
                        EdgeDefinition::new("t", "a"),
                        EdgeDefinition::new("t", "b"),
                        EdgeDefinition::new("t", "c"),
                        EdgeDefinition::new("a", "m"),
                        EdgeDefinition::new("b", "m"),
                        EdgeDefinition::new("c", "m"),
                    ],
                ),
                json!({}),
            )
            .await;
        h.scheduler.start_workflow(run_id).await.expect("start");
        assert_eq!(h.finish(run_id, "t", json!({})).await.scheduled.len(), 3);

        for branch in ["a", "b"] {
            let outcome = h.finish(run_id, branch, json!({})).await;
            assert_eq!(outcome.deferred, vec![NodeId::from("m")]);
            assert!(!outcome.run_completed);
            assert!(h.node_runs(run_id, "m").is_empty());
        }

        let outcome = h.finish(run_id, "c", json!({})).await;
        assert_eq!(outcome.scheduled.len(), 1);
        assert_eq!(h.node_runs(run_id, "m").len(), 1);

        // A late duplicate offer is debounced.
        let again = h
            .scheduler
            .schedule_node(run_id, &NodeId::from("m"), json!({}))
            .await
            .expect("schedule");
        assert_eq!(again, Dispatch::Debounced);
        assert_eq!(h.node_runs(run_id, "m").len(), 1);

        assert!(h.finish(run_id, "m", json!({})).await.run_completed);
    }

    #[tokio::test]
    async fn fan_in_label_marks_any_node_type() {
        let h = harness();
        let mut definition = def(
            &[
                ("a", "utility.noop"),
                ("b", "utility.noop"),
                ("j", "utility.noop"),
            ],
            vec![EdgeDefinition::new("a", "j"), EdgeDefinition::new("b", "j")],
        );
        definition.nodes[2] = NodeDefinition::new("j", "utility.noop").with_label(FAN_IN_LABEL);
        let run_id = h.run(definition, json!({})).await;
        h.scheduler.start_workflow(run_id).await.expect("start");

        let outcome = h.finish(run_id, "a", json!({})).await;
        assert_eq!(outcome.deferred, vec![NodeId::from("j")]);
        let outcome = h.finish(run_id, "b", json!({})).await;
        assert_eq!(outcome.scheduled.len(), 1);
    }

    #[tokio::test]
    async fn fan_out_schedules_each_target_per_item() {
        let h = harness();
        let run_id = h
            .run(
                def(
                    &[("l", "logic.loop"), ("x", "utility.noop"), ("y", "utility.noop")],
                    vec![EdgeDefinition::new("l", "x"), EdgeDefinition::new("l", "y")],
                ),
                json!({}),
            )
            .await;
        h.scheduler.start_workflow(run_id).await.expect("start");

        let outcome = h
            .finish(run_id, "l", json!({"items": ["p", "q", "r"], "total": 3}))
            .await;
        assert_eq!(outcome.scheduled.len(), 6);

        let xs = h.node_runs(run_id, "x");
        assert_eq!(xs.len(), 3);
        for (index, node_run) in xs.iter().enumerate() {
            assert_eq!(node_run.input["loop"]["index"], index);
            assert_eq!(node_run.input["loop"]["total"], 3);
            assert_eq!(node_run.input["item"], node_run.input["loop"]["item"]);
        }
        assert_eq!(xs[1].input["item"], "q");
    }

    #[tokio::test]
    async fn completion_after_cancel_is_ignored() {
        let h = harness();
        let run_id = h
            .run(
                def(
                    &[("t", "trigger.manual"), ("a", "utility.noop")],
                    vec![EdgeDefinition::new("t", "a")],
                ),
                json!({}),
            )
            .await;
        h.scheduler.start_workflow(run_id).await.expect("start");
        assert!(h.scheduler.cancel_run(run_id).await.expect("cancel"));
        assert!(!h.scheduler.cancel_run(run_id).await.expect("cancel twice"));

        let outcome = h.finish(run_id, "t", json!({})).await;
        assert_eq!(outcome, CompletionOutcome::default());
        assert!(h.node_runs(run_id, "a").is_empty());
        assert_eq!(h.status(run_id).await, ExecutionStatus::Cancelled);
        assert!(h.events.kinds(run_id).contains(&EventKind::RunCancelled));
    }

    #[tokio::test]
    async fn retry_reopens_failed_node_run_and_resumes_run() {
        let h = harness();
        let run_id = h
            .run(def(&[("a", "utility.noop")], Vec::new()), json!({}))
            .await;
        h.scheduler.start_workflow(run_id).await.expect("start");

        let mut node_run = h.node_runs(run_id, "a").remove(0);
        let err = h
            .scheduler
            .retry_node_run(node_run.id)
            .await
            .expect_err("pending is not retryable");
        assert!(matches!(err, SchedulerError::NotRetryable { .. }));

        node_run.transition_to(ExecutionStatus::Running);
        node_run.fail(FailureReport::new("boom", ErrorCategory::Unknown), 1);
        h.store.update_node_run(&node_run).await.expect("update");
        h.scheduler
            .fail_run(run_id, "Node a failed: boom")
            .await
            .expect("fail");
        let queued = h.queue.len();

        h.scheduler.retry_node_run(node_run.id).await.expect("retry");
        assert_eq!(h.status(run_id).await, ExecutionStatus::Running);
        assert_eq!(h.node_runs(run_id, "a")[0].status(), ExecutionStatus::Pending);
        assert_eq!(h.queue.len(), queued + 1);
    }

    #[tokio::test]
    async fn disabled_workflow_cannot_run() {
        let h = harness();
        let mut workflow = Workflow::new("off", WorkflowDefinition::default());
        workflow.metadata.enabled = false;
        h.store.save_workflow(workflow.clone()).await.expect("save");

        let err = h
            .scheduler
            .create_run(workflow.id, json!({}))
            .await
            .expect_err("disabled");
        assert!(matches!(err, SchedulerError::WorkflowDisabled { .. }));
    }

    #[test]
    fn if_label_reads_result_or_first_element() {
        assert_eq!(branch_label(BranchKind::If, &json!({"result": true})), "true");
        assert_eq!(branch_label(BranchKind::If, &json!({"result": "no"})), "false");
        assert_eq!(branch_label(BranchKind::If, &json!([{"result": 1}])), "true");
        assert_eq!(branch_label(BranchKind::If, &json!(false)), "false");
    }

    #[test]
    fn switch_label_defaults() {
        assert_eq!(branch_label(BranchKind::Switch, &json!({"matched": " Gold "})), "gold");
        assert_eq!(branch_label(BranchKind::Switch, &json!({"matched": null})), "default");
        assert_eq!(branch_label(BranchKind::Switch, &json!({})), "default");
    }

    #[test]
    fn labeled_edges_win_over_heuristics() {
        let labeled = EdgeDefinition::new("b", "c").with_label("True");
        let by_id = EdgeDefinition::new("b", "d").with_id("edge-true-d");
        let edges = vec![&labeled, &by_id];
        let selected = select_branch_edges(&edges, "true");
        assert_eq!(selected, vec![&labeled]);
    }

    #[test]
    fn unlabeled_fallbacks() {
        let only = EdgeDefinition::new("b", "c");
        assert_eq!(select_branch_edges(&[&only], "false"), vec![&only]);

        let t = EdgeDefinition::new("b", "c").with_id("b-true");
        let f = EdgeDefinition::new("b", "d").with_id("xy-false-1");
        let edges = vec![&t, &f];
        assert_eq!(select_branch_edges(&edges, "false"), vec![&f]);
        assert_eq!(select_branch_edges(&edges, "true"), vec![&t]);
        assert!(select_branch_edges(&edges, "maybe").is_empty());
    }

    #[test]
    fn loop_items_sources() {
        assert_eq!(loop_items(&json!([1, 2])).len(), 2);
        assert_eq!(loop_items(&json!({"items": [1, 2, 3]})).len(), 3);
        assert_eq!(loop_items(&json!({"data": [1]})).len(), 1);
        assert!(loop_items(&json!({"other": [1]})).is_empty());
        assert!(loop_items(&json!("x")).is_empty());
    }

    #[test]
    fn loop_payload_wraps_scalar_output() {
        let payload = loop_payload(&json!(7), &json!("a"), 0, 1);
        assert_eq!(payload["data"], 7);
        assert_eq!(payload["loop"], json!({"item": "a", "index": 0, "total": 1}));
    }
}
