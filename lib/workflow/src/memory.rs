//! In-memory collaborators.
//!
//! Back the local runner and the test suites. All state sits behind one
//! mutex per collaborator, which makes the store's check-and-insert atomic.

use crate::definition::{NodeId, Workflow};
use crate::envelope::Envelope;
use crate::events::{EventError, EventKind, EventPublisher, LifecycleEvent};
use crate::execution::{NodeRun, WorkflowRun};
use crate::queue::{QueueError, TaskQueue, WorkItem, WorkSource};
use crate::status::ExecutionStatus;
use crate::store::{RunStore, StoreError, WorkflowStore};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Default)]
struct StoreState {
    workflows: HashMap<WorkflowId, Workflow>,
    runs: HashMap<WorkflowRunId, WorkflowRun>,
    node_runs: Vec<NodeRun>,
}

/// Workflow and run storage held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every node run of a run, in creation order.
    #[must_use]
    pub fn node_runs(&self, run_id: WorkflowRunId) -> Vec<NodeRun> {
        lock(&self.state)
            .node_runs
            .iter()
            .filter(|nr| nr.run_id == run_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl WorkflowStore for InMemoryStore {
    async fn save_workflow(&self, workflow: Workflow) -> Result<(), StoreError> {
        lock(&self.state).workflows.insert(workflow.id, workflow);
        Ok(())
    }

    async fn get_workflow(&self, id: WorkflowId) -> Result<Option<Workflow>, StoreError> {
        Ok(lock(&self.state).workflows.get(&id).cloned())
    }
}

#[async_trait]
impl RunStore for InMemoryStore {
    async fn insert_run(&self, run: WorkflowRun) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.runs.contains_key(&run.id) {
            return Err(StoreError::Conflict {
                entity: "workflow run",
                id: run.id.to_string(),
            });
        }
        state.runs.insert(run.id, run);
        Ok(())
    }

    async fn get_run(&self, id: WorkflowRunId) -> Result<Option<WorkflowRun>, StoreError> {
        Ok(lock(&self.state).runs.get(&id).cloned())
    }

    async fn update_run(&self, run: &WorkflowRun) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let slot = state.runs.get_mut(&run.id).ok_or_else(|| StoreError::NotFound {
            entity: "workflow run",
            id: run.id.to_string(),
        })?;
        *slot = run.clone();
        Ok(())
    }

    async fn insert_node_run(&self, node_run: NodeRun) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.node_runs.iter().any(|nr| nr.id == node_run.id) {
            return Err(StoreError::Conflict {
                entity: "node run",
                id: node_run.id.to_string(),
            });
        }
        state.node_runs.push(node_run);
        Ok(())
    }

    async fn insert_node_run_unless_exists(
        &self,
        node_run: NodeRun,
        blocking: &[ExecutionStatus],
    ) -> Result<bool, StoreError> {
        let mut state = lock(&self.state);
        let exists = state.node_runs.iter().any(|nr| {
            nr.run_id == node_run.run_id
                && nr.node_id == node_run.node_id
                && blocking.contains(&nr.status())
        });
        if exists {
            return Ok(false);
        }
        state.node_runs.push(node_run);
        Ok(true)
    }

    async fn get_node_run(&self, id: NodeRunId) -> Result<Option<NodeRun>, StoreError> {
        Ok(lock(&self.state)
            .node_runs
            .iter()
            .find(|nr| nr.id == id)
            .cloned())
    }

    async fn update_node_run(&self, node_run: &NodeRun) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        let slot = state
            .node_runs
            .iter_mut()
            .find(|nr| nr.id == node_run.id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "node run",
                id: node_run.id.to_string(),
            })?;
        *slot = node_run.clone();
        Ok(())
    }

    async fn find_node_runs(
        &self,
        run_id: WorkflowRunId,
        statuses: &[ExecutionStatus],
    ) -> Result<Vec<NodeRun>, StoreError> {
        Ok(lock(&self.state)
            .node_runs
            .iter()
            .filter(|nr| nr.run_id == run_id && statuses.contains(&nr.status()))
            .cloned()
            .collect())
    }

    async fn find_node_runs_for_node(
        &self,
        run_id: WorkflowRunId,
        node_id: &NodeId,
    ) -> Result<Vec<NodeRun>, StoreError> {
        Ok(lock(&self.state)
            .node_runs
            .iter()
            .filter(|nr| nr.run_id == run_id && &nr.node_id == node_id)
            .cloned()
            .collect())
    }
}

/// FIFO task queue held in process memory.
///
/// Items from every named queue share one FIFO; the queue name is kept on
/// each item for inspection.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    pending: Mutex<VecDeque<Envelope<WorkItem>>>,
    history: Mutex<Vec<WorkItem>>,
}

impl InMemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Items waiting to be taken.
    #[must_use]
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        lock(&self.pending).is_empty()
    }

    /// Every item ever enqueued, in order.
    #[must_use]
    pub fn history(&self) -> Vec<WorkItem> {
        lock(&self.history).clone()
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(&self, queue: &str, mut item: Envelope<WorkItem>) -> Result<(), QueueError> {
        item.payload.queue = queue.to_string();
        lock(&self.history).push(item.payload.clone());
        lock(&self.pending).push_back(item);
        Ok(())
    }
}

#[async_trait]
impl WorkSource for InMemoryQueue {
    async fn next(&self) -> Result<Option<Envelope<WorkItem>>, QueueError> {
        Ok(lock(&self.pending).pop_front())
    }
}

/// Event publisher that records every event.
#[derive(Debug, Default)]
pub struct MemoryEventLog {
    events: Mutex<Vec<(WorkflowRunId, LifecycleEvent)>>,
}

impl MemoryEventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published for a run, in order.
    #[must_use]
    pub fn events(&self, run_id: WorkflowRunId) -> Vec<LifecycleEvent> {
        lock(&self.events)
            .iter()
            .filter(|(id, _)| *id == run_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Kinds of the events published for a run, in order.
    #[must_use]
    pub fn kinds(&self, run_id: WorkflowRunId) -> Vec<EventKind> {
        self.events(run_id).into_iter().map(|e| e.kind).collect()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventLog {
    async fn publish(
        &self,
        run_id: WorkflowRunId,
        event: LifecycleEvent,
    ) -> Result<(), EventError> {
        lock(&self.events).push((run_id, event));
        Ok(())
    }
}
