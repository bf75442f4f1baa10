//! Host-facing engine.
//!
//! `Engine` wires the scheduler and worker to one set of collaborators and
//! wraps component failures in a `rootcause::Report<EngineError>`.

use crate::circuit_breaker::{BreakerRegistry, BreakerStats};
use crate::config::EngineConfig;
use crate::definition::Workflow;
use crate::envelope::Envelope;
use crate::error::EngineError;
use crate::events::EventPublisher;
use crate::execution::{NodeRun, WorkflowRun};
use crate::node::{NodeError, SelectOption};
use crate::queue::{TaskQueue, WorkItem, WorkSource};
use crate::registry::NodeRegistry;
use crate::scheduler::{Scheduler, SchedulerError, StartOutcome};
use crate::status::ExecutionStatus;
use crate::store::{RunStore, WorkflowStore};
use crate::worker::{WorkOutcome, Worker, WorkerSettings};
use rootcause::prelude::Report;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};

/// Execution engine bound to one set of collaborators.
pub struct Engine {
    workflows: Arc<dyn WorkflowStore>,
    runs: Arc<dyn RunStore>,
    registry: Arc<NodeRegistry>,
    breakers: Arc<BreakerRegistry>,
    scheduler: Arc<Scheduler>,
    worker: Worker,
}

impl Engine {
    /// Builds an engine; breakers and worker defaults come from `config`.
    #[must_use]
    pub fn new(
        config: &EngineConfig,
        registry: Arc<NodeRegistry>,
        workflows: Arc<dyn WorkflowStore>,
        runs: Arc<dyn RunStore>,
        queue: Arc<dyn TaskQueue>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let breakers = Arc::new(BreakerRegistry::new(config.breaker_config()));
        let scheduler = Arc::new(
            Scheduler::new(
                Arc::clone(&workflows),
                Arc::clone(&runs),
                queue,
                Arc::clone(&events),
                Arc::clone(&registry),
            )
            .with_router(config.router()),
        );
        let worker = Worker::new(
            Arc::clone(&workflows),
            Arc::clone(&runs),
            events,
            Arc::clone(&registry),
            Arc::clone(&scheduler),
            Arc::clone(&breakers),
        )
        .with_settings(WorkerSettings::from_config(config));

        Self {
            workflows,
            runs,
            registry,
            breakers,
            scheduler,
            worker,
        }
    }

    /// Replaces the worker's execution defaults.
    #[must_use]
    pub fn with_worker_settings(mut self, settings: WorkerSettings) -> Self {
        self.worker = self.worker.with_settings(settings);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    #[must_use]
    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Stores a workflow, replacing any previous version with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::SaveFailed`] if the store rejects the write.
    pub async fn save_workflow(&self, workflow: Workflow) -> Result<WorkflowId, Report<EngineError>> {
        let workflow_id = workflow.id;
        self.workflows
            .save_workflow(workflow)
            .await
            .map_err(|e| EngineError::SaveFailed {
                workflow_id,
                reason: e.to_string(),
            })?;
        Ok(workflow_id)
    }

    /// Creates a run for `workflow_id` and dispatches its start nodes.
    ///
    /// A workflow whose graph is invalid still yields a run id; the run is
    /// failed before any node is scheduled.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WorkflowNotFound`] for an unknown workflow and
    /// [`EngineError::StartFailed`] if the run cannot be created or started.
    #[tracing::instrument(skip(self, trigger_payload))]
    pub async fn start_execution(
        &self,
        workflow_id: WorkflowId,
        trigger_payload: JsonValue,
    ) -> Result<WorkflowRunId, Report<EngineError>> {
        let start_failed = |e: SchedulerError| match e {
            SchedulerError::WorkflowNotFound { workflow_id } => {
                EngineError::WorkflowNotFound { workflow_id }
            }
            other => EngineError::StartFailed {
                workflow_id,
                reason: other.to_string(),
            },
        };

        let run = self
            .scheduler
            .create_run(workflow_id, trigger_payload)
            .await
            .map_err(start_failed)?;
        let outcome = self
            .scheduler
            .start_workflow(run.id)
            .await
            .map_err(start_failed)?;

        match outcome {
            StartOutcome::Started { scheduled } => {
                tracing::debug!(run_id = %run.id, scheduled = scheduled.len(), "execution started");
            }
            StartOutcome::Rejected { error } => {
                tracing::warn!(run_id = %run.id, error = %error, "workflow graph rejected");
            }
            StartOutcome::Skipped { status } => {
                tracing::warn!(run_id = %run.id, status = %status, "run was not startable");
            }
        }

        Ok(run.id)
    }

    /// Executes one work item.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::WorkFailed`] if the worker cannot process the
    /// item. Node failures are reported through [`WorkOutcome`] instead.
    pub async fn process(&self, item: Envelope<WorkItem>) -> Result<WorkOutcome, Report<EngineError>> {
        let node_run_id = item.payload().node_run_id;
        let outcome = self
            .worker
            .process(item)
            .await
            .map_err(|e| EngineError::WorkFailed {
                node_run_id,
                reason: e.to_string(),
            })?;
        Ok(outcome)
    }

    /// Takes one item from `source` and executes it.
    ///
    /// Returns `None` when the source has nothing waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::QueueFailed`] if receiving fails, or any error
    /// of [`Engine::process`].
    pub async fn process_next(
        &self,
        source: &dyn WorkSource,
    ) -> Result<Option<WorkOutcome>, Report<EngineError>> {
        let item = source.next().await.map_err(|e| EngineError::QueueFailed {
            reason: e.to_string(),
        })?;
        match item {
            Some(item) => self.process(item).await.map(Some),
            None => Ok(None),
        }
    }

    /// Executes items from `source` until it runs dry.
    ///
    /// Returns the number of items processed.
    ///
    /// # Errors
    ///
    /// Stops at the first error of [`Engine::process_next`].
    pub async fn drain(&self, source: &dyn WorkSource) -> Result<usize, Report<EngineError>> {
        let mut processed = 0;
        while self.process_next(source).await?.is_some() {
            processed += 1;
        }
        Ok(processed)
    }

    /// Cancels a run. Returns false if the run was already terminal.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ExecutionNotFound`] for an unknown run and
    /// [`EngineError::CancelFailed`] if the update fails.
    pub async fn cancel_run(&self, run_id: WorkflowRunId) -> Result<bool, Report<EngineError>> {
        let cancelled = self
            .scheduler
            .cancel_run(run_id)
            .await
            .map_err(|e| match e {
                SchedulerError::RunNotFound { run_id } => EngineError::ExecutionNotFound { run_id },
                other => EngineError::CancelFailed {
                    run_id,
                    reason: other.to_string(),
                },
            })?;
        Ok(cancelled)
    }

    /// Re-opens a failed node run and dispatches it again.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::NodeRunNotFound`] for an unknown node run and
    /// [`EngineError::RetryFailed`] if the node run or its run cannot be
    /// retried.
    pub async fn retry_node_run(&self, node_run_id: NodeRunId) -> Result<(), Report<EngineError>> {
        self.scheduler
            .retry_node_run(node_run_id)
            .await
            .map_err(|e| match e {
                SchedulerError::NodeRunNotFound { node_run_id } => {
                    EngineError::NodeRunNotFound { node_run_id }
                }
                other => EngineError::RetryFailed {
                    node_run_id,
                    reason: other.to_string(),
                },
            })?;
        Ok(())
    }

    /// # Errors
    ///
    /// Returns [`EngineError::ExecutionNotFound`] for an unknown run.
    pub async fn get_run(&self, run_id: WorkflowRunId) -> Result<WorkflowRun, Report<EngineError>> {
        let run = self
            .runs
            .get_run(run_id)
            .await
            .map_err(|e| EngineError::StoreFailed {
                reason: e.to_string(),
            })?
            .ok_or(EngineError::ExecutionNotFound { run_id })?;
        Ok(run)
    }

    /// Every node run of a run.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::StoreFailed`] if the store cannot be read.
    pub async fn node_runs(&self, run_id: WorkflowRunId) -> Result<Vec<NodeRun>, Report<EngineError>> {
        let node_runs = self
            .runs
            .find_node_runs(run_id, &ExecutionStatus::ALL)
            .await
            .map_err(|e| EngineError::StoreFailed {
                reason: e.to_string(),
            })?;
        Ok(node_runs)
    }

    /// Runs a node's options method against a partial configuration.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::OptionsFailed`] for an unknown type or method,
    /// or if the provider fails.
    pub async fn load_options(
        &self,
        node_type: &str,
        method: &str,
        config: &Map<String, JsonValue>,
    ) -> Result<Vec<SelectOption>, Report<EngineError>> {
        let options = self
            .registry
            .load_options(node_type, method, config)
            .await
            .map_err(|e: NodeError| EngineError::OptionsFailed {
                node_type: node_type.to_string(),
                reason: e.to_string(),
            })?;
        Ok(options)
    }

    /// Snapshot of every circuit breaker in this process.
    #[must_use]
    pub fn breaker_stats(&self) -> Vec<BreakerStats> {
        self.breakers.stats()
    }
}
