//! Node execution.
//!
//! A worker takes one [`WorkItem`] at a time:
//! 1. Moves the node run to `running` (skipping items that are no longer
//!    pending, which covers redelivery)
//! 2. Rebuilds the results map from persisted node runs and resolves the
//!    node's configuration and input
//! 3. Executes the node under its retry policy and time limit
//! 4. Persists the outcome and hands the completion to the scheduler
//!
//! The node's error policy decides what a final failure means: `continue`
//! substitutes a fallback output and the run proceeds, anything else fails
//! the run.

use crate::circuit_breaker::BreakerRegistry;
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, results_map};
use crate::definition::NodeId;
use crate::envelope::Envelope;
use crate::events::{EventPublisher, LifecycleEvent, emit};
use crate::execution::NodeRun;
use crate::expression::{ExpressionResolver, ExpressionScope};
use crate::failure::{RetryHandler, RetryNotice, RetryObserver, RetryPolicy, fallback_output};
use crate::node::{ErrorPolicy, NodeError};
use crate::queue::WorkItem;
use crate::registry::NodeRegistry;
use crate::scheduler::{Scheduler, SchedulerError};
use crate::status::ExecutionStatus;
use crate::store::{RunStore, StoreError, WorkflowStore};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};

/// Errors that can occur during worker operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerError {
    /// Persistence failed.
    Store(StoreError),
    /// Handing the result to the scheduler failed.
    Scheduler(SchedulerError),
    /// The envelope was written by an incompatible producer.
    UnsupportedVersion { version: u32 },
    /// The node run named by the work item does not exist.
    NodeRunNotFound { node_run_id: NodeRunId },
    /// The node run's workflow run does not exist.
    RunNotFound { run_id: WorkflowRunId },
    /// The run's workflow does not exist.
    WorkflowNotFound { workflow_id: WorkflowId },
    /// The node is missing from the run's workflow.
    NodeNotFound { node_id: NodeId },
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Store(e) => write!(f, "store error: {e}"),
            Self::Scheduler(e) => write!(f, "scheduler error: {e}"),
            Self::UnsupportedVersion { version } => {
                write!(f, "unsupported work item version: {version}")
            }
            Self::NodeRunNotFound { node_run_id } => {
                write!(f, "node run not found: {node_run_id}")
            }
            Self::RunNotFound { run_id } => write!(f, "run not found: {run_id}"),
            Self::WorkflowNotFound { workflow_id } => {
                write!(f, "workflow not found: {workflow_id}")
            }
            Self::NodeNotFound { node_id } => write!(f, "node not found in workflow: {node_id}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<StoreError> for WorkerError {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

impl From<SchedulerError> for WorkerError {
    fn from(e: SchedulerError) -> Self {
        Self::Scheduler(e)
    }
}

/// What happened to a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkOutcome {
    /// The node succeeded.
    Completed { attempts: u32 },
    /// The node failed and the continue policy substituted a fallback.
    Continued { attempts: u32 },
    /// The node failed and its run was failed.
    Failed { attempts: u32 },
    /// The node run was no longer pending.
    Skipped { status: ExecutionStatus },
}

/// Execution defaults applied when a node's configuration is silent.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerSettings {
    /// Backoff for nodes using the `retry` policy.
    pub retry: RetryPolicy,
    pub node_timeout: Duration,
    /// Variables visible to expressions under `env`.
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

impl WorkerSettings {
    /// Reads defaults from the engine configuration and the process
    /// environment.
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            retry: config.retry_policy(),
            node_timeout: config.node_timeout(),
            env: config.expression_env(),
        }
    }
}

/// Publishes `node_retrying` before each backoff.
struct RetryEvents<'a> {
    events: &'a dyn EventPublisher,
    run_id: WorkflowRunId,
    node_id: &'a NodeId,
    node_run_id: NodeRunId,
}

#[async_trait]
impl<'a> RetryObserver for RetryEvents<'a> {
    async fn on_retry(&self, notice: RetryNotice) {
        tracing::warn!(
            node_id = %self.node_id,
            attempt = notice.attempt,
            max_attempts = notice.max_attempts,
            error = %notice.error.message,
            "node attempt failed, retrying"
        );
        emit(
            self.events,
            self.run_id,
            LifecycleEvent::node_retrying(self.node_id, self.node_run_id, &notice),
        )
        .await;
    }
}

/// Executes node runs.
pub struct Worker {
    workflows: Arc<dyn WorkflowStore>,
    runs: Arc<dyn RunStore>,
    events: Arc<dyn EventPublisher>,
    registry: Arc<NodeRegistry>,
    scheduler: Arc<Scheduler>,
    breakers: Arc<BreakerRegistry>,
    settings: WorkerSettings,
}

impl Worker {
    #[must_use]
    pub fn new(
        workflows: Arc<dyn WorkflowStore>,
        runs: Arc<dyn RunStore>,
        events: Arc<dyn EventPublisher>,
        registry: Arc<NodeRegistry>,
        scheduler: Arc<Scheduler>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            workflows,
            runs,
            events,
            registry,
            scheduler,
            breakers,
            settings: WorkerSettings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Processes one work item.
    ///
    /// Node failures are not errors here: they are recorded on the node run
    /// and reported through [`WorkOutcome`].
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope version is unsupported, a record is
    /// missing, or persistence fails.
    #[tracing::instrument(skip(self, envelope), fields(node_run_id = %envelope.payload().node_run_id))]
    pub async fn process(&self, envelope: Envelope<WorkItem>) -> Result<WorkOutcome, WorkerError> {
        if !envelope.is_current_version() {
            return Err(WorkerError::UnsupportedVersion {
                version: envelope.version,
            });
        }
        let item = envelope.into_payload();

        let mut node_run = self
            .runs
            .get_node_run(item.node_run_id)
            .await?
            .ok_or(WorkerError::NodeRunNotFound {
                node_run_id: item.node_run_id,
            })?;
        if node_run.status() != ExecutionStatus::Pending {
            tracing::debug!(status = %node_run.status(), "node run is not pending, skipping");
            return Ok(WorkOutcome::Skipped {
                status: node_run.status(),
            });
        }

        let run = self
            .runs
            .get_run(node_run.run_id)
            .await?
            .ok_or(WorkerError::RunNotFound {
                run_id: node_run.run_id,
            })?;
        let workflow = self
            .workflows
            .get_workflow(run.workflow_id)
            .await?
            .ok_or(WorkerError::WorkflowNotFound {
                workflow_id: run.workflow_id,
            })?;
        let definition = workflow
            .definition
            .node(&node_run.node_id)
            .ok_or_else(|| WorkerError::NodeNotFound {
                node_id: node_run.node_id.clone(),
            })?;

        node_run.transition_to(ExecutionStatus::Running);
        self.runs.update_node_run(&node_run).await?;
        emit(
            self.events.as_ref(),
            run.id,
            LifecycleEvent::node_started(&node_run.node_id, node_run.id, &node_run.input),
        )
        .await;

        // Re-read at dispatch time; outputs committed by sibling branches
        // since scheduling must be visible.
        let completed = self
            .runs
            .find_node_runs(run.id, &[ExecutionStatus::Completed])
            .await?;
        let results = results_map(&run.trigger_payload, &completed);
        let scope = ExpressionScope::new(
            workflow.id,
            run.id,
            results.clone(),
            node_run.input.clone(),
            self.settings.env.clone(),
        );
        let resolver = ExpressionResolver::new(&scope);
        let config = resolver.resolve_map(&definition.config);
        let input = resolver.resolve(&node_run.input);

        let mut predecessors: Vec<NodeId> = Vec::new();
        for edge in workflow.definition.incoming_edges(&node_run.node_id) {
            if !predecessors.contains(&edge.source) {
                predecessors.push(edge.source.clone());
            }
        }

        let schema_policy = self
            .registry
            .get(&node_run.node_type)
            .map_or(ErrorPolicy::Stop, |node| node.schema().error_policy);
        let policy = error_policy(&config, schema_policy);
        let retry = retry_policy(&config, policy, self.settings.retry);
        let timeout = node_timeout(&config, self.settings.node_timeout);

        let context = ExecutionContext::new(workflow.id, run.id, node_run.node_id.clone())
            .with_node_run_id(node_run.id)
            .with_config(config)
            .with_results(results)
            .with_predecessors(predecessors)
            .with_scope(scope)
            .with_breakers(Arc::clone(&self.breakers));

        tracing::info!(
            run_id = %run.id,
            node_id = %node_run.node_id,
            node_type = %node_run.node_type,
            policy = %policy,
            "executing node"
        );

        let observer = RetryEvents {
            events: self.events.as_ref(),
            run_id: run.id,
            node_id: &node_run.node_id,
            node_run_id: node_run.id,
        };
        let registry = self.registry.as_ref();
        let node_type = node_run.node_type.as_str();
        let context = &context;
        let result = RetryHandler::new(retry)
            .execute_with_retry(
                move |_attempt| {
                    let input = input.clone();
                    async move {
                        let node = registry.get(node_type)?;
                        match tokio::time::timeout(timeout, node.execute(context, input)).await {
                            Ok(result) => result,
                            Err(_) => Err(NodeError::Timeout {
                                after_secs: timeout.as_secs(),
                            }),
                        }
                    }
                },
                &observer,
            )
            .await;

        match result {
            Ok(outcome) => {
                node_run.complete(outcome.value.clone(), outcome.attempts);
                self.runs.update_node_run(&node_run).await?;
                emit(
                    self.events.as_ref(),
                    run.id,
                    LifecycleEvent::node_completed(&node_run.node_id, node_run.id, &outcome.value),
                )
                .await;
                tracing::info!(
                    run_id = %run.id,
                    node_id = %node_run.node_id,
                    attempts = outcome.attempts,
                    "node completed"
                );

                self.scheduler
                    .handle_node_completion(node_run.id, &outcome.value)
                    .await?;
                Ok(WorkOutcome::Completed {
                    attempts: outcome.attempts,
                })
            }
            Err(failure) => {
                emit(
                    self.events.as_ref(),
                    run.id,
                    LifecycleEvent::node_failed(&node_run.node_id, node_run.id, &failure.context),
                )
                .await;

                if policy == ErrorPolicy::Continue {
                    let fallback = fallback_output(&failure.context);
                    node_run.complete_with_fallback(
                        fallback.clone(),
                        failure.context.to_report(),
                        failure.attempts,
                    );
                    self.runs.update_node_run(&node_run).await?;
                    emit(
                        self.events.as_ref(),
                        run.id,
                        LifecycleEvent::node_continued(
                            &node_run.node_id,
                            node_run.id,
                            &failure.context,
                        ),
                    )
                    .await;
                    tracing::warn!(
                        run_id = %run.id,
                        node_id = %node_run.node_id,
                        error = %failure.error,
                        category = %failure.context.category,
                        "node failed, continuing with fallback output"
                    );

                    self.scheduler
                        .handle_node_completion(node_run.id, &fallback)
                        .await?;
                    return Ok(WorkOutcome::Continued {
                        attempts: failure.attempts,
                    });
                }

                node_run.fail(failure.context.to_report(), failure.attempts);
                self.runs.update_node_run(&node_run).await?;
                tracing::error!(
                    run_id = %run.id,
                    node_id = %node_run.node_id,
                    error = %failure.error,
                    category = %failure.context.category,
                    attempts = failure.attempts,
                    "node failed"
                );

                let summary = format!(
                    "Node {} failed: {}",
                    node_run.node_id, failure.context.message
                );
                self.scheduler.fail_run(run.id, &summary).await?;
                Ok(WorkOutcome::Failed {
                    attempts: failure.attempts,
                })
            }
        }
    }
}

fn settings(config: &Map<String, JsonValue>) -> Option<&JsonValue> {
    config.get("settings").filter(|s| s.is_object())
}

/// `settings.on_error`, then `error_policy`, then the schema default.
fn error_policy(config: &Map<String, JsonValue>, default: ErrorPolicy) -> ErrorPolicy {
    settings(config)
        .and_then(|s| s.get("on_error"))
        .and_then(JsonValue::as_str)
        .or_else(|| config.get("error_policy").and_then(JsonValue::as_str))
        .and_then(ErrorPolicy::parse)
        .unwrap_or(default)
}

/// Only the `retry` policy retries. `settings.retry.max_attempts` is the
/// number of retries after the first attempt; absent means none.
fn retry_policy(
    config: &Map<String, JsonValue>,
    policy: ErrorPolicy,
    defaults: RetryPolicy,
) -> RetryPolicy {
    if policy != ErrorPolicy::Retry {
        return RetryPolicy::no_retry();
    }

    let retry = settings(config).and_then(|s| s.get("retry"));
    let field = |key: &str| retry.and_then(|r| r.get(key)).and_then(JsonValue::as_u64);

    RetryPolicy {
        max_retries: field("max_attempts")
            .map_or(0, |retries| u32::try_from(retries).unwrap_or(u32::MAX)),
        base_delay: field("base_delay_ms").map_or(defaults.base_delay, Duration::from_millis),
        max_delay: field("max_delay_ms").map_or(defaults.max_delay, Duration::from_millis),
    }
}

fn node_timeout(config: &Map<String, JsonValue>, default: Duration) -> Duration {
    settings(config)
        .and_then(|s| s.get("timeout_secs"))
        .and_then(JsonValue::as_f64)
        .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
        .filter(|timeout| !timeout.is_zero())
        .unwrap_or(default)
}
