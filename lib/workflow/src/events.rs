//! Lifecycle events for observers.
//!
//! Events go to a channel keyed by run id and are shaped
//! `{type, timestamp, data}`. They are for observers only: a failed publish
//! is logged and never affects execution.

use crate::definition::NodeId;
use crate::failure::{ErrorContext, RetryNotice};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use std::fmt;
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};

/// Kind of lifecycle event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    RunStarted,
    RunCompleted,
    RunFailed,
    RunCancelled,
    NodeScheduled,
    NodeStarted,
    NodeCompleted,
    NodeFailed,
    NodeRetrying,
    NodeContinued,
}

impl EventKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RunStarted => "run_started",
            Self::RunCompleted => "run_completed",
            Self::RunFailed => "run_failed",
            Self::RunCancelled => "run_cancelled",
            Self::NodeScheduled => "node_scheduled",
            Self::NodeStarted => "node_started",
            Self::NodeCompleted => "node_completed",
            Self::NodeFailed => "node_failed",
            Self::NodeRetrying => "node_retrying",
            Self::NodeContinued => "node_continued",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    pub data: JsonValue,
}

impl LifecycleEvent {
    #[must_use]
    pub fn new(kind: EventKind, data: JsonValue) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
        }
    }

    #[must_use]
    pub fn run_started(workflow_id: WorkflowId, run_id: WorkflowRunId) -> Self {
        Self::new(
            EventKind::RunStarted,
            json!({
                "workflow_id": workflow_id.to_string(),
                "execution_id": run_id.to_string(),
            }),
        )
    }

    #[must_use]
    pub fn run_completed(run_id: WorkflowRunId) -> Self {
        Self::new(
            EventKind::RunCompleted,
            json!({ "execution_id": run_id.to_string() }),
        )
    }

    #[must_use]
    pub fn run_failed(run_id: WorkflowRunId, error: &str) -> Self {
        Self::new(
            EventKind::RunFailed,
            json!({ "execution_id": run_id.to_string(), "error": error }),
        )
    }

    #[must_use]
    pub fn run_cancelled(run_id: WorkflowRunId) -> Self {
        Self::new(
            EventKind::RunCancelled,
            json!({ "execution_id": run_id.to_string() }),
        )
    }

    #[must_use]
    pub fn node_scheduled(node_id: &NodeId, node_run_id: NodeRunId) -> Self {
        Self::new(EventKind::NodeScheduled, node_data(node_id, node_run_id))
    }

    #[must_use]
    pub fn node_started(node_id: &NodeId, node_run_id: NodeRunId, input: &JsonValue) -> Self {
        let mut data = node_data(node_id, node_run_id);
        data["input_data"] = input.clone();
        Self::new(EventKind::NodeStarted, data)
    }

    #[must_use]
    pub fn node_completed(node_id: &NodeId, node_run_id: NodeRunId, result: &JsonValue) -> Self {
        let mut data = node_data(node_id, node_run_id);
        data["result"] = result.clone();
        Self::new(EventKind::NodeCompleted, data)
    }

    #[must_use]
    pub fn node_failed(node_id: &NodeId, node_run_id: NodeRunId, error: &ErrorContext) -> Self {
        let mut data = node_data(node_id, node_run_id);
        data["error"] = json!(error.message);
        data["error_category"] = json!(error.category.as_str());
        data["error_suggestion"] = json!(error.suggestion);
        data["is_retryable"] = json!(error.is_retryable);
        Self::new(EventKind::NodeFailed, data)
    }

    #[must_use]
    pub fn node_retrying(node_id: &NodeId, node_run_id: NodeRunId, notice: &RetryNotice) -> Self {
        let mut data = node_data(node_id, node_run_id);
        data["attempt"] = json!(notice.attempt);
        data["max_attempts"] = json!(notice.max_attempts);
        data["delay_seconds"] = json!(notice.delay.as_secs_f64());
        data["error"] = json!(notice.error.message);
        Self::new(EventKind::NodeRetrying, data)
    }

    #[must_use]
    pub fn node_continued(node_id: &NodeId, node_run_id: NodeRunId, error: &ErrorContext) -> Self {
        let mut data = node_data(node_id, node_run_id);
        data["error"] = json!(error.message);
        data["message"] = json!("Node failed but workflow continues (error_policy='continue')");
        Self::new(EventKind::NodeContinued, data)
    }
}

fn node_data(node_id: &NodeId, node_run_id: NodeRunId) -> JsonValue {
    json!({
        "node_id": node_id.as_str(),
        "node_execution_id": node_run_id.to_string(),
    })
}

/// Errors from event publication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    /// Could not reach the event backend.
    ConnectionFailed { message: String },
    /// Publishing failed.
    PublishFailed { message: String },
}

impl fmt::Display for EventError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => {
                write!(f, "event backend connection failed: {message}")
            }
            Self::PublishFailed { message } => write!(f, "event publish failed: {message}"),
        }
    }
}

impl std::error::Error for EventError {}

/// Pub/sub channel for lifecycle events, keyed by run id.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, run_id: WorkflowRunId, event: LifecycleEvent)
    -> Result<(), EventError>;
}

/// Publishes and logs on failure.
pub(crate) async fn emit(
    publisher: &dyn EventPublisher,
    run_id: WorkflowRunId,
    event: LifecycleEvent,
) {
    let kind = event.kind;
    match publisher.publish(run_id, event).await {
        Ok(()) => tracing::debug!(run_id = %run_id, event = %kind, "published lifecycle event"),
        Err(e) => {
            tracing::warn!(run_id = %run_id, event = %kind, error = %e, "failed to publish lifecycle event");
        }
    }
}
