//! Task-queue collaborator and queue routing.
//!
//! Node runs are dispatched as [`WorkItem`]s wrapped in an [`Envelope`].
//! Queues are partitioned by dependency class so a slow AI provider cannot
//! starve I/O connectors, and vice versa.

use crate::envelope::Envelope;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use switchyard_core::{NodeRunId, WorkflowRunId};

pub const DEFAULT_QUEUE: &str = "default";
pub const AI_QUEUE: &str = "ai_queue";
pub const IO_QUEUE: &str = "io_queue";
pub const TRIGGER_QUEUE: &str = "trigger_queue";

const DEFAULT_ROUTES: &[(&str, &str)] = &[
    ("ai", AI_QUEUE),
    ("ai.llm", AI_QUEUE),
    ("ai.agent", AI_QUEUE),
    ("http.request", IO_QUEUE),
    ("webhook", IO_QUEUE),
    ("email", IO_QUEUE),
    ("slack.send", IO_QUEUE),
    ("discord.send", IO_QUEUE),
    ("whatsapp.send", IO_QUEUE),
    ("google_sheets.read", IO_QUEUE),
    ("google_sheets.write", IO_QUEUE),
    ("trigger", TRIGGER_QUEUE),
];

/// One unit of dispatched work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub run_id: WorkflowRunId,
    pub node_run_id: NodeRunId,
    pub node_type: String,
    /// Queue the item was routed to.
    pub queue: String,
}

/// Errors from queue operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Could not reach the queue backend.
    ConnectionFailed { message: String },
    /// Publishing an item failed.
    EnqueueFailed { queue: String, message: String },
    /// Receiving an item failed.
    ReceiveFailed { message: String },
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionFailed { message } => write!(f, "queue connection failed: {message}"),
            Self::EnqueueFailed { queue, message } => {
                write!(f, "failed to enqueue on {queue}: {message}")
            }
            Self::ReceiveFailed { message } => write!(f, "failed to receive work: {message}"),
        }
    }
}

impl std::error::Error for QueueError {}

/// Producer side of the task queue. Delivery is at least once.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, queue: &str, item: Envelope<WorkItem>) -> Result<(), QueueError>;
}

/// Consumer side of the task queue.
#[async_trait]
pub trait WorkSource: Send + Sync {
    /// Takes the next item, or `None` if nothing is waiting.
    async fn next(&self) -> Result<Option<Envelope<WorkItem>>, QueueError>;
}

/// Picks a queue for a node type.
///
/// An exact match on the type wins, then a match on the part before the
/// first `.`, then the default queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueRouter {
    routes: BTreeMap<String, String>,
    default_queue: String,
}

impl Default for QueueRouter {
    fn default() -> Self {
        Self {
            routes: DEFAULT_ROUTES
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            default_queue: DEFAULT_QUEUE.to_string(),
        }
    }
}

impl QueueRouter {
    /// Adds or replaces routes on top of the defaults.
    #[must_use]
    pub fn with_routes(mut self, routes: impl IntoIterator<Item = (String, String)>) -> Self {
        self.routes.extend(routes);
        self
    }

    #[must_use]
    pub fn route(&self, node_type: &str) -> &str {
        if let Some(queue) = self.routes.get(node_type) {
            return queue;
        }
        let prefix = node_type.split('.').next().unwrap_or(node_type);
        self.routes
            .get(prefix)
            .map_or(self.default_queue.as_str(), String::as_str)
    }
}
