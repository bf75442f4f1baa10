//! NATS transport for work items and lifecycle events.
//!
//! - Work items go to a JetStream work-queue stream on
//!   `workflow.work.<queue>`, one durable pull consumer per queue.
//! - Lifecycle events go to `workflow.run.<run_id>` on a limits stream, so
//!   observers can replay a run from the start.

use crate::envelope::Envelope;
use crate::events::{EventError, EventPublisher, LifecycleEvent};
use crate::queue::{QueueError, TaskQueue, WorkItem, WorkSource};
use async_nats::jetstream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use switchyard_core::WorkflowRunId;

/// Subject prefix for lifecycle events.
const RUN_EVENTS_SUBJECT_PREFIX: &str = "workflow.run";

/// Subject prefix for work items.
const WORK_ITEMS_SUBJECT_PREFIX: &str = "workflow.work";

const EVENTS_STREAM_NAME: &str = "WORKFLOW_EVENTS";

const WORK_STREAM_NAME: &str = "WORKFLOW_WORK";

/// Connection settings for the NATS transport.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL.
    pub url: String,
    /// Stream name for events (defaults to WORKFLOW_EVENTS).
    #[serde(default)]
    pub events_stream_name: Option<String>,
    /// Stream name for work items (defaults to WORKFLOW_WORK).
    #[serde(default)]
    pub work_stream_name: Option<String>,
}

impl NatsConfig {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            events_stream_name: None,
            work_stream_name: None,
        }
    }

    fn events_stream(&self) -> &str {
        self.events_stream_name
            .as_deref()
            .unwrap_or(EVENTS_STREAM_NAME)
    }

    fn work_stream(&self) -> &str {
        self.work_stream_name.as_deref().unwrap_or(WORK_STREAM_NAME)
    }
}

fn run_subject(run_id: WorkflowRunId) -> String {
    format!("{RUN_EVENTS_SUBJECT_PREFIX}.{run_id}")
}

fn work_subject(queue: &str) -> String {
    format!("{WORK_ITEMS_SUBJECT_PREFIX}.{queue}")
}

fn consumer_name(queue: &str) -> String {
    format!("switchyard-{queue}")
}

async fn connect(url: &str) -> Result<jetstream::Context, String> {
    let client = async_nats::connect(url)
        .await
        .map_err(|e| format!("failed to connect to {url}: {e}"))?;
    Ok(jetstream::new(client))
}

async fn ensure_work_stream(
    jetstream: &jetstream::Context,
    config: &NatsConfig,
) -> Result<jetstream::stream::Stream, String> {
    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.work_stream().to_string(),
            subjects: vec![format!("{WORK_ITEMS_SUBJECT_PREFIX}.>")],
            storage: jetstream::stream::StorageType::File,
            retention: jetstream::stream::RetentionPolicy::WorkQueue,
            ..Default::default()
        })
        .await
        .map_err(|e| format!("failed to create work stream: {e}"))
}

/// Task queue publishing to JetStream.
pub struct NatsTaskQueue {
    jetstream: jetstream::Context,
}

impl NatsTaskQueue {
    /// Connects and makes sure the work stream exists.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the server is unreachable
    /// or the stream cannot be created.
    pub async fn connect(config: &NatsConfig) -> Result<Self, QueueError> {
        let jetstream = connect(&config.url)
            .await
            .map_err(|message| QueueError::ConnectionFailed { message })?;
        ensure_work_stream(&jetstream, config)
            .await
            .map_err(|message| QueueError::ConnectionFailed { message })?;
        Ok(Self { jetstream })
    }
}

#[async_trait]
impl TaskQueue for NatsTaskQueue {
    async fn enqueue(&self, queue: &str, mut item: Envelope<WorkItem>) -> Result<(), QueueError> {
        item.payload.queue = queue.to_string();
        let failed = |message: String| QueueError::EnqueueFailed {
            queue: queue.to_string(),
            message,
        };

        let bytes = item
            .to_json_bytes()
            .map_err(|e| failed(format!("failed to serialize work item: {e}")))?;

        self.jetstream
            .publish(work_subject(queue), bytes.into())
            .await
            .map_err(|e| failed(e.to_string()))?
            .await
            .map_err(|e| failed(e.to_string()))?;

        Ok(())
    }
}

/// Pulls work items for one queue.
pub struct NatsWorkSource {
    consumer: jetstream::consumer::Consumer<jetstream::consumer::pull::Config>,
}

impl NatsWorkSource {
    /// Connects and binds a durable consumer for `queue`.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ConnectionFailed`] if the server is unreachable
    /// or the consumer cannot be created.
    pub async fn connect(config: &NatsConfig, queue: &str) -> Result<Self, QueueError> {
        let jetstream = connect(&config.url)
            .await
            .map_err(|message| QueueError::ConnectionFailed { message })?;
        let stream = ensure_work_stream(&jetstream, config)
            .await
            .map_err(|message| QueueError::ConnectionFailed { message })?;

        let name = consumer_name(queue);
        let consumer = stream
            .get_or_create_consumer(
                &name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(name.clone()),
                    filter_subject: work_subject(queue),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("failed to create consumer: {e}"),
            })?;

        Ok(Self { consumer })
    }
}

#[async_trait]
impl WorkSource for NatsWorkSource {
    async fn next(&self) -> Result<Option<Envelope<WorkItem>>, QueueError> {
        let mut batch = self
            .consumer
            .fetch()
            .max_messages(1)
            .messages()
            .await
            .map_err(|e| QueueError::ReceiveFailed {
                message: e.to_string(),
            })?;

        let Some(message) = batch.next().await else {
            return Ok(None);
        };
        let message = message.map_err(|e| QueueError::ReceiveFailed {
            message: e.to_string(),
        })?;

        let envelope: Envelope<WorkItem> =
            Envelope::from_json_bytes(&message.payload).map_err(|e| {
                QueueError::ReceiveFailed {
                    message: format!("failed to deserialize work item: {e}"),
                }
            })?;

        // Acked on receipt; redelivery after a crash is covered by the
        // worker skipping node runs that are no longer pending.
        message.ack().await.map_err(|e| QueueError::ReceiveFailed {
            message: format!("failed to ack work item: {e}"),
        })?;

        Ok(Some(envelope))
    }
}

/// Event publisher writing to JetStream.
pub struct NatsEventPublisher {
    jetstream: jetstream::Context,
}

impl NatsEventPublisher {
    /// Connects and makes sure the events stream exists.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ConnectionFailed`] if the server is unreachable
    /// or the stream cannot be created.
    pub async fn connect(config: &NatsConfig) -> Result<Self, EventError> {
        let jetstream = connect(&config.url)
            .await
            .map_err(|message| EventError::ConnectionFailed { message })?;

        jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: config.events_stream().to_string(),
                subjects: vec![format!("{RUN_EVENTS_SUBJECT_PREFIX}.>")],
                storage: jetstream::stream::StorageType::File,
                retention: jetstream::stream::RetentionPolicy::Limits,
                ..Default::default()
            })
            .await
            .map_err(|e| EventError::ConnectionFailed {
                message: format!("failed to create events stream: {e}"),
            })?;

        Ok(Self { jetstream })
    }
}

#[async_trait]
impl EventPublisher for NatsEventPublisher {
    async fn publish(
        &self,
        run_id: WorkflowRunId,
        event: LifecycleEvent,
    ) -> Result<(), EventError> {
        let bytes = serde_json::to_vec(&event).map_err(|e| EventError::PublishFailed {
            message: format!("failed to serialize event: {e}"),
        })?;

        self.jetstream
            .publish(run_subject(run_id), bytes.into())
            .await
            .map_err(|e| EventError::PublishFailed {
                message: e.to_string(),
            })?
            .await
            .map_err(|e| EventError::PublishFailed {
                message: e.to_string(),
            })?;

        Ok(())
    }
}
