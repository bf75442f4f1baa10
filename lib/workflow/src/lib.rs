//! Workflow execution engine for switchyard.
//!
//! This crate runs directed graphs of typed nodes, including:
//!
//! - **Graph Analysis**: Start nodes, cycle detection and topological order over petgraph
//! - **State Machine**: Guarded status transitions for runs and node runs
//! - **Expressions**: `{{ ... }}` templates resolved against prior node outputs
//! - **Nodes**: The node contract, an immutable registry and the built-in logic nodes
//! - **Failure Handling**: Error classification, retry with backoff, circuit breakers
//! - **Scheduling**: Dispatch, branch selection, fan-out and fan-in synchronization
//! - **Transport**: Task queue and event collaborators, in memory or over NATS JetStream

pub mod circuit_breaker;
pub mod config;
pub mod context;
pub mod definition;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod events;
pub mod execution;
pub mod expression;
pub mod failure;
pub mod graph;
pub mod memory;
pub mod nats;
pub mod node;
pub mod nodes;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod status;
pub mod store;
pub mod worker;

pub use circuit_breaker::{BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use config::EngineConfig;
pub use context::ExecutionContext;
pub use definition::{
    EdgeDefinition, NodeDefinition, NodeId, Workflow, WorkflowDefinition, WorkflowMetadata,
};
pub use engine::Engine;
pub use envelope::Envelope;
pub use error::{EngineError, GraphError};
pub use events::{EventPublisher, LifecycleEvent};
pub use execution::{NodeRun, WorkflowRun};
pub use expression::{ExpressionResolver, ExpressionScope, ResolutionWarning};
pub use failure::{ErrorCategory, ErrorClassifier, ErrorContext, RetryHandler, RetryPolicy};
pub use memory::{InMemoryQueue, InMemoryStore, MemoryEventLog};
pub use nats::{NatsConfig, NatsEventPublisher, NatsTaskQueue, NatsWorkSource};
pub use node::{ErrorPolicy, FlowControl, Node, NodeError, NodeKind, NodeSchema};
pub use queue::{TaskQueue, WorkItem, WorkSource};
pub use registry::{NodeRegistry, NodeRegistryBuilder};
pub use scheduler::Scheduler;
pub use status::ExecutionStatus;
pub use store::{RunStore, WorkflowStore};
pub use worker::{WorkOutcome, Worker, WorkerSettings};
