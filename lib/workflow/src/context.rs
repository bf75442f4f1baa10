//! Per-dispatch execution context.
//!
//! A context is rebuilt from persisted node runs for every dispatch and is
//! never cached, so a node always sees the latest committed outputs.

use crate::circuit_breaker::BreakerRegistry;
use crate::definition::NodeId;
use crate::execution::NodeRun;
use crate::expression::{ExpressionResolver, ExpressionScope, ResolutionWarning};
use crate::status::ExecutionStatus;
use serde_json::{Map, Value as JsonValue};
use std::sync::Arc;
use switchyard_core::{NodeRunId, WorkflowId, WorkflowRunId};

/// Key under which the trigger payload appears in the results map.
pub const TRIGGER_KEY: &str = "trigger";

/// Everything a node sees while executing.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: WorkflowId,
    pub run_id: WorkflowRunId,
    pub node_id: NodeId,
    pub node_run_id: NodeRunId,
    /// Node configuration with templates evaluated.
    pub resolved_config: Map<String, JsonValue>,
    /// Trigger payload and completed outputs, see [`results_map`].
    pub results: Map<String, JsonValue>,
    /// Sources of the node's incoming edges, in declaration order.
    pub predecessors: Vec<NodeId>,
    scope: ExpressionScope,
    breakers: Arc<BreakerRegistry>,
}

impl ExecutionContext {
    /// Creates an empty context for one node invocation.
    #[must_use]
    pub fn new(workflow_id: WorkflowId, run_id: WorkflowRunId, node_id: NodeId) -> Self {
        let scope = ExpressionScope::new(
            workflow_id,
            run_id,
            Vec::new(),
            JsonValue::Null,
            Default::default(),
        );
        Self {
            workflow_id,
            run_id,
            node_id,
            node_run_id: NodeRunId::new(),
            resolved_config: Map::new(),
            results: Map::new(),
            predecessors: Vec::new(),
            scope,
            breakers: Arc::new(BreakerRegistry::default()),
        }
    }

    #[must_use]
    pub fn with_node_run_id(mut self, node_run_id: NodeRunId) -> Self {
        self.node_run_id = node_run_id;
        self
    }

    #[must_use]
    pub fn with_config(mut self, resolved_config: Map<String, JsonValue>) -> Self {
        self.resolved_config = resolved_config;
        self
    }

    #[must_use]
    pub fn with_results(mut self, results: Map<String, JsonValue>) -> Self {
        self.results = results;
        self
    }

    #[must_use]
    pub fn with_predecessors(mut self, predecessors: Vec<NodeId>) -> Self {
        self.predecessors = predecessors;
        self
    }

    /// Sets the scope used by [`Self::evaluate`].
    #[must_use]
    pub fn with_scope(mut self, scope: ExpressionScope) -> Self {
        self.scope = scope;
        self
    }

    #[must_use]
    pub fn with_breakers(mut self, breakers: Arc<BreakerRegistry>) -> Self {
        self.breakers = breakers;
        self
    }

    /// Returns a resolved configuration value.
    #[must_use]
    pub fn config(&self, key: &str) -> Option<&JsonValue> {
        self.resolved_config.get(key).filter(|v| !v.is_null())
    }

    /// Returns a resolved configuration value as a string slice.
    #[must_use]
    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config(key).and_then(JsonValue::as_str)
    }

    /// Returns the output stored in the results map under `key`.
    #[must_use]
    pub fn result(&self, key: &str) -> Option<&JsonValue> {
        self.results.get(key)
    }

    /// Evaluates a bare expression against this invocation's scope.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionWarning`] if the expression is malformed.
    pub fn evaluate(&self, expression: &str) -> Result<JsonValue, ResolutionWarning> {
        ExpressionResolver::new(&self.scope).evaluate(expression)
    }

    /// Circuit breakers shared by every node in this process.
    #[must_use]
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }
}

/// Builds the results map for a run.
///
/// The trigger payload is stored under `trigger` and, if it is an object, its
/// keys are also merged in at the top level. Each completed node run then adds
/// its output under its node id and, for object outputs, merges the output's
/// keys in as well. Node runs are applied in completion order, so later
/// outputs shadow earlier ones on key collisions.
#[must_use]
pub fn results_map(trigger_payload: &JsonValue, node_runs: &[NodeRun]) -> Map<String, JsonValue> {
    let mut results = Map::new();
    results.insert(TRIGGER_KEY.to_string(), trigger_payload.clone());
    if let JsonValue::Object(fields) = trigger_payload {
        results.extend(fields.clone());
    }

    let mut completed: Vec<&NodeRun> = node_runs
        .iter()
        .filter(|nr| nr.status() == ExecutionStatus::Completed)
        .collect();
    completed.sort_by_key(|nr| nr.completed_at);

    for node_run in completed {
        let Some(output) = &node_run.output else {
            continue;
        };
        if let JsonValue::Object(fields) = output {
            results.extend(fields.clone());
        }
        results.insert(node_run.node_id.to_string(), output.clone());
    }

    results
}
