//! Runner commands.

use crate::error::RunnerError;
use rootcause::prelude::Report;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::path::Path;
use std::sync::Arc;
use switchyard_workflow::events::EventPublisher;
use switchyard_workflow::{
    Engine, EngineConfig, ExecutionStatus, InMemoryQueue, InMemoryStore, MemoryEventLog,
    NatsEventPublisher, NodeId, NodeRegistry, NodeRun, Workflow, WorkflowDefinition, WorkflowRun,
    graph,
};

/// Final state of a local run.
#[derive(Debug, Serialize)]
pub struct RunSummary {
    pub run: WorkflowRun,
    pub node_runs: Vec<NodeRun>,
}

impl RunSummary {
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        self.run.status()
    }
}

/// Reads a definition document from disk.
///
/// # Errors
///
/// Returns [`RunnerError::ReadFailed`] or [`RunnerError::InvalidDefinition`].
pub fn load_definition(path: &Path) -> Result<WorkflowDefinition, Report<RunnerError>> {
    let text = std::fs::read_to_string(path).map_err(|e| RunnerError::ReadFailed {
        path: path.to_path_buf(),
        details: e.to_string(),
    })?;
    let definition =
        WorkflowDefinition::from_json_str(&text).map_err(|e| RunnerError::InvalidDefinition {
            path: path.to_path_buf(),
            details: e.to_string(),
        })?;
    Ok(definition)
}

/// # Errors
///
/// Returns [`RunnerError::InvalidPayload`] if `text` is not JSON.
pub fn parse_payload(text: &str) -> Result<JsonValue, Report<RunnerError>> {
    let payload = serde_json::from_str(text).map_err(|e| RunnerError::InvalidPayload {
        details: e.to_string(),
    })?;
    Ok(payload)
}

/// Checks the graph structure and that every node type is registered.
///
/// Returns the topological order.
///
/// # Errors
///
/// Returns [`RunnerError::InvalidGraph`] for structural problems and
/// [`RunnerError::UnknownNodeTypes`] for unregistered types.
pub fn validate(
    definition: &WorkflowDefinition,
    registry: &NodeRegistry,
) -> Result<Vec<NodeId>, Report<RunnerError>> {
    let order = graph::validate(definition).map_err(|e| RunnerError::InvalidGraph {
        details: e.to_string(),
    })?;

    for node in &definition.nodes {
        if registry.is_trigger(&node.node_type)
            && !definition.incoming_edges(&node.node_id).is_empty()
        {
            return Err(RunnerError::InvalidGraph {
                details: format!("trigger node {} must not have incoming edges", node.node_id),
            }
            .into());
        }
    }

    let mut unknown: Vec<String> = definition
        .nodes
        .iter()
        .filter(|node| !registry.contains(&node.node_type))
        .map(|node| node.node_type.clone())
        .collect();
    unknown.sort();
    unknown.dedup();
    if !unknown.is_empty() {
        return Err(RunnerError::UnknownNodeTypes {
            node_types: unknown,
        }
        .into());
    }

    Ok(order)
}

fn engine_error(e: impl std::fmt::Display) -> RunnerError {
    RunnerError::Engine {
        details: e.to_string(),
    }
}

/// Executes a definition until no work is left.
///
/// Runs and node runs live in memory. Lifecycle events go to NATS when
/// `config.nats` is set.
///
/// # Errors
///
/// Returns [`RunnerError::Engine`] if the engine or a collaborator fails.
/// A run that ends failed is not an error here; see [`RunSummary::status`].
pub async fn execute(
    name: &str,
    definition: WorkflowDefinition,
    payload: JsonValue,
    config: &EngineConfig,
    registry: Arc<NodeRegistry>,
) -> Result<RunSummary, Report<RunnerError>> {
    let store = Arc::new(InMemoryStore::new());
    let queue = Arc::new(InMemoryQueue::new());
    let events: Arc<dyn EventPublisher> = match &config.nats {
        Some(nats) => {
            tracing::info!(url = %nats.url, "publishing lifecycle events to NATS");
            Arc::new(NatsEventPublisher::connect(nats).await.map_err(engine_error)?)
        }
        None => Arc::new(MemoryEventLog::new()),
    };

    let engine = Engine::new(
        config,
        registry,
        store.clone(),
        store,
        queue.clone(),
        events,
    );

    let workflow_id = engine
        .save_workflow(Workflow::new(name, definition))
        .await
        .map_err(engine_error)?;
    let run_id = engine
        .start_execution(workflow_id, payload)
        .await
        .map_err(engine_error)?;
    let processed = engine.drain(queue.as_ref()).await.map_err(engine_error)?;

    let run = engine.get_run(run_id).await.map_err(engine_error)?;
    let node_runs = engine.node_runs(run_id).await.map_err(engine_error)?;
    tracing::info!(
        run_id = %run_id,
        status = %run.status(),
        processed,
        "local run finished"
    );

    Ok(RunSummary { run, node_runs })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn registry() -> NodeRegistry {
        NodeRegistry::with_builtins().expect("registry")
    }

    fn write_definition(value: &JsonValue) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(value.to_string().as_bytes()).expect("write");
        file
    }

    fn branching() -> JsonValue {
        json!({
            "nodes": [
                {"node_id": "start", "node_type": "trigger.manual"},
                {"node_id": "check", "node_type": "logic.if", "config": {"condition": "input.amount >= 100"}},
                {"node_id": "big", "node_type": "utility.noop"},
                {"node_id": "small", "node_type": "utility.noop"}
            ],
            "edges": [
                {"source": "start", "target": "check"},
                {"source": "check", "target": "big", "label": "true"},
                {"source": "check", "target": "small", "label": "false"}
            ]
        })
    }

    #[test]
    fn loads_definition_from_file() {
        let file = write_definition(&branching());
        let definition = load_definition(file.path()).expect("load");
        assert_eq!(definition.nodes.len(), 4);
        assert_eq!(definition.edges[1].label.as_deref(), Some("true"));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = load_definition(&dir.path().join("absent.json")).expect_err("missing");
        assert!(err.to_string().contains("failed to read"));
    }

    #[test]
    fn malformed_document_is_rejected() {
        let file = write_definition(&json!({"nodes": [{"node_type": "utility.noop"}]}));
        let err = load_definition(file.path()).expect_err("invalid");
        assert!(err.to_string().contains("invalid workflow definition"));
    }

    #[test]
    fn validate_returns_topological_order() {
        let definition: WorkflowDefinition =
            serde_json::from_value(branching()).expect("definition");
        let order = validate(&definition, &registry()).expect("valid");
        assert_eq!(order[0], NodeId::from("start"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn validate_lists_unknown_types() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "nodes": [
                {"node_id": "a", "node_type": "slack.send"},
                {"node_id": "b", "node_type": "slack.send"},
                {"node_id": "c", "node_type": "sheets.append"}
            ]
        }))
        .expect("definition");
        let err = validate(&definition, &registry()).expect_err("unknown");
        assert!(err.to_string().contains("sheets.append, slack.send"));
    }

    #[test]
    fn validate_rejects_trigger_with_incoming_edge() {
        let definition: WorkflowDefinition = serde_json::from_value(json!({
            "nodes": [
                {"node_id": "a", "node_type": "utility.noop"},
                {"node_id": "hook", "node_type": "trigger.webhook"}
            ],
            "edges": [{"source": "a", "target": "hook"}]
        }))
        .expect("definition");
        let err = validate(&definition, &registry()).expect_err("trigger");
        assert!(err.to_string().contains("trigger node hook"));
    }

    #[test]
    fn payload_must_be_json() {
        assert_eq!(parse_payload(r#"{"a": 1}"#).expect("json"), json!({"a": 1}));
        assert!(parse_payload("{a: 1}").is_err());
    }

    #[tokio::test]
    async fn executes_definition_in_memory() {
        let definition: WorkflowDefinition =
            serde_json::from_value(branching()).expect("definition");
        let summary = execute(
            "orders",
            definition,
            json!({"amount": 250}),
            &EngineConfig::default(),
            Arc::new(registry()),
        )
        .await
        .expect("execute");

        assert_eq!(summary.status(), ExecutionStatus::Completed);
        let executed: Vec<&str> = summary
            .node_runs
            .iter()
            .map(|nr| nr.node_id.as_str())
            .collect();
        assert_eq!(executed, ["start", "check", "big"]);
    }
}
