//! Workflow definition types.
//!
//! A workflow is a named, versioned automation made of:
//! - Metadata (name, description, version, timestamps)
//! - A definition: the node and edge lists that make up the graph
//!
//! The definition is snapshotted into every run, so edits to a workflow
//! never affect runs already in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use switchyard_core::WorkflowId;
use std::fmt;

/// Graph-local identifier of a node.
///
/// Unlike run identifiers these are chosen by the workflow author and only
/// need to be unique within one definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node id from any string-like value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// A node as authored in a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Unique id within the definition.
    pub node_id: NodeId,
    /// Registry key of the implementation (e.g. `logic.if`).
    pub node_type: String,
    /// Display label shown in editors.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Node configuration; string values may contain `{{ }}` expressions.
    #[serde(default)]
    pub config: Map<String, JsonValue>,
}

impl NodeDefinition {
    /// Creates a node with an empty configuration.
    #[must_use]
    pub fn new(node_id: impl Into<NodeId>, node_type: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            node_type: node_type.into(),
            label: None,
            config: Map::new(),
        }
    }

    /// Sets a single configuration key.
    #[must_use]
    pub fn with_config(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.config.insert(key.into(), value);
        self
    }

    /// Sets the display label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }
}

/// A directed connection between two nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EdgeDefinition {
    /// Editor-assigned id. Only consulted by the legacy branch matcher.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_id: Option<String>,
    pub source: NodeId,
    pub target: NodeId,
    /// Branch label (`true`, `false`, a switch case, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Output socket on the source node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    /// Input socket on the target node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
}

impl EdgeDefinition {
    /// Creates an unlabeled edge.
    #[must_use]
    pub fn new(source: impl Into<NodeId>, target: impl Into<NodeId>) -> Self {
        Self {
            edge_id: None,
            source: source.into(),
            target: target.into(),
            label: None,
            source_handle: None,
            target_handle: None,
        }
    }

    /// Sets the branch label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the editor id.
    #[must_use]
    pub fn with_id(mut self, edge_id: impl Into<String>) -> Self {
        self.edge_id = Some(edge_id.into());
        self
    }
}

/// The node and edge lists that make up a workflow graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    #[serde(default)]
    pub edges: Vec<EdgeDefinition>,
}

impl WorkflowDefinition {
    /// Creates a definition from node and edge lists.
    #[must_use]
    pub fn new(nodes: Vec<NodeDefinition>, edges: Vec<EdgeDefinition>) -> Self {
        Self { nodes, edges }
    }

    /// Parses a definition from JSON text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not a valid definition document.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Returns the node with the given id.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|n| &n.node_id == node_id)
    }

    /// Returns the edges leaving `node_id`, in declaration order.
    pub fn outgoing_edges(&self, node_id: &NodeId) -> Vec<&EdgeDefinition> {
        self.edges.iter().filter(|e| &e.source == node_id).collect()
    }

    /// Returns the edges entering `node_id`, in declaration order.
    pub fn incoming_edges(&self, node_id: &NodeId) -> Vec<&EdgeDefinition> {
        self.edges.iter().filter(|e| &e.target == node_id).collect()
    }
}

/// Metadata for a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetadata {
    /// Human-readable name for this workflow.
    pub name: String,
    /// Description of what this workflow does.
    pub description: Option<String>,
    /// Semantic version of this workflow definition.
    pub version: String,
    /// Whether this workflow accepts new triggers.
    pub enabled: bool,
    /// Tags for organization/filtering.
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowMetadata {
    /// Creates new metadata with default values.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            name: name.into(),
            description: None,
            version: "0.1.0".to_string(),
            enabled: true,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Sets the description.
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Adds a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }
}

/// A stored workflow: identity, metadata and the graph to execute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: WorkflowId,
    pub metadata: WorkflowMetadata,
    pub definition: WorkflowDefinition,
}

impl Workflow {
    /// Creates a workflow with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, definition: WorkflowDefinition) -> Self {
        Self::with_id(WorkflowId::new(), name, definition)
    }

    /// Creates a workflow with a specific id.
    #[must_use]
    pub fn with_id(
        id: WorkflowId,
        name: impl Into<String>,
        definition: WorkflowDefinition,
    ) -> Self {
        Self {
            id,
            metadata: WorkflowMetadata::new(name),
            definition,
        }
    }

    /// Returns the workflow name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns whether the workflow is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.metadata.enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn branching() -> WorkflowDefinition {
        WorkflowDefinition::new(
            vec![
                NodeDefinition::new("a", "trigger.manual"),
                NodeDefinition::new("b", "logic.if"),
                NodeDefinition::new("c", "utility.noop"),
                NodeDefinition::new("d", "utility.noop"),
            ],
            vec![
                EdgeDefinition::new("a", "b"),
                EdgeDefinition::new("b", "c").with_label("true"),
                EdgeDefinition::new("b", "d").with_label("false"),
            ],
        )
    }

    #[test]
    fn outgoing_edges_keep_declaration_order() {
        let def = branching();
        let targets: Vec<_> = def
            .outgoing_edges(&NodeId::from("b"))
            .iter()
            .map(|e| e.target.as_str())
            .collect();
        assert_eq!(targets, vec!["c", "d"]);
    }

    #[test]
    fn incoming_edges_by_target() {
        let def = branching();
        assert_eq!(def.incoming_edges(&NodeId::from("b")).len(), 1);
        assert!(def.incoming_edges(&NodeId::from("a")).is_empty());
    }

    #[test]
    fn parses_minimal_json_document() {
        let def = WorkflowDefinition::from_json_str(
            r#"{
                "nodes": [
                    {"node_id": "start", "node_type": "trigger.manual"},
                    {"node_id": "check", "node_type": "logic.if", "config": {"condition": "{{ input.ok }}"}}
                ],
                "edges": [{"source": "start", "target": "check", "edge_id": "e-1"}]
            }"#,
        )
        .expect("valid document");

        assert_eq!(def.nodes.len(), 2);
        let check = def.node(&NodeId::from("check")).expect("node present");
        assert_eq!(check.config["condition"], json!("{{ input.ok }}"));
        assert_eq!(def.edges[0].edge_id.as_deref(), Some("e-1"));
        assert!(def.edges[0].label.is_none());
    }

    #[test]
    fn workflow_carries_metadata() {
        let workflow = Workflow::new("Nightly sync", branching());
        assert_eq!(workflow.name(), "Nightly sync");
        assert!(workflow.is_enabled());
        assert_eq!(workflow.metadata.version, "0.1.0");
    }
}
