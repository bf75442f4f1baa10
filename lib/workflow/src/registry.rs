//! Node registry.
//!
//! Maps a node-type key to its implementation. The registry is assembled
//! once through [`NodeRegistryBuilder`] and is read-only afterwards, so it
//! can be shared between workers behind an `Arc` without locking.

use crate::nodes;
use crate::node::{FlowControl, Node, NodeError, NodeKind, NodeSchema, SelectOption};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Legacy type names and the node each resolves to.
const BUILTIN_ALIASES: &[(&str, &str)] = &[
    ("if", "logic.if"),
    ("condition.if", "logic.if"),
    ("switch", "logic.switch"),
    ("condition.switch", "logic.switch"),
    ("loop", "logic.loop"),
    ("data.loop", "logic.loop"),
    ("merge", "logic.merge"),
    ("manual.trigger", "trigger.manual"),
    ("webhook.receive", "trigger.webhook"),
];

/// Errors raised while assembling a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Two implementations claim the same type key.
    DuplicateNodeType { node_type: String },
    /// An alias points at a type that was never registered.
    DanglingAlias { alias: String, target: String },
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateNodeType { node_type } => {
                write!(f, "node type registered twice: {node_type}")
            }
            Self::DanglingAlias { alias, target } => {
                write!(f, "alias {alias} points at unregistered node type {target}")
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Collects node implementations before freezing them into a [`NodeRegistry`].
#[derive(Default)]
pub struct NodeRegistryBuilder {
    nodes: Vec<Arc<dyn Node>>,
    aliases: Vec<(String, String)>,
}

impl NodeRegistryBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node implementation, keyed by its schema name.
    #[must_use]
    pub fn register(mut self, node: impl Node + 'static) -> Self {
        self.nodes.push(Arc::new(node));
        self
    }

    /// Adds an alternative name for a registered type.
    #[must_use]
    pub fn alias(mut self, alias: impl Into<String>, target: impl Into<String>) -> Self {
        self.aliases.push((alias.into(), target.into()));
        self
    }

    /// Adds the engine's built-in trigger and logic nodes and their aliases.
    #[must_use]
    pub fn with_builtins(self) -> Self {
        let builder = self
            .register(nodes::ManualTrigger)
            .register(nodes::WebhookTrigger)
            .register(nodes::IfNode)
            .register(nodes::SwitchNode)
            .register(nodes::LoopNode)
            .register(nodes::MergeNode)
            .register(nodes::ParallelNode)
            .register(nodes::DelayNode)
            .register(nodes::NoopNode);

        BUILTIN_ALIASES
            .iter()
            .fold(builder, |b, (alias, target)| b.alias(*alias, *target))
    }

    /// Freezes the registry.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if a type key is registered twice or an
    /// alias targets an unknown type.
    pub fn build(self) -> Result<NodeRegistry, RegistryError> {
        let mut nodes = HashMap::with_capacity(self.nodes.len());
        for node in self.nodes {
            let node_type = node.schema().name;
            if nodes.contains_key(&node_type) {
                return Err(RegistryError::DuplicateNodeType { node_type });
            }
            nodes.insert(node_type, node);
        }

        let mut aliases = HashMap::with_capacity(self.aliases.len());
        for (alias, target) in self.aliases {
            if !nodes.contains_key(&target) {
                return Err(RegistryError::DanglingAlias { alias, target });
            }
            aliases.insert(alias, target);
        }

        Ok(NodeRegistry { nodes, aliases })
    }
}

/// Immutable lookup table from node type to implementation.
pub struct NodeRegistry {
    nodes: HashMap<String, Arc<dyn Node>>,
    aliases: HashMap<String, String>,
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<&String> = self.nodes.keys().collect();
        types.sort();
        f.debug_struct("NodeRegistry")
            .field("types", &types)
            .field("aliases", &self.aliases.len())
            .finish()
    }
}

impl NodeRegistry {
    #[must_use]
    pub fn builder() -> NodeRegistryBuilder {
        NodeRegistryBuilder::new()
    }

    /// A registry holding only the built-in nodes.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the built-in set is inconsistent.
    pub fn with_builtins() -> Result<Self, RegistryError> {
        NodeRegistryBuilder::new().with_builtins().build()
    }

    /// Resolves an alias to its canonical type key.
    #[must_use]
    pub fn canonical<'a>(&'a self, node_type: &'a str) -> &'a str {
        self.aliases
            .get(node_type)
            .map_or(node_type, String::as_str)
    }

    /// Looks up a node implementation.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::UnknownNodeType`] if nothing is registered under
    /// `node_type` or an alias of it. The miss is permanent, never retried.
    pub fn get(&self, node_type: &str) -> Result<Arc<dyn Node>, NodeError> {
        self.nodes
            .get(self.canonical(node_type))
            .cloned()
            .ok_or_else(|| NodeError::UnknownNodeType {
                node_type: node_type.to_string(),
            })
    }

    #[must_use]
    pub fn contains(&self, node_type: &str) -> bool {
        self.nodes.contains_key(self.canonical(node_type))
    }

    /// Flow control of a type; unknown types are treated as linear.
    #[must_use]
    pub fn flow(&self, node_type: &str) -> FlowControl {
        self.get(node_type)
            .map_or(FlowControl::Linear, |node| node.flow())
    }

    /// Returns true if `node_type` is a registered trigger.
    #[must_use]
    pub fn is_trigger(&self, node_type: &str) -> bool {
        self.get(node_type)
            .is_ok_and(|node| node.schema().kind == NodeKind::Trigger)
    }

    /// Schemas of every registered type, sorted by name.
    #[must_use]
    pub fn schemas(&self) -> Vec<NodeSchema> {
        let mut schemas: Vec<NodeSchema> = self.nodes.values().map(|n| n.schema()).collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Invokes a named options method of a node type.
    ///
    /// # Errors
    ///
    /// Returns [`NodeError::UnknownNodeType`] for an unregistered type and
    /// [`NodeError::UnknownOptionsMethod`] if the node has no such method.
    pub async fn load_options(
        &self,
        node_type: &str,
        method: &str,
        config: &Map<String, JsonValue>,
    ) -> Result<Vec<SelectOption>, NodeError> {
        let node = self.get(node_type)?;
        let provider = node
            .options()
            .filter(|p| p.methods().iter().any(|m| *m == method))
            .ok_or_else(|| NodeError::UnknownOptionsMethod {
                method: method.to_string(),
            })?;
        provider.load_options(method, config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ExecutionContext;
    use crate::node::BranchKind;
    use async_trait::async_trait;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl Node for Echo {
        fn schema(&self) -> NodeSchema {
            NodeSchema::new("test.echo", "Echo", NodeKind::Action)
        }

        async fn execute(
            &self,
            _context: &ExecutionContext,
            input: JsonValue,
        ) -> Result<JsonValue, NodeError> {
            Ok(input)
        }
    }

    #[test]
    fn builtins_resolve_through_aliases() {
        let registry = NodeRegistry::with_builtins().expect("builtins");

        assert_eq!(registry.canonical("condition.if"), "logic.if");
        assert_eq!(registry.flow("if"), FlowControl::Branch(BranchKind::If));
        assert_eq!(
            registry.flow("condition.switch"),
            FlowControl::Branch(BranchKind::Switch)
        );
        assert_eq!(registry.flow("data.loop"), FlowControl::FanOut);
        assert_eq!(registry.flow("merge"), FlowControl::FanIn);
        assert!(registry.is_trigger("trigger.webhook"));
        assert!(!registry.is_trigger("logic.delay"));
    }

    #[test]
    fn miss_is_unknown_node_type() {
        let registry = NodeRegistry::with_builtins().expect("builtins");
        let err = registry.get("slack.send").err().expect("should miss");
        assert_eq!(
            err,
            NodeError::UnknownNodeType {
                node_type: "slack.send".to_string()
            }
        );
        assert_eq!(registry.flow("slack.send"), FlowControl::Linear);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let err = NodeRegistry::builder()
            .register(Echo)
            .register(Echo)
            .build()
            .expect_err("duplicate");
        assert!(matches!(err, RegistryError::DuplicateNodeType { .. }));
    }

    #[test]
    fn dangling_alias_is_rejected() {
        let err = NodeRegistry::builder()
            .register(Echo)
            .alias("echo", "test.missing")
            .build()
            .expect_err("dangling");
        assert!(err.to_string().contains("test.missing"));
    }

    #[test]
    fn schemas_are_sorted() {
        let registry = NodeRegistry::builder()
            .with_builtins()
            .register(Echo)
            .build()
            .expect("registry");
        let names: Vec<String> = registry.schemas().into_iter().map(|s| s.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
        assert!(names.contains(&"test.echo".to_string()));
    }

    #[tokio::test]
    async fn load_options_dispatches_to_provider() {
        let registry = NodeRegistry::with_builtins().expect("builtins");
        let mut config = Map::new();
        config.insert("cases".to_string(), json!({"high": 1, "low": 2}));

        let options = registry
            .load_options("switch", "list_cases", &config)
            .await
            .expect("options");
        let values: Vec<JsonValue> = options.into_iter().map(|o| o.value).collect();
        assert!(values.contains(&json!("high")));
        assert!(values.contains(&json!("default")));

        let err = registry
            .load_options("logic.if", "list_cases", &config)
            .await
            .expect_err("no provider");
        assert!(matches!(err, NodeError::UnknownOptionsMethod { .. }));
    }
}
