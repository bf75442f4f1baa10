//! The node contract.
//!
//! Every node type implements [`Node`]: a declarative [`NodeSchema`], the
//! [`FlowControl`] capability the scheduler routes on, and an async
//! `execute(context, input) -> output`. Nodes that offer configuration
//! pickers expose an [`OptionsProvider`] as part of the same contract.
//!
//! `execute` may perform side effects, but it runs under at-least-once
//! dispatch and retries, so implementations must tolerate repeats.

use crate::context::ExecutionContext;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// Broad role of a node in a workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Entry point; may not have incoming edges.
    Trigger,
    /// Does work against the outside world.
    Action,
    /// Shapes control flow.
    Logic,
}

/// What happens when a node fails after its retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Fail the run.
    #[default]
    Stop,
    /// Substitute a fallback output and keep going.
    Continue,
    /// Retry transient failures, then fail the run.
    Retry,
}

impl ErrorPolicy {
    /// Parses a policy name as written in node configuration.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "stop" => Some(Self::Stop),
            "continue" => Some(Self::Continue),
            "retry" => Some(Self::Retry),
            _ => None,
        }
    }
}

impl fmt::Display for ErrorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Continue => write!(f, "continue"),
            Self::Retry => write!(f, "retry"),
        }
    }
}

/// Which branching rule a branch node follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchKind {
    /// Boolean `result` selects the `true` or `false` edge.
    If,
    /// String `matched` selects the edge with that label.
    Switch,
}

/// How the scheduler continues after a node completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "flow", content = "branch", rename_all = "snake_case")]
pub enum FlowControl {
    /// Every outgoing edge's target runs once with the output as input.
    #[default]
    Linear,
    /// Only the edges matching the output's branch label are followed.
    Branch(BranchKind),
    /// Every outgoing edge's target runs once per item of the output.
    FanOut,
    /// Waits for all incoming branches before running.
    FanIn,
}

/// A choice offered by a select input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectOption {
    pub label: String,
    pub value: JsonValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SelectOption {
    #[must_use]
    pub fn new(label: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            description: None,
        }
    }
}

/// One typed input or output of a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortDescriptor {
    pub name: String,
    /// Value type: `string`, `number`, `boolean`, `select`, `json`, ...
    #[serde(rename = "type")]
    pub port_type: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<JsonValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<SelectOption>,
    /// Options-provider method that fills this input's choices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_options_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl PortDescriptor {
    /// Creates an optional port.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        port_type: impl Into<String>,
        label: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            port_type: port_type.into(),
            label: label.into(),
            required: false,
            default: None,
            options: Vec::new(),
            load_options_method: None,
            description: None,
        }
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    #[must_use]
    pub fn with_default(mut self, default: impl Into<JsonValue>) -> Self {
        self.default = Some(default.into());
        self
    }

    #[must_use]
    pub fn with_options(mut self, options: Vec<SelectOption>) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn with_dynamic_options(mut self, method: impl Into<String>) -> Self {
        self.load_options_method = Some(method.into());
        self
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Declarative description of a node type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSchema {
    /// Registry key, e.g. `logic.if`.
    pub name: String,
    pub label: String,
    pub kind: NodeKind,
    pub description: String,
    /// Palette grouping shown in editors.
    pub category: String,
    pub inputs: Vec<PortDescriptor>,
    pub outputs: Vec<PortDescriptor>,
    /// Policy used when the node's configuration does not set one.
    pub error_policy: ErrorPolicy,
}

impl NodeSchema {
    #[must_use]
    pub fn new(name: impl Into<String>, label: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            kind,
            description: String::new(),
            category: String::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            error_policy: ErrorPolicy::Stop,
        }
    }

    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    #[must_use]
    pub fn with_input(mut self, port: PortDescriptor) -> Self {
        self.inputs.push(port);
        self
    }

    #[must_use]
    pub fn with_output(mut self, port: PortDescriptor) -> Self {
        self.outputs.push(port);
        self
    }

    #[must_use]
    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Returns the input port with the given name.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&PortDescriptor> {
        self.inputs.iter().find(|p| p.name == name)
    }
}

/// Errors raised by node execution and option loading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeError {
    /// Input validation failed.
    InvalidInput { message: String },
    /// A required configuration field is missing or unusable.
    InvalidConfig { field: String, message: String },
    /// Execution failed.
    ExecutionFailed { message: String },
    /// External service error.
    ExternalService { service: String, message: String },
    /// The execution exceeded its time limit.
    Timeout { after_secs: u64 },
    /// A circuit breaker rejected the call without attempting it.
    BreakerOpen { name: String },
    /// No implementation is registered for the node type.
    UnknownNodeType { node_type: String },
    /// The options provider has no method with this name.
    UnknownOptionsMethod { method: String },
}

impl fmt::Display for NodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput { message } => write!(f, "invalid input: {message}"),
            Self::InvalidConfig { field, message } => {
                write!(f, "invalid configuration for '{field}': {message}")
            }
            Self::ExecutionFailed { message } => write!(f, "execution failed: {message}"),
            Self::ExternalService { service, message } => {
                write!(f, "external service error ({service}): {message}")
            }
            Self::Timeout { after_secs } => {
                write!(f, "execution timed out after {after_secs}s")
            }
            Self::BreakerOpen { name } => {
                write!(f, "circuit breaker '{name}' is open, service unavailable")
            }
            Self::UnknownNodeType { node_type } => write!(f, "unknown node type: {node_type}"),
            Self::UnknownOptionsMethod { method } => {
                write!(f, "unknown options method: {method}")
            }
        }
    }
}

impl std::error::Error for NodeError {}

/// Out-of-band lookups used to build configuration pickers.
#[async_trait]
pub trait OptionsProvider: Send + Sync {
    /// Names of the methods this provider answers.
    fn methods(&self) -> Vec<&'static str>;

    /// Runs `method` against a partially filled configuration.
    async fn load_options(
        &self,
        method: &str,
        config: &Map<String, JsonValue>,
    ) -> Result<Vec<SelectOption>, NodeError>;
}

/// An executable node type.
#[async_trait]
pub trait Node: Send + Sync {
    /// The node's declarative schema.
    fn schema(&self) -> NodeSchema;

    /// How the scheduler routes this node's output.
    fn flow(&self) -> FlowControl {
        FlowControl::Linear
    }

    /// Runs the node.
    ///
    /// `context.resolved_config` holds the configuration with templates
    /// already evaluated.
    async fn execute(
        &self,
        context: &ExecutionContext,
        input: JsonValue,
    ) -> Result<JsonValue, NodeError>;

    /// Options provider, for nodes with dynamic select inputs.
    fn options(&self) -> Option<&dyn OptionsProvider> {
        None
    }
}
