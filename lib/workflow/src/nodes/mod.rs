//! Built-in node implementations.
//!
//! Only the engine's own trigger and control-flow nodes live here.
//! Connectors to outside services are registered by the host.

mod logic;
mod trigger;

pub(crate) use logic::{DEFAULT_CASE, truthy};
pub use logic::{DelayNode, IfNode, LoopNode, MergeNode, NoopNode, ParallelNode, SwitchNode};
pub use trigger::{ManualTrigger, WebhookTrigger};
