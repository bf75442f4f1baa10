use crate::context::ExecutionContext;
use crate::node::{Node, NodeError, NodeKind, NodeSchema, PortDescriptor};
use async_trait::async_trait;
use serde_json::{Value as JsonValue, json};

/// Starts a run by hand; the trigger payload becomes its output.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManualTrigger;

#[async_trait]
impl Node for ManualTrigger {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("trigger.manual", "Manual Trigger", NodeKind::Trigger)
            .with_description("Starts a workflow manually with provided initial data.")
            .with_category("Trigger")
            .with_output(PortDescriptor::new("output", "json", "Initial Data"))
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        if input.is_null() {
            return Ok(json!({}));
        }
        Ok(input)
    }
}

/// Starts a run from an inbound HTTP request forwarded by the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebhookTrigger;

#[async_trait]
impl Node for WebhookTrigger {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("trigger.webhook", "Webhook", NodeKind::Trigger)
            .with_description("Triggers when an external HTTP request is received.")
            .with_category("Trigger")
            .with_input(PortDescriptor::new("path", "string", "Endpoint Path").required())
            .with_output(PortDescriptor::new("body", "json", "Request Body"))
            .with_output(PortDescriptor::new("headers", "json", "Headers"))
            .with_output(PortDescriptor::new("query", "json", "Query Parameters"))
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        let field = |name: &str| input.get(name).cloned();
        Ok(json!({
            "body": field("body").unwrap_or_else(|| json!({})),
            "headers": field("headers").unwrap_or_else(|| json!({})),
            "query": field("query").unwrap_or_else(|| json!({})),
            "method": field("method").unwrap_or_else(|| json!("POST")),
            "webhook_url": format!("/webhooks/{}", context.workflow_id),
            "received_at": field("timestamp").unwrap_or(JsonValue::Null),
        }))
    }
}
