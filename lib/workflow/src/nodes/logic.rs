//! Control-flow nodes.
//!
//! These nodes only compute routing data; the scheduler reads their
//! [`FlowControl`] and output to decide which edges to follow.

use crate::context::ExecutionContext;
use crate::expression::whole_expression;
use crate::node::{
    BranchKind, ErrorPolicy, FlowControl, Node, NodeError, NodeKind, NodeSchema, OptionsProvider,
    PortDescriptor, SelectOption,
};
use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue, json};
use std::time::Duration;

const TRUTHY: &[&str] = &["true", "1", "yes", "on"];

/// Label used when no switch case matches.
pub const DEFAULT_CASE: &str = "default";

pub(crate) fn truthy(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|n| n != 0.0),
        JsonValue::String(s) => TRUTHY.contains(&s.trim().to_lowercase().as_str()),
        JsonValue::Array(items) => !items.is_empty(),
        JsonValue::Object(fields) => !fields.is_empty(),
    }
}

fn as_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Two-way branch on a boolean condition.
#[derive(Debug, Clone, Copy, Default)]
pub struct IfNode;

#[async_trait]
impl Node for IfNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("logic.if", "If / Else", NodeKind::Logic)
            .with_description("Routes data to the true or false branch based on a condition.")
            .with_category("Logic")
            .with_input(
                PortDescriptor::new("condition", "string", "Condition")
                    .required()
                    .with_description("Expression such as {{ input.count > 3 }}"),
            )
            .with_output(PortDescriptor::new("result", "boolean", "Result"))
            .with_output(PortDescriptor::new("branch_taken", "string", "Branch Taken"))
    }

    fn flow(&self) -> FlowControl {
        FlowControl::Branch(BranchKind::If)
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        _input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        let result = match context.config("condition") {
            None => false,
            Some(JsonValue::String(text)) if text.trim().is_empty() => false,
            // Unresolved or bare: evaluate it here.
            Some(JsonValue::String(text)) => {
                let expression = whole_expression(text).unwrap_or(text.trim());
                let value =
                    context
                        .evaluate(expression)
                        .map_err(|warning| NodeError::InvalidConfig {
                            field: "condition".to_string(),
                            message: warning.reason,
                        })?;
                truthy(&value)
            }
            Some(value) => truthy(value),
        };

        Ok(json!({
            "result": result,
            "branch_taken": if result { "true" } else { "false" },
        }))
    }
}

/// Multi-way branch on a value.
#[derive(Debug, Clone, Copy, Default)]
pub struct SwitchNode;

impl SwitchNode {
    /// Case names from a `cases` value: an object's keys, a list of names,
    /// or JSON text holding either.
    fn case_names(cases: Option<&JsonValue>) -> Vec<String> {
        match cases {
            Some(JsonValue::Object(fields)) => fields.keys().cloned().collect(),
            Some(JsonValue::Array(items)) => items.iter().map(as_text).collect(),
            Some(JsonValue::String(text)) => serde_json::from_str::<JsonValue>(text)
                .ok()
                .filter(|parsed| !parsed.is_string())
                .map(|parsed| Self::case_names(Some(&parsed)))
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl Node for SwitchNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("logic.switch", "Switch", NodeKind::Logic)
            .with_description("Multi-way branching based on value matching.")
            .with_category("Logic")
            .with_input(PortDescriptor::new("value", "string", "Value to Switch").required())
            .with_input(
                PortDescriptor::new("cases", "json", "Cases (JSON Object)")
                    .required()
                    .with_dynamic_options("list_cases"),
            )
            .with_output(PortDescriptor::new("matched", "string", "Matched Case"))
    }

    fn flow(&self) -> FlowControl {
        FlowControl::Branch(BranchKind::Switch)
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        let value = as_text(context.config("value").unwrap_or(&input));
        let matched = Self::case_names(context.config("cases"))
            .into_iter()
            .find(|case| *case == value)
            .unwrap_or_else(|| DEFAULT_CASE.to_string());

        Ok(json!({ "matched": matched }))
    }

    fn options(&self) -> Option<&dyn OptionsProvider> {
        Some(self)
    }
}

#[async_trait]
impl OptionsProvider for SwitchNode {
    fn methods(&self) -> Vec<&'static str> {
        vec!["list_cases"]
    }

    async fn load_options(
        &self,
        method: &str,
        config: &Map<String, JsonValue>,
    ) -> Result<Vec<SelectOption>, NodeError> {
        if method != "list_cases" {
            return Err(NodeError::UnknownOptionsMethod {
                method: method.to_string(),
            });
        }

        let mut options: Vec<SelectOption> = Self::case_names(config.get("cases"))
            .into_iter()
            .map(|case| SelectOption::new(case.clone(), case))
            .collect();
        options.push(SelectOption::new("Default", DEFAULT_CASE));
        Ok(options)
    }
}

/// Emits an item list; the scheduler fans out one run per item.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoopNode;

#[async_trait]
impl Node for LoopNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("logic.loop", "Loop", NodeKind::Logic)
            .with_description("Iterates over an array of items.")
            .with_category("Logic")
            .with_input(PortDescriptor::new("items", "array", "Input Array").required())
            .with_input(
                PortDescriptor::new("items_field", "string", "Items Field").with_default("items"),
            )
            .with_output(PortDescriptor::new("item", "any", "Current Item"))
            .with_output(PortDescriptor::new("index", "number", "Index"))
            .with_output(PortDescriptor::new("total", "number", "Total"))
    }

    fn flow(&self) -> FlowControl {
        FlowControl::FanOut
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        let field = context.config_str("items_field").unwrap_or("items");
        let mut items = match &input {
            JsonValue::Object(fields) => fields.get(field).cloned().unwrap_or(JsonValue::Null),
            other => other.clone(),
        };

        let is_empty = match &items {
            JsonValue::Null => true,
            JsonValue::Array(list) => list.is_empty(),
            _ => false,
        };
        if is_empty {
            items = context.config("items").cloned().unwrap_or(JsonValue::Null);
        }

        let items = match items {
            JsonValue::Array(list) => list,
            JsonValue::Null => Vec::new(),
            single => vec![single],
        };
        let total = items.len();
        Ok(json!({ "items": items, "total": total }))
    }
}

/// Joins parallel branches; outputs every predecessor's result.
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeNode;

#[async_trait]
impl Node for MergeNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("logic.merge", "Merge", NodeKind::Logic)
            .with_description("Waits for all incoming branches and combines their outputs.")
            .with_category("Logic")
            .with_output(PortDescriptor::new("merged", "json", "Merged Outputs"))
    }

    fn flow(&self) -> FlowControl {
        FlowControl::FanIn
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        _input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        let merged: Map<String, JsonValue> = context
            .predecessors
            .iter()
            .filter_map(|id| {
                context
                    .result(id.as_str())
                    .map(|output| (id.to_string(), output.clone()))
            })
            .collect();
        let count = merged.len();
        Ok(json!({ "merged": merged, "count": count }))
    }
}

/// Passes its input to every outgoing branch.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelNode;

#[async_trait]
impl Node for ParallelNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("logic.parallel", "Parallel", NodeKind::Logic)
            .with_description("Starts every outgoing branch at once.")
            .with_category("Logic")
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        if input.is_null() {
            return Ok(json!({ "active": true }));
        }
        Ok(input)
    }
}

/// Waits before continuing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DelayNode;

impl DelayNode {
    const DEFAULT_SECONDS: f64 = 5.0;
}

#[async_trait]
impl Node for DelayNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("logic.delay", "Delay", NodeKind::Logic)
            .with_description("Pauses the branch for a number of seconds.")
            .with_category("Logic")
            .with_input(
                PortDescriptor::new("seconds", "number", "Seconds")
                    .with_default(Self::DEFAULT_SECONDS),
            )
    }

    async fn execute(
        &self,
        context: &ExecutionContext,
        _input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        let seconds = match context.config("seconds") {
            None => Self::DEFAULT_SECONDS,
            Some(JsonValue::Number(n)) => n.as_f64().unwrap_or(Self::DEFAULT_SECONDS),
            Some(JsonValue::String(s)) => {
                s.trim()
                    .parse::<f64>()
                    .map_err(|e| NodeError::InvalidConfig {
                        field: "seconds".to_string(),
                        message: e.to_string(),
                    })?
            }
            Some(other) => {
                return Err(NodeError::InvalidConfig {
                    field: "seconds".to_string(),
                    message: format!("expected a number, got {other}"),
                });
            }
        };

        let delay = Duration::try_from_secs_f64(seconds).map_err(|e| NodeError::InvalidConfig {
            field: "seconds".to_string(),
            message: e.to_string(),
        })?;
        tokio::time::sleep(delay).await;

        Ok(json!({ "finished": true, "seconds": seconds }))
    }
}

/// Does nothing; useful as a placeholder or join point.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNode;

#[async_trait]
impl Node for NoopNode {
    fn schema(&self) -> NodeSchema {
        NodeSchema::new("utility.noop", "No Operation", NodeKind::Action)
            .with_description("Passes its input through unchanged.")
            .with_category("Utility")
            .with_error_policy(ErrorPolicy::Continue)
    }

    async fn execute(
        &self,
        _context: &ExecutionContext,
        input: JsonValue,
    ) -> Result<JsonValue, NodeError> {
        Ok(input)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::NodeId;
    use crate::expression::ExpressionScope;
    use switchyard_core::{WorkflowId, WorkflowRunId};

    fn ctx(config: JsonValue) -> ExecutionContext {
        let config = match config {
            JsonValue::Object(map) => map,
            _ => Map::new(),
        };
        ExecutionContext::new(WorkflowId::new(), WorkflowRunId::new(), NodeId::from("n"))
            .with_config(config)
    }

    fn ctx_with_input(config: JsonValue, input: JsonValue) -> ExecutionContext {
        let base = ctx(config);
        let scope = ExpressionScope::new(
            base.workflow_id,
            base.run_id,
            Vec::new(),
            input,
            Default::default(),
        );
        base.with_scope(scope)
    }

    #[tokio::test]
    async fn if_uses_resolved_boolean() {
        let out = IfNode
            .execute(&ctx(json!({"condition": true})), json!({}))
            .await
            .expect("executes");
        assert_eq!(out, json!({"result": true, "branch_taken": "true"}));
    }

    #[tokio::test]
    async fn if_evaluates_bare_expression() {
        let context = ctx_with_input(json!({"condition": "input.x > 3"}), json!({"x": 2}));
        let out = IfNode.execute(&context, json!({"x": 2})).await.expect("executes");
        assert_eq!(out["result"], false);
        assert_eq!(out["branch_taken"], "false");
    }

    #[tokio::test]
    async fn if_treats_truthy_strings() {
        for (condition, expected) in [("yes", true), ("On", true), ("0", false), ("", false)] {
            let out = IfNode
                .execute(&ctx(json!({"condition": format!("{{{{ '{condition}' }}}}")})), json!({}))
                .await
                .expect("executes");
            assert_eq!(out["result"], expected, "{condition}");
        }
    }

    #[tokio::test]
    async fn if_without_condition_is_false() {
        let out = IfNode.execute(&ctx(json!({})), json!({})).await.expect("executes");
        assert_eq!(out["result"], false);
    }

    #[tokio::test]
    async fn if_reports_malformed_condition() {
        let err = IfNode
            .execute(&ctx(json!({"condition": "{{ input. }}"})), json!({}))
            .await
            .expect_err("malformed");
        assert!(matches!(err, NodeError::InvalidConfig { ref field, .. } if field == "condition"));
    }

    #[tokio::test]
    async fn switch_matches_case_keys() {
        let config = json!({"value": "b", "cases": {"a": 1, "b": 2}});
        let out = SwitchNode.execute(&ctx(config), json!({})).await.expect("executes");
        assert_eq!(out, json!({"matched": "b"}));
    }

    #[tokio::test]
    async fn switch_falls_back_to_input_and_default() {
        let config = json!({"cases": ["1", "2"]});
        let out = SwitchNode.execute(&ctx(config.clone()), json!(2)).await.expect("executes");
        assert_eq!(out["matched"], "2");

        let out = SwitchNode.execute(&ctx(config), json!(9)).await.expect("executes");
        assert_eq!(out["matched"], DEFAULT_CASE);
    }

    #[tokio::test]
    async fn switch_lists_cases_from_json_text() {
        let mut config = Map::new();
        config.insert("cases".to_string(), json!(r#"{"red": 1, "blue": 2}"#));
        let options = SwitchNode
            .load_options("list_cases", &config)
            .await
            .expect("options");
        let labels: Vec<&str> = options.iter().map(|o| o.label.as_str()).collect();
        assert_eq!(labels, vec!["blue", "red", "Default"]);
    }

    #[tokio::test]
    async fn loop_reads_items_field_and_config_fallback() {
        let out = LoopNode
            .execute(&ctx(json!({})), json!({"items": [1, 2, 3]}))
            .await
            .expect("executes");
        assert_eq!(out, json!({"items": [1, 2, 3], "total": 3}));

        let out = LoopNode
            .execute(&ctx(json!({"items_field": "rows"})), json!({"rows": "solo"}))
            .await
            .expect("executes");
        assert_eq!(out, json!({"items": ["solo"], "total": 1}));

        let out = LoopNode
            .execute(&ctx(json!({"items": ["x", "y"]})), json!({}))
            .await
            .expect("executes");
        assert_eq!(out["total"], 2);
    }

    #[tokio::test]
    async fn merge_collects_predecessor_outputs() {
        let mut results = Map::new();
        results.insert("b".to_string(), json!({"v": 1}));
        results.insert("c".to_string(), json!({"v": 2}));
        let context = ctx(json!({}))
            .with_results(results)
            .with_predecessors(vec![NodeId::from("b"), NodeId::from("c"), NodeId::from("d")]);

        let out = MergeNode.execute(&context, json!({})).await.expect("executes");
        assert_eq!(out["merged"], json!({"b": {"v": 1}, "c": {"v": 2}}));
        assert_eq!(out["count"], 2);
    }

    #[tokio::test(start_paused = true)]
    async fn delay_sleeps_for_configured_seconds() {
        let start = tokio::time::Instant::now();
        let out = DelayNode
            .execute(&ctx(json!({"seconds": "2"})), json!({}))
            .await
            .expect("executes");
        assert_eq!(out["finished"], true);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test]
    async fn delay_rejects_negative_seconds() {
        let err = DelayNode
            .execute(&ctx(json!({"seconds": -1})), json!({}))
            .await
            .expect_err("negative");
        assert!(err.to_string().contains("seconds"));
    }

    #[tokio::test]
    async fn noop_and_parallel_pass_through() {
        assert_eq!(NoopNode.schema().error_policy, ErrorPolicy::Continue);
        let out = NoopNode.execute(&ctx(json!({})), json!([1])).await.expect("executes");
        assert_eq!(out, json!([1]));

        let out = ParallelNode
            .execute(&ctx(json!({})), JsonValue::Null)
            .await
            .expect("executes");
        assert_eq!(out, json!({"active": true}));
    }
}
