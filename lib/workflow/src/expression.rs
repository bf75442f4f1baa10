//! Template expression resolution.
//!
//! Strings in node configuration and input payloads may embed `{{ expr }}`
//! templates. They are evaluated with minijinja against an
//! [`ExpressionScope`] exposing:
//!
//! - `node`: map of node id to `{json: <output>}`
//! - `input`: the current node's raw input
//! - `env`: the environment variables exposed to workflows
//! - `execution`: `{id, workflow_id}`
//!
//! A string that consists of exactly one `{{ expr }}` evaluates to the
//! expression's native value (a number stays a number, a list stays a list).
//! Anything else renders to a string.
//!
//! [`ExpressionResolver::try_resolve`] reports the first failure;
//! [`ExpressionResolver::resolve`] logs failures and keeps the original
//! string so one bad template cannot stop a dispatch.

use minijinja::Environment;
use serde::Serialize;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::BTreeMap;
use std::fmt;
use switchyard_core::{WorkflowId, WorkflowRunId};

const OPEN: &str = "{{";
const CLOSE: &str = "}}";

/// Failure to evaluate one template string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionWarning {
    /// The template that failed.
    pub template: String,
    pub reason: String,
}

impl fmt::Display for ResolutionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expression resolution failed for '{}': {}",
            self.template, self.reason
        )
    }
}

impl std::error::Error for ResolutionWarning {}

/// Variables visible to expressions.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExpressionScope {
    pub node: Map<String, JsonValue>,
    pub input: JsonValue,
    pub env: BTreeMap<String, String>,
    pub execution: JsonValue,
}

impl ExpressionScope {
    /// Builds a scope from a results map (node id to output).
    ///
    /// Entries that are not node outputs (such as `trigger`) are exposed the
    /// same way; templates address nodes by id.
    #[must_use]
    pub fn new(
        workflow_id: WorkflowId,
        run_id: WorkflowRunId,
        outputs: impl IntoIterator<Item = (String, JsonValue)>,
        input: JsonValue,
        env: BTreeMap<String, String>,
    ) -> Self {
        let node = outputs
            .into_iter()
            .map(|(id, output)| (id, Self::node_entry(output)))
            .collect();

        Self {
            node,
            input,
            env,
            execution: json!({
                "id": run_id.to_string(),
                "workflow_id": workflow_id.to_string(),
            }),
        }
    }

    /// Wraps an output as `{json: ...}`; non-object outputs nest under `data`.
    fn node_entry(output: JsonValue) -> JsonValue {
        match output {
            JsonValue::Object(_) => json!({ "json": output }),
            other => json!({ "json": { "data": other } }),
        }
    }
}

/// Evaluates templates against one scope.
pub struct ExpressionResolver {
    env: Environment<'static>,
    context: minijinja::Value,
}

impl fmt::Debug for ExpressionResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionResolver")
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}

impl ExpressionResolver {
    #[must_use]
    pub fn new(scope: &ExpressionScope) -> Self {
        Self {
            env: Environment::new(),
            context: minijinja::Value::from_serialize(scope),
        }
    }

    /// Resolves every template in `value`, failing on the first bad one.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionWarning`] naming the template that failed.
    pub fn try_resolve(&self, value: &JsonValue) -> Result<JsonValue, ResolutionWarning> {
        match value {
            JsonValue::String(s) => self.resolve_str(s),
            JsonValue::Array(items) => items
                .iter()
                .map(|item| self.try_resolve(item))
                .collect::<Result<Vec<_>, _>>()
                .map(JsonValue::Array),
            JsonValue::Object(map) => map
                .iter()
                .map(|(k, v)| Ok((k.clone(), self.try_resolve(v)?)))
                .collect::<Result<Map<_, _>, _>>()
                .map(JsonValue::Object),
            other => Ok(other.clone()),
        }
    }

    /// Resolves every template in `value`, leaving failed templates as they
    /// were.
    #[must_use]
    pub fn resolve(&self, value: &JsonValue) -> JsonValue {
        match value {
            JsonValue::String(s) => self.resolve_str(s).unwrap_or_else(|warning| {
                tracing::warn!(
                    template = %warning.template,
                    reason = %warning.reason,
                    "expression resolution failed, keeping original value"
                );
                value.clone()
            }),
            JsonValue::Array(items) => {
                JsonValue::Array(items.iter().map(|item| self.resolve(item)).collect())
            }
            JsonValue::Object(map) => JsonValue::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolves every value of a configuration map, best effort.
    #[must_use]
    pub fn resolve_map(&self, map: &Map<String, JsonValue>) -> Map<String, JsonValue> {
        map.iter()
            .map(|(k, v)| (k.clone(), self.resolve(v)))
            .collect()
    }

    /// Evaluates a bare expression (no `{{ }}`) to its native value.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionWarning`] if the expression does not parse or
    /// evaluate.
    pub fn evaluate(&self, expression: &str) -> Result<JsonValue, ResolutionWarning> {
        let warn = |reason: String| ResolutionWarning {
            template: expression.to_string(),
            reason,
        };

        let compiled = self
            .env
            .compile_expression(expression)
            .map_err(|e| warn(e.to_string()))?;
        let value = compiled
            .eval(&self.context)
            .map_err(|e| warn(e.to_string()))?;
        serde_json::to_value(&value).map_err(|e| warn(e.to_string()))
    }

    fn resolve_str(&self, template: &str) -> Result<JsonValue, ResolutionWarning> {
        if !(template.contains(OPEN) && template.contains(CLOSE)) {
            return Ok(JsonValue::String(template.to_string()));
        }

        if let Some(expression) = whole_expression(template) {
            return self.evaluate(expression).map_err(|warning| ResolutionWarning {
                template: template.to_string(),
                reason: warning.reason,
            });
        }

        self.env
            .render_str(template, &self.context)
            .map(JsonValue::String)
            .map_err(|e| ResolutionWarning {
                template: template.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Returns the inner expression if `template` is exactly one `{{ ... }}`.
pub(crate) fn whole_expression(template: &str) -> Option<&str> {
    let trimmed = template.trim();
    let inner = trimmed.strip_prefix(OPEN)?.strip_suffix(CLOSE)?;
    if inner.contains(OPEN) || inner.contains(CLOSE) {
        return None;
    }
    Some(inner.trim())
}

/// Returns true if the string contains a template marker.
#[must_use]
pub fn is_template(value: &str) -> bool {
    value.contains(OPEN) && value.contains(CLOSE)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ExpressionResolver {
        let scope = ExpressionScope::new(
            WorkflowId::new(),
            WorkflowRunId::new(),
            vec![
                ("fetch".to_string(), json!({"count": 2, "tags": ["a", "b"]})),
                ("echo".to_string(), json!("plain")),
            ],
            json!({"x": 5, "name": "Ada"}),
            BTreeMap::from([("REGION".to_string(), "eu".to_string())]),
        );
        ExpressionResolver::new(&scope)
    }

    #[test]
    fn plain_strings_pass_through() {
        let r = resolver();
        assert_eq!(r.resolve(&json!("no templates")), json!("no templates"));
        assert_eq!(r.resolve(&json!("{ not one }")), json!("{ not one }"));
    }

    #[test]
    fn whole_expression_keeps_native_type() {
        let r = resolver();
        assert_eq!(r.resolve(&json!("{{ input.x > 3 }}")), json!(true));
        assert_eq!(r.resolve(&json!("{{ node.fetch.json.count }}")), json!(2));
        assert_eq!(
            r.resolve(&json!("  {{ node.fetch.json.tags }} ")),
            json!(["a", "b"])
        );
    }

    #[test]
    fn mixed_text_renders_to_string() {
        let r = resolver();
        assert_eq!(
            r.resolve(&json!("Hello {{ input.name }} from {{ env.REGION }}")),
            json!("Hello Ada from eu")
        );
    }

    #[test]
    fn non_object_outputs_nest_under_data() {
        let r = resolver();
        assert_eq!(r.resolve(&json!("{{ node.echo.json.data }}")), json!("plain"));
    }

    #[test]
    fn execution_ids_are_visible() {
        let r = resolver();
        let id = r.resolve(&json!("{{ execution.id }}"));
        assert!(id.as_str().is_some_and(|s| s.starts_with("run_")));
    }

    #[test]
    fn resolves_recursively() {
        let r = resolver();
        let resolved = r.resolve(&json!({
            "count": "{{ node.fetch.json.count }}",
            "nested": [{"greeting": "hi {{ input.name }}"}, 7, null],
        }));
        assert_eq!(
            resolved,
            json!({"count": 2, "nested": [{"greeting": "hi Ada"}, 7, null]})
        );
    }

    #[test]
    fn malformed_expression_is_kept_in_best_effort_mode() {
        let r = resolver();
        let value = json!({"ok": "{{ input.x }}", "bad": "{{ input. }}"});
        let resolved = r.resolve(&value);
        assert_eq!(resolved["ok"], json!(5));
        assert_eq!(resolved["bad"], json!("{{ input. }}"));
    }

    #[test]
    fn strict_mode_reports_the_failing_template() {
        let r = resolver();
        let warning = r
            .try_resolve(&json!(["{{ input.x }}", "{{ input. }}"]))
            .expect_err("should fail");
        assert_eq!(warning.template, "{{ input. }}");
        assert!(warning.to_string().contains("expression resolution failed"));
    }

    #[test]
    fn evaluate_bare_expression() {
        let r = resolver();
        assert_eq!(r.evaluate("input.x * 2").expect("evaluates"), json!(10));
    }
}
