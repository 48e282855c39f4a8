//! Tool registry and runtime. Tools are looked up by name, invoked with a
//! shared context, and every error — thrown or returned — comes back to the
//! dispatcher as a structured `{ok: false}` result, never as an exception.

pub mod background;
pub mod patch;
pub mod schema;
pub mod shell;

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use serde_json::Value;
use serde_json::json;
use time::OffsetDateTime;

use crate::error::LoafErr;
use crate::error::Result;
use crate::exec::CancelSignal;
use crate::tools::schema::JsonSchema;

/// Shared per-invocation context.
pub struct ToolContext {
    pub now: OffsetDateTime,
    pub cancel: Option<CancelSignal>,
}

#[derive(Debug, Clone)]
pub struct ToolCall {
    pub id: Option<String>,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResult {
    pub ok: bool,
    pub output: Value,
    pub error: Option<String>,
}

impl ToolResult {
    pub fn success(output: Value) -> Self {
        Self {
            ok: true,
            output,
            error: None,
        }
    }

    pub fn failure(status: &str, message: String) -> Self {
        Self {
            ok: false,
            output: json!({ "status": status, "message": message }),
            error: Some(message),
        }
    }

    fn from_err(err: &LoafErr) -> Self {
        Self::failure(err.status(), err.to_string())
    }
}

pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<ToolResult>> + Send + 'a>>;

pub trait ToolHandler: Send + Sync {
    fn run<'a>(&'a self, ctx: ToolContext, input: Value) -> ToolFuture<'a>;
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Option<JsonSchema>,
    handler: Arc<dyn ToolHandler>,
}

impl ToolDefinition {
    pub fn new(
        name: &str,
        description: &str,
        input_schema: Option<JsonSchema>,
        handler: Arc<dyn ToolHandler>,
    ) -> Result<Self> {
        if !is_valid_tool_name(name) {
            return Err(LoafErr::InvalidInput(format!(
                "tool name '{name}' must match [A-Za-z0-9_.:-]+"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
            handler,
        })
    }
}

pub fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
}

/// Name-keyed map of tool definitions. Registration is idempotent: a
/// duplicate name replaces the previous entry.
#[derive(Default)]
pub struct ToolRegistry {
    tools: StdMutex<HashMap<String, ToolDefinition>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, definition: ToolDefinition) {
        if let Ok(mut tools) = self.tools.lock() {
            tools.insert(definition.name.clone(), definition);
        }
    }

    pub fn get(&self, name: &str) -> Option<ToolDefinition> {
        self.tools.lock().ok()?.get(name).cloned()
    }

    /// Definitions sorted by name, for stable listings.
    pub fn list(&self) -> Vec<ToolDefinition> {
        let Ok(tools) = self.tools.lock() else {
            return Vec::new();
        };
        let mut definitions: Vec<ToolDefinition> = tools.values().cloned().collect();
        definitions.sort_by(|a, b| a.name.cmp(&b.name));
        definitions
    }
}

pub struct ToolRuntime {
    registry: Arc<ToolRegistry>,
}

impl ToolRuntime {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Invoke a tool by name. Unknown names and handler errors both surface
    /// as failure results.
    pub async fn dispatch(&self, call: &ToolCall, cancel: Option<CancelSignal>) -> ToolResult {
        let Some(definition) = self.registry.get(&call.name) else {
            return ToolResult::failure("not_found", format!("unknown tool '{}'", call.name));
        };
        let ctx = ToolContext {
            now: OffsetDateTime::now_utc(),
            cancel,
        };
        match definition.handler.run(ctx, call.input.clone()).await {
            Ok(result) => result,
            Err(err) => {
                tracing::debug!(tool = %call.name, error = %err, "tool call failed");
                ToolResult::from_err(&err)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Input helpers: tools validate their untyped JSON inputs explicitly and
// surface invalid_input failures instead of panicking.
// ---------------------------------------------------------------------------

pub(crate) fn require_str(input: &Value, key: &str) -> Result<String> {
    match input.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(LoafErr::InvalidInput(format!(
            "'{key}' must be a non-empty string"
        ))),
        Some(_) => Err(LoafErr::InvalidInput(format!("'{key}' must be a string"))),
        None => Err(LoafErr::InvalidInput(format!("missing required '{key}'"))),
    }
}

pub(crate) fn optional_str(input: &Value, key: &str) -> Result<Option<String>> {
    match input.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(LoafErr::InvalidInput(format!("'{key}' must be a string"))),
    }
}

pub(crate) fn optional_u64(input: &Value, key: &str) -> Result<Option<u64>> {
    match input.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| LoafErr::InvalidInput(format!("'{key}' must be a non-negative integer"))),
    }
}

pub(crate) fn optional_bool(input: &Value, key: &str) -> Result<Option<bool>> {
    match input.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(LoafErr::InvalidInput(format!("'{key}' must be a boolean"))),
    }
}

/// A string-to-string map; any non-string value is rejected.
pub(crate) fn optional_string_map(
    input: &Value,
    key: &str,
) -> Result<Option<HashMap<String, String>>> {
    match input.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => {
            let mut out = HashMap::with_capacity(map.len());
            for (k, v) in map {
                let Value::String(s) = v else {
                    return Err(LoafErr::InvalidInput(format!(
                        "'{key}.{k}' must be a string"
                    )));
                };
                out.insert(k.clone(), s.clone());
            }
            Ok(Some(out))
        }
        Some(_) => Err(LoafErr::InvalidInput(format!(
            "'{key}' must be a string-to-string map"
        ))),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use pretty_assertions::assert_eq;

    struct EchoTool;

    impl ToolHandler for EchoTool {
        fn run<'a>(&'a self, _ctx: ToolContext, input: Value) -> ToolFuture<'a> {
            Box::pin(async move { Ok(ToolResult::success(json!({ "echo": input }))) })
        }
    }

    struct FailingTool;

    impl ToolHandler for FailingTool {
        fn run<'a>(&'a self, _ctx: ToolContext, _input: Value) -> ToolFuture<'a> {
            Box::pin(async move {
                Err(LoafErr::InvalidInput("it broke".to_string()))
            })
        }
    }

    fn runtime_with(defs: Vec<ToolDefinition>) -> ToolRuntime {
        let registry = Arc::new(ToolRegistry::new());
        for def in defs {
            registry.register(def);
        }
        ToolRuntime::new(registry)
    }

    #[tokio::test]
    async fn dispatch_runs_registered_tools() {
        let runtime = runtime_with(vec![
            ToolDefinition::new("echo", "echoes", None, Arc::new(EchoTool)).unwrap(),
        ]);
        let result = runtime
            .dispatch(
                &ToolCall {
                    id: None,
                    name: "echo".to_string(),
                    input: json!({"x": 1}),
                },
                None,
            )
            .await;
        assert!(result.ok);
        assert_eq!(result.output, json!({"echo": {"x": 1}}));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_not_found_failure() {
        let runtime = runtime_with(vec![]);
        let result = runtime
            .dispatch(
                &ToolCall {
                    id: None,
                    name: "missing".to_string(),
                    input: Value::Null,
                },
                None,
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.output["status"], "not_found");
    }

    #[tokio::test]
    async fn handler_errors_become_structured_failures() {
        let runtime = runtime_with(vec![
            ToolDefinition::new("boom", "fails", None, Arc::new(FailingTool)).unwrap(),
        ]);
        let result = runtime
            .dispatch(
                &ToolCall {
                    id: None,
                    name: "boom".to_string(),
                    input: Value::Null,
                },
                None,
            )
            .await;
        assert!(!result.ok);
        assert_eq!(result.output["status"], "invalid_input");
        assert_eq!(result.output["message"], "it broke");
        assert_eq!(result.error.as_deref(), Some("it broke"));
    }

    #[tokio::test]
    async fn duplicate_registration_replaces() {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(ToolDefinition::new("t", "first", None, Arc::new(EchoTool)).unwrap());
        registry.register(ToolDefinition::new("t", "second", None, Arc::new(EchoTool)).unwrap());
        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get("t").unwrap().description, "second");
    }

    #[test]
    fn tool_names_are_validated() {
        assert!(is_valid_tool_name("bg_start"));
        assert!(is_valid_tool_name("ns:tool.v2-beta"));
        assert!(!is_valid_tool_name(""));
        assert!(!is_valid_tool_name("has space"));
        assert!(!is_valid_tool_name("emoji✨"));
        assert!(
            ToolDefinition::new("bad name", "x", None, Arc::new(EchoTool)).is_err()
        );
    }

    #[test]
    fn string_map_validation_rejects_non_strings() {
        let ok = optional_string_map(&json!({"env": {"A": "1"}}), "env").unwrap();
        assert_eq!(ok.unwrap().get("A").map(String::as_str), Some("1"));
        assert!(optional_string_map(&json!({"env": {"A": 1}}), "env").is_err());
        assert!(optional_string_map(&json!({"env": [1, 2]}), "env").is_err());
        assert!(optional_string_map(&json!({}), "env").unwrap().is_none());
    }
}
