//! Tool contract and registry.
//!
//! A tool is a typed async function: [`Tool::Input`] is deserialized from the
//! `tools/call` arguments and [`Tool::Output`] is serialized into the result.
//! [`Traced`] wraps a tool at registration time, adding a span and metrics,
//! and erases its types behind [`ToolHandler`] so the [`ToolRegistry`] can
//! hold tools of different shapes.
//!
//! # Adding a Tool
//!
//! ```rust,ignore
//! struct Echo;
//!
//! impl Tool for Echo {
//!     type Input = EchoInput;
//!     type Output = EchoOutput;
//!     const NAME: &'static str = "echo";
//!
//!     fn description(&self) -> &'static str { "Echo the input" }
//!     fn input_schema(&self) -> Value { json!({"type": "object"}) }
//!     async fn call(&self, input: EchoInput) -> AppResult<EchoOutput> { ... }
//! }
//!
//! registry.register(Echo);
//! ```

mod generate_uuid;

pub use generate_uuid::{GenerateUuid, GenerateUuidInput, GenerateUuidOutput};

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_json::value::RawValue;
use tracing::field::Empty;
use tracing::{Instrument, debug, info_span, warn};

use crate::error::{AppError, AppResult};
use crate::metrics;

/// A typed tool.
pub trait Tool: Send + Sync + 'static {
    type Input: DeserializeOwned + Serialize + Send;
    type Output: Serialize + Send;

    /// Name used in `tools/list` and `tools/call`.
    const NAME: &'static str;

    fn description(&self) -> &'static str;

    /// JSON schema describing [`Self::Input`].
    fn input_schema(&self) -> Value;

    fn call(&self, input: Self::Input) -> impl Future<Output = AppResult<Self::Output>> + Send;
}

/// Tool metadata as listed by `tools/list`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: Value,
}

/// Type-erased tool.
///
/// Errors:
/// - [`AppError::SerializationError`] when the arguments do not match the input type
/// - [`AppError::ToolError`] when the tool itself fails
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;

    fn definition(&self) -> ToolDefinition;

    fn call<'a>(&'a self, arguments: Option<&'a RawValue>) -> BoxFuture<'a, AppResult<Value>>;
}

/// Tracing and metrics wrapper for a [`Tool`].
///
/// Each call runs in a `tool/<name>` span. Input and output are recorded on
/// the span only with payload logging enabled.
pub struct Traced<T> {
    tool: T,
    log_payloads: bool,
}

impl<T: Tool> Traced<T> {
    pub fn new(tool: T, log_payloads: bool) -> Self {
        Self { tool, log_payloads }
    }
}

impl<T: Tool> ToolHandler for Traced<T> {
    fn name(&self) -> &'static str {
        T::NAME
    }

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: T::NAME.to_string(),
            description: self.tool.description().to_string(),
            input_schema: self.tool.input_schema(),
        }
    }

    fn call<'a>(&'a self, arguments: Option<&'a RawValue>) -> BoxFuture<'a, AppResult<Value>> {
        let span_name = format!("tool/{}", T::NAME);
        let span = info_span!(
            "tool",
            otel.name = span_name.as_str(),
            tool.name = T::NAME,
            tool.input = Empty,
            tool.output = Empty,
            tool.error = Empty,
        );

        let log_payloads = self.log_payloads;

        Box::pin(
            async move {
                let span = tracing::Span::current();

                // Absent or null arguments mean "no arguments"
                let raw = arguments.map_or("{}", |raw| match raw.get() {
                    "null" => "{}",
                    other => other,
                });
                let input: T::Input = serde_json::from_str(raw)?;

                if log_payloads && let Ok(json) = serde_json::to_string(&input) {
                    span.record("tool.input", json.as_str());
                }

                let start = Instant::now();
                let result = self.tool.call(input).await;
                let elapsed = start.elapsed().as_secs_f64();

                metrics::record_tool_call(T::NAME, result.is_ok(), elapsed);

                let output = match result {
                    Ok(output) => output,
                    Err(e) => {
                        span.record("tool.error", tracing::field::display(&e));
                        warn!(error = %e, "Tool call failed");
                        return Err(e);
                    }
                };

                let value = serde_json::to_value(&output)
                    .map_err(|e| AppError::Internal(format!("Failed to serialize tool output: {e}")))?;

                if log_payloads {
                    span.record("tool.output", tracing::field::display(&value));
                }
                debug!(duration_secs = elapsed, "Tool call completed");

                Ok(value)
            }
            .instrument(span),
        )
    }
}

/// Registered tools, keyed by name.
///
/// Cheap to clone.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn ToolHandler>>,
    log_payloads: bool,
}

impl ToolRegistry {
    /// Empty registry; tools registered later inherit `log_payloads`.
    pub fn new(log_payloads: bool) -> Self {
        Self {
            tools: BTreeMap::new(),
            log_payloads,
        }
    }

    /// Registry with the bundled tools.
    pub fn with_defaults(log_payloads: bool) -> Self {
        let mut registry = Self::new(log_payloads);
        registry.register(GenerateUuid);
        registry
    }

    /// Register a tool, wrapped in [`Traced`]. Replaces a tool of the same name.
    pub fn register<T: Tool>(&mut self, tool: T) {
        self.register_handler(Arc::new(Traced::new(tool, self.log_payloads)));
    }

    /// Register an already type-erased handler.
    pub fn register_handler(&mut self, handler: Arc<dyn ToolHandler>) {
        if self.tools.insert(handler.name(), handler).is_some() {
            warn!("Replaced previously registered tool");
        }
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn ToolHandler>> {
        self.tools.get(name)
    }

    /// Definitions in name order.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|tool| tool.definition()).collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.tools.keys().collect::<Vec<_>>())
            .field("log_payloads", &self.log_payloads)
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct AddInput {
        a: i64,
        b: i64,
    }

    #[derive(Debug, Serialize)]
    struct AddOutput {
        sum: i64,
    }

    struct Add;

    impl Tool for Add {
        type Input = AddInput;
        type Output = AddOutput;
        const NAME: &'static str = "add";

        fn description(&self) -> &'static str {
            "Add two integers"
        }

        fn input_schema(&self) -> Value {
            json!({
                "type": "object",
                "properties": {"a": {"type": "integer"}, "b": {"type": "integer"}},
                "required": ["a", "b"]
            })
        }

        async fn call(&self, input: AddInput) -> AppResult<AddOutput> {
            let sum = input
                .a
                .checked_add(input.b)
                .ok_or_else(|| AppError::tool(Self::NAME, "overflow"))?;
            Ok(AddOutput { sum })
        }
    }

    fn raw(json: &str) -> Box<RawValue> {
        RawValue::from_string(json.to_string()).unwrap()
    }

    #[tokio::test]
    async fn test_traced_call_success() {
        let tool = Traced::new(Add, false);
        let args = raw(r#"{"a":2,"b":3}"#);

        let output = tool.call(Some(&args)).await.unwrap();
        assert_eq!(output, json!({"sum": 5}));
    }

    #[tokio::test]
    async fn test_traced_call_bad_arguments() {
        let tool = Traced::new(Add, true);
        let args = raw(r#"{"a":"two"}"#);

        let err = tool.call(Some(&args)).await.unwrap_err();
        assert!(matches!(err, AppError::SerializationError(_)));
    }

    #[tokio::test]
    async fn test_traced_call_tool_failure() {
        let tool = Traced::new(Add, false);
        let args = raw(&format!(r#"{{"a":{},"b":1}}"#, i64::MAX));

        let err = tool.call(Some(&args)).await.unwrap_err();
        assert!(matches!(err, AppError::ToolError { .. }));
    }

    #[test]
    fn test_registry_lookup_and_definitions() {
        let mut registry = ToolRegistry::with_defaults(false);
        registry.register(Add);

        assert_eq!(registry.len(), 2);
        assert!(registry.get("add").is_some());
        assert!(registry.get("generate_uuid").is_some());
        assert!(registry.get("missing").is_none());

        let names: Vec<_> = registry
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["add", "generate_uuid"]);
    }

    #[test]
    fn test_definition_serializes_camel_case() {
        let definition = Traced::new(Add, false).definition();
        let value = serde_json::to_value(&definition).unwrap();

        assert!(value.get("inputSchema").is_some());
        assert_eq!(value["name"], "add");
    }
}
