//! Minimal JSON-RPC 2.0 dispatcher for the MCP endpoint.
//!
//! Serves `initialize`, `ping`, `tools/list` and `tools/call` over plain
//! request/response HTTP. Notifications (requests without an `id`) are
//! acknowledged with `202 Accepted` and no body. Batches, streaming and
//! sessions are not supported.
//!
//! # Error Codes
//!
//! | Code | Meaning |
//! |---|---|
//! | -32700 | Body is not valid JSON |
//! | -32600 | Valid JSON but not a single JSON-RPC 2.0 request |
//! | -32601 | Unknown method |
//! | -32602 | Unknown tool or arguments that do not fit the tool's input |
//! | -32603 | Internal failure |
//!
//! A tool that runs and fails is not a protocol error: its message comes back
//! as a normal result with `isError: true`.

use axum::{Extension, Json};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use serde_json::{Value, json};
use tracing::{debug, warn};

use crate::error::AppError;
use crate::middleware::RequestId;
use crate::state::AppState;
use crate::tools::ToolRegistry;

/// MCP protocol revision announced by `initialize`.
pub const PROTOCOL_VERSION: &str = "2025-06-18";

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Box<RawValue>>,
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Box<RawValue>>,
}

/// JSON-RPC error object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// JSON-RPC response envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Value, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// `POST /mcp` handler.
///
/// Outcomes are logged with the id assigned by the request id layer so that
/// a client-reported `X-Request-Id` can be matched to its dispatch.
pub async fn handle_rpc(
    State(state): State<AppState>,
    request_id: Option<Extension<RequestId>>,
    body: Bytes,
) -> Response {
    let request_id = request_id
        .as_ref()
        .map_or("-", |Extension(id)| id.as_str());

    match dispatch(&state.tools, &body).await {
        Some(response) => {
            match &response.error {
                Some(error) => debug!(request_id, code = error.code, "JSON-RPC request failed"),
                None => debug!(request_id, "JSON-RPC request served"),
            }
            Json(response).into_response()
        }
        None => {
            debug!(request_id, "JSON-RPC notification accepted");
            StatusCode::ACCEPTED.into_response()
        }
    }
}

/// Dispatch one raw request body.
///
/// Returns `None` for notifications, which get no response body.
pub async fn dispatch(tools: &ToolRegistry, body: &[u8]) -> Option<RpcResponse> {
    let request = match serde_json::from_slice::<RpcRequest>(body) {
        Ok(request) if request.jsonrpc == "2.0" => request,
        Ok(request) => {
            return Some(invalid_request(request.id.unwrap_or(Value::Null)));
        }
        Err(_) => {
            // Valid JSON of the wrong shape is an invalid request, not a parse error
            return Some(match serde_json::from_slice::<Value>(body) {
                Ok(value) => invalid_request(value.get("id").cloned().unwrap_or(Value::Null)),
                Err(e) => {
                    debug!(error = %e, "Rejecting unparseable JSON-RPC body");
                    RpcResponse::failure(Value::Null, RpcError::new(PARSE_ERROR, "Parse error"))
                }
            });
        }
    };

    let Some(id) = request.id.filter(|id| !id.is_null()) else {
        debug!(method = %request.method, "Acknowledged notification");
        return None;
    };

    let outcome = match request.method.as_str() {
        "initialize" => Ok(initialize_result()),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": tools.definitions() })),
        "tools/call" => call_tool(tools, request.params.as_deref()).await,
        other => Err(RpcError::new(
            METHOD_NOT_FOUND,
            format!("Method not found: {other}"),
        )),
    };

    Some(match outcome {
        Ok(result) => RpcResponse::success(id, result),
        Err(error) => RpcResponse::failure(id, error),
    })
}

fn invalid_request(id: Value) -> RpcResponse {
    RpcResponse::failure(id, RpcError::new(INVALID_REQUEST, "Invalid Request"))
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": { "tools": { "listChanged": false } },
        "serverInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

async fn call_tool(tools: &ToolRegistry, params: Option<&RawValue>) -> Result<Value, RpcError> {
    let params = params.ok_or_else(|| RpcError::new(INVALID_PARAMS, "Missing params"))?;
    let params: CallParams = serde_json::from_str(params.get())
        .map_err(|e| RpcError::new(INVALID_PARAMS, format!("Invalid params: {e}")))?;

    let tool = tools
        .get(&params.name)
        .ok_or_else(|| RpcError::new(INVALID_PARAMS, format!("Unknown tool: {}", params.name)))?;

    match tool.call(params.arguments.as_deref()).await {
        Ok(output) => Ok(json!({
            "content": [{ "type": "text", "text": output.to_string() }],
            "structuredContent": output,
            "isError": false,
        })),
        Err(AppError::ToolError { message, .. }) => Ok(json!({
            "content": [{ "type": "text", "text": message }],
            "isError": true,
        })),
        Err(AppError::SerializationError(e)) => Err(RpcError::new(
            INVALID_PARAMS,
            format!("Invalid arguments for {}: {e}", params.name),
        )),
        Err(e) => {
            warn!(tool = %params.name, error = %e, "Tool dispatch failed");
            Err(RpcError::new(INTERNAL_ERROR, "Internal error"))
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn registry() -> ToolRegistry {
        ToolRegistry::with_defaults(false)
    }

    async fn call(body: &str) -> RpcResponse {
        dispatch(&registry(), body.as_bytes())
            .await
            .expect("expected a response")
    }

    #[tokio::test]
    async fn test_ping() {
        let response = call(r#"{"jsonrpc":"2.0","id":1,"method":"ping"}"#).await;

        assert_eq!(response.id, json!(1));
        assert_eq!(response.result, Some(json!({})));
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn test_initialize_reports_tools_capability() {
        let response = call(r#"{"jsonrpc":"2.0","id":"init","method":"initialize","params":{}}"#).await;
        let result = response.result.unwrap();

        assert_eq!(response.id, json!("init"));
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn test_tools_list() {
        let response = call(r#"{"jsonrpc":"2.0","id":2,"method":"tools/list"}"#).await;
        let tools = response.result.unwrap()["tools"].clone();

        assert_eq!(tools[0]["name"], "generate_uuid");
        assert!(tools[0]["inputSchema"].is_object());
    }

    #[tokio::test]
    async fn test_tools_call_generate_uuid() {
        let response = call(
            r#"{"jsonrpc":"2.0","id":3,"method":"tools/call","params":{"name":"generate_uuid","arguments":{}}}"#,
        )
        .await;
        let result = response.result.unwrap();

        assert_eq!(result["isError"], false);
        let uuid = result["structuredContent"]["uuid"].as_str().unwrap();
        assert!(uuid::Uuid::parse_str(uuid).is_ok());
    }

    #[tokio::test]
    async fn test_tools_call_without_arguments() {
        let response = call(
            r#"{"jsonrpc":"2.0","id":4,"method":"tools/call","params":{"name":"generate_uuid"}}"#,
        )
        .await;
        assert_eq!(response.result.unwrap()["isError"], false);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let response = call(
            r#"{"jsonrpc":"2.0","id":5,"method":"tools/call","params":{"name":"nope","arguments":{}}}"#,
        )
        .await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_bad_arguments() {
        let response = call(
            r#"{"jsonrpc":"2.0","id":6,"method":"tools/call","params":{"name":"generate_uuid","arguments":[1]}}"#,
        )
        .await;
        assert_eq!(response.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let response = call(r#"{"jsonrpc":"2.0","id":7,"method":"resources/list"}"#).await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_parse_error() {
        let response = call("{not json").await;

        assert_eq!(response.id, Value::Null);
        assert_eq!(response.error.unwrap().code, PARSE_ERROR);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        for body in [
            r#"[{"jsonrpc":"2.0","id":1,"method":"ping"}]"#,
            r#"{"jsonrpc":"1.0","id":1,"method":"ping"}"#,
            r#"{"jsonrpc":"2.0","id":1}"#,
        ] {
            let response = call(body).await;
            assert_eq!(response.error.unwrap().code, INVALID_REQUEST, "{body}");
        }
    }

    #[tokio::test]
    async fn test_invalid_request_echoes_id() {
        let response = call(r#"{"jsonrpc":"2.0","id":9}"#).await;
        assert_eq!(response.id, json!(9));
    }

    #[tokio::test]
    async fn test_wrong_version_echoes_id() {
        let response = call(r#"{"jsonrpc":"1.0","id":"v1","method":"ping"}"#).await;

        assert_eq!(response.id, json!("v1"));
        assert_eq!(response.error.unwrap().code, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_notification_gets_no_response() {
        let response = dispatch(
            &registry(),
            br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .await;
        assert!(response.is_none());
    }
}
