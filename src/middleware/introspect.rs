//! JSON-RPC request introspection for observability.
//!
//! Peeks at the body of `POST /mcp` requests, extracts protocol metadata
//! (version, method, request id, tool name) and records it on the current
//! request span. The body is always handed downstream byte-for-byte as the
//! client sent it, whether or not parsing succeeds.
//!
//! # Limits
//!
//! At most [`MAX_INTROSPECTION_BYTES`] are buffered. Larger bodies are not
//! parsed: `rpc.body_too_large` is recorded and the already-read chunks are
//! replayed in front of the unread remainder. This stage never rejects a
//! request; size policy belongs to `DefaultBodyLimit` further in.
//!
//! # Payload Logging
//!
//! Tool arguments and the raw payload may carry credentials or personal data.
//! They are recorded only when the layer is built with `log_payloads = true`
//! (`LOG_PAYLOADS`). Tool names are always recorded.

use std::task::{Context, Poll};

use axum::body::{Body, Bytes};
use axum::http::{Method, Request, Response, header::CONTENT_LENGTH};
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use serde_json::Value;
use serde_json::value::RawValue;
use tower::{Layer, Service};
use tracing::{Span, debug};

/// Paths served by the RPC dispatcher.
pub const RPC_PATHS: [&str; 2] = ["/mcp", "/mcp/"];

/// Upper bound on bytes buffered for introspection (1 MiB).
pub const MAX_INTROSPECTION_BYTES: usize = 1024 * 1024;

/// Recorded payloads are cut to this many bytes.
pub const MAX_LOGGED_PAYLOAD_BYTES: usize = 4096;

/// Appended to a payload that was cut.
pub const TRUNCATION_MARKER: &str = "...(truncated)";

const TOOLS_CALL: &str = "tools/call";

/// JSON-RPC request identifier in its native JSON form.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcId {
    Number(serde_json::Number),
    String(String),
}

/// Metadata extracted from a JSON-RPC request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcRequestMetadata {
    pub jsonrpc: String,
    pub method: String,
    pub id: Option<RpcId>,
    pub tool_name: Option<String>,
    /// Raw tool arguments; only populated with payload logging on.
    pub tool_arguments: Option<String>,
    /// Truncated request body; only populated with payload logging on.
    pub payload: Option<String>,
}

impl RpcRequestMetadata {
    /// Record onto a span declaring the `rpc.*` fields.
    pub fn record(&self, span: &Span) {
        span.record("rpc.jsonrpc.version", self.jsonrpc.as_str());
        span.record("rpc.method", self.method.as_str());

        match &self.id {
            Some(RpcId::Number(n)) => {
                if let Some(i) = n.as_i64() {
                    span.record("rpc.request.id", i);
                } else if let Some(u) = n.as_u64() {
                    span.record("rpc.request.id", u);
                } else if let Some(f) = n.as_f64() {
                    span.record("rpc.request.id", f);
                }
            }
            Some(RpcId::String(s)) => {
                span.record("rpc.request.id", s.as_str());
            }
            None => {}
        }

        if let Some(name) = &self.tool_name {
            span.record("rpc.tool.name", name.as_str());
        }
        if let Some(arguments) = &self.tool_arguments {
            span.record("rpc.tool.arguments", arguments.as_str());
        }
        if let Some(payload) = &self.payload {
            span.record("rpc.request.payload", payload.as_str());
        }
    }
}

#[derive(Deserialize)]
struct Envelope<'a> {
    #[serde(default)]
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: String,
    #[serde(default, borrow)]
    params: Option<&'a RawValue>,
}

#[derive(Deserialize)]
struct ToolCallParams<'a> {
    #[serde(default)]
    name: String,
    #[serde(default, borrow)]
    arguments: Option<&'a RawValue>,
}

/// Extract metadata from a raw request body.
///
/// Returns `None` when the body is not a JSON object shaped like a JSON-RPC
/// envelope. Tool call params that fail to parse only drop the tool fields.
pub fn extract_metadata(body: &[u8], log_payloads: bool) -> Option<RpcRequestMetadata> {
    let envelope: Envelope<'_> = serde_json::from_slice(body).ok()?;

    let id = match envelope.id {
        Some(Value::Number(n)) => Some(RpcId::Number(n)),
        Some(Value::String(s)) => Some(RpcId::String(s)),
        _ => None,
    };

    let mut metadata = RpcRequestMetadata {
        jsonrpc: envelope.jsonrpc,
        method: envelope.method,
        id,
        ..Default::default()
    };

    if metadata.method == TOOLS_CALL
        && let Some(params) = envelope.params
        && let Ok(call) = serde_json::from_str::<ToolCallParams<'_>>(params.get())
    {
        metadata.tool_name = Some(call.name);
        if log_payloads {
            metadata.tool_arguments = call.arguments.map(|raw| raw.get().to_string());
        }
    }

    if log_payloads {
        metadata.payload = Some(truncate_payload(body));
    }

    Some(metadata)
}

/// Render a body for logging, cut at [`MAX_LOGGED_PAYLOAD_BYTES`].
///
/// Invalid UTF-8 is replaced; the cut never splits a character.
pub fn truncate_payload(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    if text.len() <= MAX_LOGGED_PAYLOAD_BYTES {
        return text.into_owned();
    }

    let mut end = MAX_LOGGED_PAYLOAD_BYTES;
    while !text.is_char_boundary(end) {
        end -= 1;
    }

    let mut truncated = String::with_capacity(end + TRUNCATION_MARKER.len());
    truncated.push_str(text.get(..end).unwrap_or_default());
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}

fn is_rpc_request<B>(req: &Request<B>) -> bool {
    req.method() == Method::POST && RPC_PATHS.contains(&req.uri().path())
}

fn declared_length<B>(req: &Request<B>) -> Option<u64> {
    req.headers()
        .get(CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

/// Outcome of a bounded body read.
enum BoundedRead {
    /// Entire body fits under the limit.
    Complete(Bytes),
    /// Limit exceeded; body rebuilt from read chunks plus the unread rest.
    TooLarge(Body),
    /// Stream errored; body rebuilt to replay the chunks and the error.
    Failed(Body),
}

async fn read_bounded(body: Body, limit: usize) -> BoundedRead {
    let mut stream = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut total = 0usize;

    while let Some(next) = stream.next().await {
        match next {
            Ok(chunk) => {
                total = total.saturating_add(chunk.len());
                chunks.push(chunk);

                if total > limit {
                    let replay = stream::iter(chunks.into_iter().map(Ok));
                    return BoundedRead::TooLarge(Body::from_stream(replay.chain(stream)));
                }
            }
            Err(err) => {
                let replay = chunks
                    .into_iter()
                    .map(Ok)
                    .chain(std::iter::once(Err(err)));
                return BoundedRead::Failed(Body::from_stream(stream::iter(replay)));
            }
        }
    }

    let bytes = match chunks.len() {
        0 => Bytes::new(),
        1 => chunks.swap_remove(0),
        _ => {
            let mut buf = Vec::with_capacity(total);
            for chunk in &chunks {
                buf.extend_from_slice(chunk);
            }
            Bytes::from(buf)
        }
    };
    BoundedRead::Complete(bytes)
}

/// Layer that records JSON-RPC metadata on the request span.
#[derive(Clone, Copy, Debug, Default)]
pub struct RpcIntrospectionLayer {
    log_payloads: bool,
}

impl RpcIntrospectionLayer {
    pub fn new(log_payloads: bool) -> Self {
        Self { log_payloads }
    }
}

impl<S> Layer<S> for RpcIntrospectionLayer {
    type Service = RpcIntrospectionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RpcIntrospectionService {
            inner,
            log_payloads: self.log_payloads,
        }
    }
}

/// Service produced by [`RpcIntrospectionLayer`].
#[derive(Clone)]
pub struct RpcIntrospectionService<S> {
    inner: S,
    log_payloads: bool,
}

impl<S> Service<Request<Body>> for RpcIntrospectionService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<Self::Response, Self::Error>> + Send>,
    >;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let mut inner = self.inner.clone();
        let log_payloads = self.log_payloads;

        if !is_rpc_request(&req) {
            return Box::pin(async move { inner.call(req).await });
        }

        Box::pin(async move {
            let span = Span::current();

            if declared_length(&req).is_some_and(|len| len > MAX_INTROSPECTION_BYTES as u64) {
                span.record("rpc.body_too_large", true);
                debug!("Skipping introspection, declared body exceeds limit");
                return inner.call(req).await;
            }

            let (parts, body) = req.into_parts();
            let body = match read_bounded(body, MAX_INTROSPECTION_BYTES).await {
                BoundedRead::Complete(bytes) => {
                    match extract_metadata(&bytes, log_payloads) {
                        Some(metadata) => metadata.record(&span),
                        None => debug!("Request body is not a JSON-RPC envelope"),
                    }
                    Body::from(bytes)
                }
                BoundedRead::TooLarge(body) => {
                    span.record("rpc.body_too_large", true);
                    debug!("Skipping introspection, body exceeds limit");
                    body
                }
                BoundedRead::Failed(body) => {
                    debug!("Request body stream failed during introspection");
                    body
                }
            };

            inner.call(Request::from_parts(parts, body)).await
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const TOOL_CALL: &[u8] =
        br#"{"jsonrpc":"2.0","method":"tools/call","id":2,"params":{"name":"x","arguments":{}}}"#;

    #[test]
    fn test_tool_call_without_payload_logging() {
        let metadata = extract_metadata(TOOL_CALL, false).unwrap();

        assert_eq!(metadata.jsonrpc, "2.0");
        assert_eq!(metadata.method, "tools/call");
        assert_eq!(metadata.id, Some(RpcId::Number(2.into())));
        assert_eq!(metadata.tool_name.as_deref(), Some("x"));
        assert_eq!(metadata.tool_arguments, None);
        assert_eq!(metadata.payload, None);
    }

    #[test]
    fn test_tool_call_with_payload_logging() {
        let metadata = extract_metadata(TOOL_CALL, true).unwrap();

        assert_eq!(metadata.tool_name.as_deref(), Some("x"));
        assert_eq!(metadata.tool_arguments.as_deref(), Some("{}"));
        assert_eq!(
            metadata.payload.as_deref(),
            Some(std::str::from_utf8(TOOL_CALL).unwrap())
        );
    }

    #[test]
    fn test_string_id_keeps_native_type() {
        let metadata =
            extract_metadata(br#"{"jsonrpc":"2.0","id":"req-7","method":"ping"}"#, false).unwrap();

        assert_eq!(metadata.id, Some(RpcId::String("req-7".to_string())));
        assert_eq!(metadata.tool_name, None);
    }

    #[test]
    fn test_notification_has_no_id() {
        let metadata = extract_metadata(
            br#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
            false,
        )
        .unwrap();

        assert_eq!(metadata.id, None);
        assert_eq!(metadata.method, "notifications/initialized");
    }

    #[test]
    fn test_unsupported_id_type_is_ignored() {
        let metadata =
            extract_metadata(br#"{"jsonrpc":"2.0","id":{"a":1},"method":"ping"}"#, false).unwrap();
        assert_eq!(metadata.id, None);
    }

    #[test]
    fn test_non_envelope_bodies() {
        assert!(extract_metadata(b"", false).is_none());
        assert!(extract_metadata(b"not json", false).is_none());
        assert!(extract_metadata(b"[1,2,3]", false).is_none());
        assert!(extract_metadata(br#"{"method":42}"#, false).is_none());
    }

    #[test]
    fn test_bad_tool_params_keep_envelope() {
        let metadata =
            extract_metadata(br#"{"jsonrpc":"2.0","id":1,"method":"tools/call","params":[1]}"#, false)
                .unwrap();

        assert_eq!(metadata.method, "tools/call");
        assert_eq!(metadata.tool_name, None);
    }

    #[test]
    fn test_tool_fields_only_for_tools_call() {
        let metadata = extract_metadata(
            br#"{"jsonrpc":"2.0","id":1,"method":"tools/list","params":{"name":"x"}}"#,
            true,
        )
        .unwrap();

        assert_eq!(metadata.tool_name, None);
        assert!(metadata.payload.is_some());
    }

    #[test]
    fn test_truncate_payload() {
        assert_eq!(truncate_payload(b"short"), "short");

        let exact = vec![b'a'; MAX_LOGGED_PAYLOAD_BYTES];
        assert_eq!(truncate_payload(&exact).len(), MAX_LOGGED_PAYLOAD_BYTES);

        let long = vec![b'a'; MAX_LOGGED_PAYLOAD_BYTES + 10];
        let truncated = truncate_payload(&long);
        assert!(truncated.ends_with(TRUNCATION_MARKER));
        assert_eq!(
            truncated.len(),
            MAX_LOGGED_PAYLOAD_BYTES + TRUNCATION_MARKER.len()
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        // 'é' is two bytes; an odd offset forces the cut to back off
        let mut body = vec![b'a'];
        body.extend("é".repeat(MAX_LOGGED_PAYLOAD_BYTES).as_bytes());

        let truncated = truncate_payload(&body);
        let kept = truncated.strip_suffix(TRUNCATION_MARKER).unwrap();
        assert_eq!(kept.len(), MAX_LOGGED_PAYLOAD_BYTES - 1);
    }

    #[tokio::test]
    async fn test_read_bounded_complete() {
        match read_bounded(Body::from("hello"), 16).await {
            BoundedRead::Complete(bytes) => assert_eq!(&bytes[..], b"hello"),
            _ => panic!("expected complete read"),
        }
    }

    #[tokio::test]
    async fn test_read_bounded_too_large_replays_everything() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"0123")),
            Ok(Bytes::from_static(b"4567")),
            Ok(Bytes::from_static(b"89")),
        ];
        let body = Body::from_stream(stream::iter(chunks));

        let rebuilt = match read_bounded(body, 5).await {
            BoundedRead::TooLarge(body) => body,
            _ => panic!("expected too large"),
        };

        let bytes = axum::body::to_bytes(rebuilt, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"0123456789");
    }

    #[test]
    fn test_is_rpc_request() {
        let post = |path: &str| {
            Request::builder()
                .method(Method::POST)
                .uri(path)
                .body(())
                .unwrap()
        };

        assert!(is_rpc_request(&post("/mcp")));
        assert!(is_rpc_request(&post("/mcp/")));
        assert!(!is_rpc_request(&post("/mcp/extra")));
        assert!(!is_rpc_request(&post("/health")));

        let get = Request::builder().uri("/mcp").body(()).unwrap();
        assert!(!is_rpc_request(&get));
    }
}
