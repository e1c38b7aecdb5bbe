//! Application routing and middleware composition.
//!
//! # Middleware Stack (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────────┐
//! │  Trace span          │ ← declares request_id and rpc.* fields
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │  Request ID          │ ← X-Request-Id on every response
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │  RPC introspection   │ ← method / id / tool name onto the span
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │  HTTP metrics        │ ← counts and times everything below
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │  Rate limiting       │ ← 429 if the client's bucket is empty
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │  Authentication      │ ← 401 on protected prefixes (default /mcp)
//! └──────────┬───────────┘
//!            ▼
//! ┌──────────────────────┐
//! │  Body limit, timeout │ ← 413 / 408
//! └──────────┬───────────┘
//!            ▼
//!        Handler
//! ```
//!
//! # Routes
//!
//! - `POST /mcp`, `POST /mcp/` - JSON-RPC dispatcher
//! - `GET /health` - Liveness
//! - `GET /metrics` - Prometheus exposition (404 when metrics are disabled)

use axum::body::Body;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::field::Empty;
use tracing::{info, info_span, warn};

use crate::middleware::{
    ApiKeyAuth, ApiKeySet, HttpMetricsLayer, RateLimitLayer, RequestIdLayer,
    RpcIntrospectionLayer,
};
use crate::rpc;
use crate::state::AppState;

/// Build the application router with all routes and middleware configured.
///
/// Stages are switched on from `state.config`:
///
/// - **Rate Limiting**: when `rate_limit_enabled` (limiter lives in `state`)
/// - **Authentication**: when `auth_enabled`, for `auth_protected_prefixes`
/// - **Payload logging**: `log_payloads` controls what introspection records
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    let mut router = Router::new()
        .route("/mcp", post(rpc::handle_rpc))
        .route("/mcp/", post(rpc::handle_rpc))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics));

    // =========================================================================
    // Apply Middleware Stack (order matters - applied bottom to top)
    // =========================================================================

    // 1. Transport guards around the dispatcher
    info!(
        max_body_bytes = config.max_request_body_size,
        timeout_secs = config.request_timeout.as_secs(),
        "Request limits configured"
    );
    router = router
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            config.request_timeout,
        ))
        .layer(DefaultBodyLimit::max(config.max_request_body_size));

    // 2. Authentication (if enabled)
    if config.auth_enabled {
        let keys = ApiKeySet::new(&config.api_keys);
        if keys.is_empty() {
            warn!("AUTH_ENABLED is set but API_KEYS is empty; every protected request will be rejected");
        }
        info!(
            keys = keys.len(),
            protected_prefixes = ?config.auth_protected_prefixes,
            failure_limit_per_minute = config.auth_failure_limit_per_minute,
            "API key authentication enabled"
        );
        router = router.layer(
            ApiKeyAuth::new(keys, config.auth_protected_prefixes.clone())
                .with_failure_limit(config.auth_failure_limit_per_minute),
        );
    } else {
        info!("API key authentication disabled (AUTH_ENABLED=false)");
    }

    // 3. Rate limiting (if enabled)
    if let Some(limiter) = &state.rate_limiter {
        router = router.layer(RateLimitLayer::new(limiter.clone()));
    }

    // 4. Duration/outcome metrics, wrapping both denying stages
    router = router.layer(HttpMetricsLayer::new());

    // 5. Introspection, before anything that can deny
    if config.log_payloads {
        warn!("Payload logging enabled: tool arguments and request bodies will be recorded");
    }
    router = router.layer(RpcIntrospectionLayer::new(config.log_payloads));

    // 6. Request ID
    router = router.layer(RequestIdLayer::new());

    // 7. Tracing span (outermost)
    router = router.layer(TraceLayer::new_for_http().make_span_with(make_request_span));

    router.with_state(state)
}

/// Request span with every field inner stages may record.
fn make_request_span(req: &Request<Body>) -> tracing::Span {
    info_span!(
        "http_request",
        method = %req.method(),
        uri = %req.uri(),
        version = ?req.version(),
        request_id = Empty,
        rpc.jsonrpc.version = Empty,
        rpc.method = Empty,
        rpc.request.id = Empty,
        rpc.tool.name = Empty,
        rpc.tool.arguments = Empty,
        rpc.request.payload = Empty,
        rpc.body_too_large = Empty,
    )
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "healthy": true }))
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    match &state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
