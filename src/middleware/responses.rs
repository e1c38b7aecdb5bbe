//! Structured denial responses produced by the admission stages.
//!
//! Bodies are always a single-field JSON object: `{"error":"<message>"}`.

use axum::Json;
use axum::body::Body;
use axum::http::header::{RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::{HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use serde::Serialize;

pub const RATE_LIMIT_EXCEEDED: &str = "rate limit exceeded";
pub const MISSING_API_KEY: &str = "missing API key";
pub const INVALID_API_KEY: &str = "invalid API key";
pub const AUTH_THROTTLED: &str = "too many failed authentication attempts";

/// Error response body for denials.
#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

fn json_error(status: StatusCode, message: &str) -> Response<Body> {
    (status, Json(ErrorBody { error: message })).into_response()
}

/// 429 for admission denial. Clients should back off for one second.
pub fn rate_limited() -> Response<Body> {
    let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, RATE_LIMIT_EXCEEDED);
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

/// 401 for a missing or unrecognised credential.
pub fn unauthorized(message: &str) -> Response<Body> {
    let mut response = json_error(StatusCode::UNAUTHORIZED, message);
    response
        .headers_mut()
        .insert(WWW_AUTHENTICATE, HeaderValue::from_static("API-Key"));
    response
}

/// 429 for a client locked out after repeated authentication failures.
pub fn auth_throttled(retry_after_secs: u64) -> Response<Body> {
    let mut response = json_error(StatusCode::TOO_MANY_REQUESTS, AUTH_THROTTLED);
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}
