//! `X-Request-Id` propagation.
//!
//! A client-supplied id is reused when it is short printable ASCII; otherwise
//! a UUIDv4 is generated. The id is recorded on the request span as
//! `request_id`, stored in the request extensions as [`RequestId`], and echoed
//! on every response, including denials from inner stages.
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:8080/health -i
//! ```

use std::task::{Context, Poll};

use axum::body::Body;
use axum::http::header::HeaderValue;
use axum::http::{Request, Response};
use tower::{Layer, Service};
use tracing::Span;
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied id that is accepted verbatim.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Request id assigned to the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub HeaderValue);

impl RequestId {
    pub fn as_str(&self) -> &str {
        // Only visible ASCII ever gets in
        self.0.to_str().unwrap_or_default()
    }
}

#[derive(Clone, Copy, Default)]
pub struct RequestIdLayer;

impl RequestIdLayer {
    pub fn new() -> Self {
        Self
    }
}

impl<S> Layer<S> for RequestIdLayer {
    type Service = RequestIdService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RequestIdService { inner }
    }
}

#[derive(Clone)]
pub struct RequestIdService<S> {
    inner: S,
}

impl<S> Service<Request<Body>> for RequestIdService<S>
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

    fn call(&mut self, mut req: Request<Body>) -> Self::Future {
        let request_id = accept_or_generate(&req);

        Span::current().record("request_id", request_id.as_str());
        req.headers_mut()
            .insert(REQUEST_ID_HEADER, request_id.0.clone());
        req.extensions_mut().insert(request_id.clone());

        let mut inner = self.inner.clone();

        Box::pin(async move {
            let mut response = inner.call(req).await?;
            response
                .headers_mut()
                .insert(REQUEST_ID_HEADER, request_id.0);
            Ok(response)
        })
    }
}

/// Reuse the client's id if acceptable, else generate one.
fn accept_or_generate<B>(req: &Request<B>) -> RequestId {
    if let Some(value) = req.headers().get(REQUEST_ID_HEADER)
        && is_acceptable(value)
    {
        return RequestId(value.clone());
    }

    let generated = Uuid::new_v4().to_string();
    // A hyphenated UUID is always a valid header value
    RequestId(
        HeaderValue::from_str(&generated)
            .unwrap_or_else(|_| HeaderValue::from_static("unknown")),
    )
}

fn is_acceptable(value: &HeaderValue) -> bool {
    let bytes = value.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= MAX_REQUEST_ID_LEN
        && bytes.iter().all(|b| b.is_ascii_graphic())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_request_id_is_kept() {
        let req = Request::builder()
            .header("x-request-id", "existing-id-123")
            .body(Body::empty())
            .unwrap();

        assert_eq!(accept_or_generate(&req).as_str(), "existing-id-123");
    }

    #[test]
    fn test_missing_request_id_is_generated() {
        let req = Request::builder().body(Body::empty()).unwrap();

        let id = accept_or_generate(&req);
        assert!(Uuid::parse_str(id.as_str()).is_ok());
    }

    #[test]
    fn test_unacceptable_ids_are_replaced() {
        for bad in ["", "has space", &"x".repeat(MAX_REQUEST_ID_LEN + 1)] {
            let req = Request::builder()
                .header("x-request-id", bad)
                .body(Body::empty())
                .unwrap();

            let id = accept_or_generate(&req);
            assert!(Uuid::parse_str(id.as_str()).is_ok(), "{bad:?} should be replaced");
        }
    }
}
