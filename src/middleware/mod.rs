//! HTTP middleware for admission control, authentication and observability.
//!
//! # Architecture
//!
//! ```text
//! Request → Trace span → Request ID → RPC introspection → Metrics
//!         → Rate Limiter → Auth → Body limit / Timeout → Dispatcher
//!                ↓           ↓                ↓
//!          429 Too Many  401 Unauth     413 / 408
//! ```
//!
//! Introspection runs before any stage that can deny, so denied requests are
//! still traceable. Metrics wrap both denying stages, so 429 and 401 are
//! counted.
//!
//! # Security Considerations
//!
//! - API key comparison is constant-time across the whole key set
//! - Client identity trusts proxy headers; see [`ip`] for deployment notes
//! - Payload fields are only logged when explicitly enabled

pub mod auth;
pub mod introspect;
pub mod ip;
pub mod metrics;
pub mod rate_limit;
pub mod request_id;
pub mod responses;

pub use auth::{ApiKeyAuth, ApiKeySet};
pub use introspect::{RpcIntrospectionLayer, RpcRequestMetadata};
pub use ip::{IdentitySource, UNKNOWN_CLIENT, client_identity, resolve_identity};
pub use metrics::HttpMetricsLayer;
pub use rate_limit::{RateLimitLayer, RateLimiter, RateLimiterConfig};
pub use request_id::{RequestId, RequestIdLayer};
