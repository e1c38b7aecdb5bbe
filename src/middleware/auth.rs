//! API key authentication middleware.
//!
//! # Security Features
//!
//! - **Constant-time comparison**: every configured key is compared with
//!   `subtle`, and the scan always covers the full set, so response time does
//!   not reveal which key (or which byte) matched
//! - **Selective protection**: only paths under the configured protected
//!   prefixes (default `/mcp`) require a key; `/health` and `/metrics` stay open
//! - **Brute force protection** (optional): per-client lockout after too many
//!   failed attempts
//!
//! # Usage
//!
//! ```bash
//! AUTH_ENABLED=true API_KEYS=key-one,key-two cargo run
//! curl -H "X-API-Key: key-one" -d '{"jsonrpc":"2.0","id":1,"method":"ping"}' \
//!     http://localhost:8080/mcp
//! ```
//!
//! # Failure Responses
//!
//! | Situation | Status | Body |
//! |---|---|---|
//! | No `X-API-Key` header (or empty) | 401 | `{"error":"missing API key"}` |
//! | Key not recognised | 401 | `{"error":"invalid API key"}` |
//! | Client locked out | 429 | `{"error":"too many failed authentication attempts"}` |

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, Response};
use dashmap::DashMap;
use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use subtle::{Choice, ConstantTimeEq};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};
use tracing::{debug, warn};

use super::ip::client_identity;
use super::responses::{self, INVALID_API_KEY, MISSING_API_KEY};
use crate::metrics;

/// Header name for API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Immutable set of valid API keys.
///
/// Cheap to clone; safe to share across threads without locking.
#[derive(Clone, Default)]
pub struct ApiKeySet {
    keys: Arc<[Box<[u8]>]>,
}

impl ApiKeySet {
    /// Build a key set. Empty keys are dropped and duplicates collapsed, so at
    /// most one stored key can match a presented one.
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut unique: Vec<Box<[u8]>> = Vec::new();
        for key in keys {
            let bytes = key.as_ref().as_bytes();
            if !bytes.is_empty() && !unique.iter().any(|k| k.as_ref() == bytes) {
                unique.push(bytes.into());
            }
        }

        Self {
            keys: unique.into(),
        }
    }

    /// Check a presented key against the set.
    ///
    /// Always scans every stored key. An empty key is never valid.
    pub fn validate(&self, key: &str) -> bool {
        self.validate_bytes(key.as_bytes())
    }

    /// Byte-level variant of [`validate`](Self::validate) for raw header values.
    pub fn validate_bytes(&self, presented: &[u8]) -> bool {
        if presented.is_empty() {
            return false;
        }

        let mut matched = Choice::from(0u8);
        for stored in self.keys.iter() {
            matched |= stored.as_ref().ct_eq(presented);
        }
        matched.into()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl fmt::Debug for ApiKeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never print key material
        f.debug_struct("ApiKeySet")
            .field("count", &self.keys.len())
            .finish()
    }
}

/// Result of checking a request's credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    MissingKey,
    InvalidKey,
}

impl AuthOutcome {
    /// Label used for logs and the `reason` metric label.
    pub fn reason(&self) -> &'static str {
        match self {
            AuthOutcome::Authorized => "authorized",
            AuthOutcome::MissingKey => "missing",
            AuthOutcome::InvalidKey => "invalid",
        }
    }
}

/// Check the `X-API-Key` header of a request against a key set.
///
/// An absent or empty header is a missing credential; anything else that
/// does not match (including non-UTF-8 bytes) is invalid.
pub fn authenticate<B>(req: &Request<B>, keys: &ApiKeySet) -> AuthOutcome {
    match req.headers().get(API_KEY_HEADER) {
        None => AuthOutcome::MissingKey,
        Some(value) if value.is_empty() => AuthOutcome::MissingKey,
        Some(value) if keys.validate_bytes(value.as_bytes()) => AuthOutcome::Authorized,
        Some(_) => AuthOutcome::InvalidKey,
    }
}

/// Type alias for auth failure rate limiter (per client).
type AuthFailureLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// How often stale failure state is pruned.
const FAILURE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// Per-client lockout after repeated authentication failures.
///
/// Failures are metered with a GCRA quota; once a client exceeds it, it is
/// locked out until the quota would admit another failure. While locked out,
/// requests are rejected before the key is examined, so guesses made during
/// the lockout reveal nothing.
///
/// Identities come from client-controlled headers, so both tables are pruned
/// every [`FAILURE_PRUNE_INTERVAL`] by a task that stops when the throttle is
/// dropped.
struct FailureThrottle {
    limiter: Arc<AuthFailureLimiter>,
    locked_until: Arc<DashMap<String, Instant>>,
    cancellation_token: CancellationToken,
}

impl FailureThrottle {
    fn new(quota: Quota) -> Self {
        Self {
            limiter: Arc::new(RateLimiter::keyed(quota)),
            locked_until: Arc::new(DashMap::new()),
            cancellation_token: CancellationToken::new(),
        }
    }

    /// Remaining lockout for a client, clearing expired entries.
    fn locked_out(&self, client: &str) -> Option<Duration> {
        let now = Instant::now();
        let remaining = self
            .locked_until
            .get(client)
            .map(|until| until.saturating_duration_since(now))?;

        if remaining.is_zero() {
            self.locked_until.remove(client);
            return None;
        }
        Some(remaining)
    }

    /// Record a failure; returns the lockout duration if this failure tripped it.
    fn record_failure(&self, client: &str) -> Option<Duration> {
        let not_until = self.limiter.check_key(&client.to_string()).err()?;
        let wait = not_until
            .wait_time_from(DefaultClock::default().now())
            .max(Duration::from_secs(1));

        self.locked_until
            .insert(client.to_string(), Instant::now() + wait);
        Some(wait)
    }

    /// Drop expired lockouts and failure counters that have fully recovered.
    fn prune(&self, now: Instant) -> usize {
        prune_failures(&self.limiter, &self.locked_until, now)
    }

    /// Must be called inside a Tokio runtime.
    fn spawn_prune_task(&self) {
        let limiter = Arc::clone(&self.limiter);
        let locked_until = Arc::clone(&self.locked_until);
        let cancel = self.cancellation_token.clone();

        tokio::spawn(async move {
            let mut ticker = interval(FAILURE_PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let expired = prune_failures(&limiter, &locked_until, Instant::now());
                        if expired > 0 {
                            debug!(expired, tracked = limiter.len(), "Pruned auth failure state");
                        }
                    }
                }
            }
        });
    }
}

impl Drop for FailureThrottle {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

fn prune_failures(
    limiter: &AuthFailureLimiter,
    locked_until: &DashMap<String, Instant>,
    now: Instant,
) -> usize {
    limiter.retain_recent();
    limiter.shrink_to_fit();

    let before = locked_until.len();
    locked_until.retain(|_, until| *until > now);
    before.saturating_sub(locked_until.len())
}

/// API key authentication layer.
///
/// Requests whose path does not start with a protected prefix pass through
/// untouched.
#[derive(Clone)]
pub struct ApiKeyAuth {
    keys: ApiKeySet,
    protected_prefixes: Arc<Vec<String>>,
    throttle: Option<Arc<FailureThrottle>>,
}

impl ApiKeyAuth {
    /// Create a new API key auth layer.
    ///
    /// # Arguments
    ///
    /// * `keys` - Valid API keys
    /// * `protected_prefixes` - Path prefixes that require a key
    pub fn new(keys: ApiKeySet, protected_prefixes: Vec<String>) -> Self {
        Self {
            keys,
            protected_prefixes: Arc::new(protected_prefixes),
            throttle: None,
        }
    }

    /// Lock out clients after `failures_per_minute` failed attempts (0 disables).
    ///
    /// A non-zero limit starts a pruning task, so this must be called inside a
    /// Tokio runtime.
    pub fn with_failure_limit(mut self, failures_per_minute: u32) -> Self {
        self.throttle = NonZeroU32::new(failures_per_minute).map(|limit| {
            let throttle = FailureThrottle::new(Quota::per_minute(limit));
            throttle.spawn_prune_task();
            Arc::new(throttle)
        });
        self
    }

    /// Check whether a path requires authentication.
    pub fn is_protected(&self, path: &str) -> bool {
        is_protected(&self.protected_prefixes, path)
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

fn is_protected(prefixes: &[String], path: &str) -> bool {
    prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

impl<S> Layer<S> for ApiKeyAuth {
    type Service = ApiKeyAuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ApiKeyAuthService {
            inner,
            keys: self.keys.clone(),
            protected_prefixes: self.protected_prefixes.clone(),
            throttle: self.throttle.clone(),
        }
    }
}

/// API key authentication service wrapper.
#[derive(Clone)]
pub struct ApiKeyAuthService<S> {
    inner: S,
    keys: ApiKeySet,
    protected_prefixes: Arc<Vec<String>>,
    throttle: Option<Arc<FailureThrottle>>,
}

impl<S> Service<Request<Body>> for ApiKeyAuthService<S>
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

        if !is_protected(&self.protected_prefixes, req.uri().path()) {
            return Box::pin(async move { inner.call(req).await });
        }

        // Client identity is only needed for failure tracking
        let client = self
            .throttle
            .as_ref()
            .map(|_| client_identity(&req).0.into_owned());

        if let (Some(throttle), Some(client)) = (&self.throttle, &client)
            && let Some(remaining) = throttle.locked_out(client)
        {
            let retry_after = remaining.as_secs().max(1);
            warn!(
                client = %client,
                retry_after_secs = retry_after,
                "Client locked out after repeated auth failures"
            );
            metrics::record_auth_failure("throttled");
            return Box::pin(async move { Ok(responses::auth_throttled(retry_after)) });
        }

        let outcome = authenticate(&req, &self.keys);
        if outcome == AuthOutcome::Authorized {
            debug!("API key authentication successful");
            return Box::pin(async move { inner.call(req).await });
        }

        warn!(
            path = %req.uri().path(),
            client = client.as_deref().unwrap_or("-"),
            reason = outcome.reason(),
            "API key authentication failed"
        );
        metrics::record_auth_failure(outcome.reason());

        if let (Some(throttle), Some(client)) = (&self.throttle, &client)
            && let Some(lockout) = throttle.record_failure(client)
        {
            let retry_after = lockout.as_secs().max(1);
            return Box::pin(async move { Ok(responses::auth_throttled(retry_after)) });
        }

        let message = match outcome {
            AuthOutcome::MissingKey => MISSING_API_KEY,
            _ => INVALID_API_KEY,
        };
        Box::pin(async move { Ok(responses::unauthorized(message)) })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_exact_match() {
        let keys = ApiKeySet::new(["abc123"]);

        assert!(keys.validate("abc123"));
        assert!(!keys.validate("abc124"));
        assert!(!keys.validate(""));
    }

    #[test]
    fn test_validate_length_mismatch() {
        let keys = ApiKeySet::new(["secret"]);

        assert!(!keys.validate("secre"));
        assert!(!keys.validate("secret1"));
        assert!(!keys.validate("SECRET"));
    }

    #[test]
    fn test_validate_multiple_keys() {
        let keys = ApiKeySet::new(["key1", "key2", "key3"]);

        assert!(keys.validate("key1"));
        assert!(keys.validate("key3"));
        assert!(!keys.validate("key4"));
    }

    #[test]
    fn test_empty_set_rejects_everything() {
        let keys = ApiKeySet::default();

        assert!(keys.is_empty());
        assert!(!keys.validate("anything"));
        assert!(!keys.validate(""));
    }

    #[test]
    fn test_new_drops_empty_and_duplicate_keys() {
        let keys = ApiKeySet::new(["a", "", "a", "b"]);
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_debug_does_not_leak_keys() {
        let keys = ApiKeySet::new(["super-secret"]);
        let printed = format!("{keys:?}");

        assert!(!printed.contains("super-secret"));
        assert!(printed.contains("count"));
    }

    #[test]
    fn test_authenticate_outcomes() {
        let keys = ApiKeySet::new(["abc123"]);

        let missing = Request::builder().body(Body::empty()).unwrap();
        assert_eq!(authenticate(&missing, &keys), AuthOutcome::MissingKey);

        let empty = Request::builder()
            .header(API_KEY_HEADER, "")
            .body(Body::empty())
            .unwrap();
        assert_eq!(authenticate(&empty, &keys), AuthOutcome::MissingKey);

        let invalid = Request::builder()
            .header(API_KEY_HEADER, "nope")
            .body(Body::empty())
            .unwrap();
        assert_eq!(authenticate(&invalid, &keys), AuthOutcome::InvalidKey);

        let valid = Request::builder()
            .header(API_KEY_HEADER, "abc123")
            .body(Body::empty())
            .unwrap();
        assert_eq!(authenticate(&valid, &keys), AuthOutcome::Authorized);
    }

    #[test]
    fn test_protected_prefixes() {
        let auth = ApiKeyAuth::new(ApiKeySet::new(["k"]), vec!["/mcp".to_string()]);

        assert!(auth.is_protected("/mcp"));
        assert!(auth.is_protected("/mcp/"));
        assert!(!auth.is_protected("/health"));
        assert!(!auth.is_protected("/metrics"));
    }

    #[test]
    fn test_failure_throttle_locks_out() {
        let throttle = FailureThrottle::new(Quota::per_minute(NonZeroU32::new(2).unwrap()));

        assert!(throttle.record_failure("1.2.3.4").is_none());
        assert!(throttle.record_failure("1.2.3.4").is_none());
        assert!(throttle.locked_out("1.2.3.4").is_none());

        let lockout = throttle.record_failure("1.2.3.4").expect("third failure locks out");
        assert!(lockout >= Duration::from_secs(1));
        assert!(throttle.locked_out("1.2.3.4").is_some());

        // Other clients unaffected
        assert!(throttle.locked_out("5.6.7.8").is_none());
    }

    #[test]
    fn test_prune_drops_expired_lockouts() {
        let throttle = FailureThrottle::new(Quota::per_minute(NonZeroU32::new(1).unwrap()));
        for n in 0..100 {
            let client = format!("10.0.{n}.1");
            throttle.record_failure(&client);
            assert!(throttle.record_failure(&client).is_some());
        }
        assert_eq!(throttle.locked_until.len(), 100);

        // Nothing has expired yet
        assert_eq!(throttle.prune(Instant::now()), 0);
        assert_eq!(throttle.locked_until.len(), 100);

        let later = Instant::now() + Duration::from_secs(120);
        assert_eq!(throttle.prune(later), 100);
        assert!(throttle.locked_until.is_empty());
    }

    #[test]
    fn test_prune_drops_recovered_failure_counters() {
        let quota = Quota::with_period(Duration::from_millis(1)).unwrap();
        let throttle = FailureThrottle::new(quota);
        for n in 0..100 {
            throttle.record_failure(&format!("10.1.{n}.1"));
        }
        assert_eq!(throttle.limiter.len(), 100);

        std::thread::sleep(Duration::from_millis(50));
        throttle.prune(Instant::now());

        assert!(throttle.limiter.is_empty());
    }

    #[tokio::test]
    async fn test_dropping_throttle_stops_prune_task() {
        let auth = ApiKeyAuth::new(ApiKeySet::new(["k"]), vec![]).with_failure_limit(3);
        let token = auth.throttle.as_ref().unwrap().cancellation_token.clone();
        assert!(!token.is_cancelled());

        drop(auth);
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_with_failure_limit_zero_disables() {
        let auth = ApiKeyAuth::new(ApiKeySet::new(["k"]), vec![]).with_failure_limit(0);
        assert!(auth.throttle.is_none());
    }
}
