//! Per-client rate limiting using the token bucket algorithm.
//!
//! # Algorithm
//!
//! Every client identity owns a bucket holding up to `burst` tokens, refilled
//! continuously at `rate_per_second`. Each admitted request consumes one
//! token; a request arriving at an empty bucket is denied.
//!
//! - Token counts are fractional (`f64`); refill and consumption share one
//!   accumulator so repeated rounding never drifts
//! - Elapsed time uses the monotonic clock (`tokio::time::Instant`, so tests
//!   can pause and advance it)
//! - A client seen for the first time gets a full bucket minus the token
//!   spent on the current request
//!
//! # Concurrency
//!
//! Buckets live in a sharded [`DashMap`]. The read-modify-write of a bucket
//! happens while holding its shard's write lock, so decisions for one
//! identity are linearized; identities in other shards never contend.
//! Bucket references never leave the critical section.
//!
//! # Cleanup
//!
//! A background sweep runs every `cleanup_interval` and evicts buckets whose
//! last refill is older than `2 × cleanup_interval`. The sweep is stopped with
//! [`RateLimiter::stop`], which may be called any number of times, or
//! implicitly when the limiter is dropped.
//!
//! # Response
//!
//! On denial (429):
//! - `Retry-After: 1`
//! - `{"error":"rate limit exceeded"}`

use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, Response};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::{Instant, MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::{Layer, Service};
use tracing::{debug, trace};

use super::ip::client_identity;
use super::responses;
use crate::metrics;

/// Default sustained rate when the configured one is not positive.
pub const DEFAULT_RATE_PER_SECOND: f64 = 10.0;

/// Default bucket size when the configured one is zero.
pub const DEFAULT_BURST: u32 = 20;

/// Default sweep interval when the configured one is zero.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Rate limiter configuration.
///
/// Non-positive values are replaced by the defaults in [`normalized`](Self::normalized),
/// which [`RateLimiter::new`] always applies.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Tokens added per second.
    pub rate_per_second: f64,
    /// Maximum tokens a bucket can hold.
    pub burst: u32,
    /// How often idle buckets are swept.
    pub cleanup_interval: Duration,
}

impl RateLimiterConfig {
    pub fn new(rate_per_second: f64, burst: u32, cleanup_interval: Duration) -> Self {
        Self {
            rate_per_second,
            burst,
            cleanup_interval,
        }
    }

    /// Replace zero, negative or NaN values with the documented defaults.
    pub fn normalized(self) -> Self {
        Self {
            rate_per_second: if self.rate_per_second > 0.0 {
                self.rate_per_second
            } else {
                DEFAULT_RATE_PER_SECOND
            },
            burst: if self.burst > 0 {
                self.burst
            } else {
                DEFAULT_BURST
            },
            cleanup_interval: if self.cleanup_interval.is_zero() {
                DEFAULT_CLEANUP_INTERVAL
            } else {
                self.cleanup_interval
            },
        }
    }

    /// Idle age after which a bucket is evicted.
    pub fn max_idle(&self) -> Duration {
        self.cleanup_interval.saturating_mul(2)
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::new(DEFAULT_RATE_PER_SECOND, DEFAULT_BURST, DEFAULT_CLEANUP_INTERVAL)
    }
}

/// Token bucket state for one client.
///
/// Invariant: `0 <= tokens <= burst`; `last_refill` never moves backwards.
#[derive(Debug, Clone, Copy)]
struct ClientBucket {
    tokens: f64,
    last_refill: Instant,
}

impl ClientBucket {
    /// Bucket for a client whose first request is being admitted right now.
    fn first_request(burst: f64, now: Instant) -> Self {
        Self {
            tokens: burst - 1.0,
            last_refill: now,
        }
    }

    /// Refill for the time elapsed since the last check, then try to take a token.
    fn try_acquire(&mut self, now: Instant, rate: f64, burst: f64) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(burst);
        self.last_refill = self.last_refill.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

type ClientTable = DashMap<String, ClientBucket>;

/// Per-client token bucket limiter with a background idle sweep.
///
/// Must be created inside a Tokio runtime: construction spawns the sweep task.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = RateLimiter::new(RateLimiterConfig::new(10.0, 5, Duration::from_secs(300)));
/// assert!(limiter.allow("1.2.3.4"));
/// limiter.stop();
/// limiter.stop(); // no-op
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    clients: Arc<ClientTable>,
    config: RateLimiterConfig,
    cancellation_token: CancellationToken,
    task_tracker: TaskTracker,
}

impl RateLimiter {
    /// Create a limiter and start its sweep task.
    pub fn new(config: RateLimiterConfig) -> Self {
        let limiter = Self {
            clients: Arc::new(DashMap::new()),
            config: config.normalized(),
            cancellation_token: CancellationToken::new(),
            task_tracker: TaskTracker::new(),
        };

        limiter.spawn_sweep_task();
        limiter.task_tracker.close();

        limiter
    }

    /// Decide whether a request from `identity` may proceed.
    ///
    /// Returns `true` and consumes a token when at least one is available.
    pub fn allow(&self, identity: &str) -> bool {
        let rate = self.config.rate_per_second;
        let burst = f64::from(self.config.burst);

        // Fast path: existing client, no key allocation
        if let Some(mut bucket) = self.clients.get_mut(identity) {
            return bucket.try_acquire(Instant::now(), rate, burst);
        }

        // `entry` holds the shard lock, so a concurrent first request for the
        // same identity lands in the Occupied arm.
        match self.clients.entry(identity.to_owned()) {
            Entry::Occupied(mut occupied) => {
                occupied
                    .get_mut()
                    .try_acquire(Instant::now(), rate, burst)
            }
            Entry::Vacant(vacant) => {
                trace!(client = identity, "New rate limit bucket");
                vacant.insert(ClientBucket::first_request(burst, Instant::now()));
                true
            }
        }
    }

    /// Stop the background sweep. Safe to call more than once.
    pub fn stop(&self) {
        if !self.cancellation_token.is_cancelled() {
            debug!("Stopping rate limiter sweep");
        }
        self.cancellation_token.cancel();
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    /// Stop the sweep and wait for the task to exit.
    pub async fn shutdown(&self) {
        self.stop();
        self.task_tracker.wait().await;
    }

    /// Number of clients currently tracked.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Effective (normalized) configuration.
    pub fn config(&self) -> RateLimiterConfig {
        self.config
    }

    /// Evict buckets idle for longer than `2 × cleanup_interval`.
    ///
    /// Runs on the sweep task; exposed for callers that want an immediate pass.
    pub fn sweep(&self) -> usize {
        sweep_idle(&self.clients, Instant::now(), self.config.max_idle())
    }

    fn spawn_sweep_task(&self) {
        let clients = Arc::clone(&self.clients);
        let period = self.config.cleanup_interval;
        let max_idle = self.config.max_idle();
        let cancel = self.cancellation_token.clone();

        self.task_tracker.spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // Skip the first immediate tick

            loop {
                tokio::select! {
                    biased; // Check cancellation first

                    _ = cancel.cancelled() => {
                        debug!("Rate limiter sweep received cancellation signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let removed = sweep_idle(&clients, Instant::now(), max_idle);
                        if removed > 0 {
                            debug!(removed, remaining = clients.len(), "Evicted idle rate limit buckets");
                        }
                        metrics::set_tracked_clients(clients.len());
                    }
                }
            }

            debug!("Rate limiter sweep task shutting down");
        });
    }
}

impl Drop for RateLimiter {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

fn sweep_idle(clients: &ClientTable, now: Instant, max_idle: Duration) -> usize {
    let before = clients.len();
    clients.retain(|_, bucket| now.saturating_duration_since(bucket.last_refill) <= max_idle);
    before.saturating_sub(clients.len())
}

/// Rate limiting layer for Tower middleware stack.
///
/// Denied requests never reach inner services.
///
/// # Example
///
/// ```rust,ignore
/// let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::default()));
/// let app = Router::new()
///     .route("/mcp", post(handler))
///     .layer(RateLimitLayer::new(limiter));
/// ```
#[derive(Clone)]
pub struct RateLimitLayer {
    limiter: Arc<RateLimiter>,
}

impl RateLimitLayer {
    pub fn new(limiter: Arc<RateLimiter>) -> Self {
        Self { limiter }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimitService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            limiter: self.limiter.clone(),
        }
    }
}

/// Rate limiting service wrapper.
#[derive(Clone)]
pub struct RateLimitService<S> {
    inner: S,
    limiter: Arc<RateLimiter>,
}

impl<S> Service<Request<Body>> for RateLimitService<S>
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
        let (identity, source) = client_identity(&req);

        if !self.limiter.allow(&identity) {
            // Expected back-pressure, not an application error
            debug!(
                client = %identity,
                source = ?source,
                path = %req.uri().path(),
                "Rate limit exceeded"
            );
            metrics::record_rate_limit_rejection();
            return Box::pin(async { Ok(responses::rate_limited()) });
        }

        let mut inner = self.inner.clone();
        Box::pin(async move { inner.call(req).await })
    }
}
