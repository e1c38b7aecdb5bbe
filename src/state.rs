//! Shared application state for Axum handlers.
//!
//! Holds the configuration, the tool registry, the rate limiter and the
//! Prometheus handle. Everything is behind `Arc`, so cloning per request is
//! cheap.
//!
//! # Structured Concurrency
//!
//! The rate limiter owns the only background task (its idle-bucket sweep).
//! Call [`AppState::shutdown`] after the server stops to cancel it and wait
//! for it to exit.

use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{debug, info};

use crate::config::Config;
use crate::middleware::{RateLimiter, RateLimiterConfig};
use crate::tools::ToolRegistry;

/// Shared application state.
///
/// # Lifecycle
///
/// ```rust,ignore
/// let state = AppState::new(config).with_metrics(handle);
/// // ... serve ...
/// state.shutdown().await;
/// ```
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Tools served by `tools/list` and `tools/call`
    pub tools: Arc<ToolRegistry>,
    /// Per-client limiter; `None` when rate limiting is disabled
    pub rate_limiter: Option<Arc<RateLimiter>>,
    /// Prometheus render handle; `None` when metrics are disabled
    pub metrics: Option<PrometheusHandle>,
}

impl AppState {
    /// Build state from configuration with the bundled tools.
    ///
    /// Must be called inside a Tokio runtime when rate limiting is enabled:
    /// the limiter spawns its sweep task.
    pub fn new(config: Config) -> Self {
        let tools = ToolRegistry::with_defaults(config.log_payloads);
        Self::with_tools(config, tools)
    }

    /// Build state with a caller-supplied tool registry.
    pub fn with_tools(config: Config, tools: ToolRegistry) -> Self {
        let rate_limiter = config.rate_limit_enabled.then(|| {
            Arc::new(RateLimiter::new(RateLimiterConfig::new(
                config.rate_limit_rps,
                config.rate_limit_burst,
                config.rate_limit_cleanup_interval,
            )))
        });

        if let Some(limiter) = &rate_limiter {
            let effective = limiter.config();
            info!(
                rps = effective.rate_per_second,
                burst = effective.burst,
                cleanup_interval_secs = effective.cleanup_interval.as_secs(),
                "Rate limiting enabled"
            );
        } else {
            info!("Rate limiting disabled (RATE_LIMIT_ENABLED=false)");
        }

        debug!(tools = tools.len(), "Tool registry ready");

        Self {
            config: Arc::new(config),
            tools: Arc::new(tools),
            rate_limiter,
            metrics: None,
        }
    }

    /// Attach an installed Prometheus recorder handle.
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Stop background tasks and wait for them to finish.
    ///
    /// Safe to call more than once.
    pub async fn shutdown(&self) {
        if let Some(limiter) = &self.rate_limiter {
            limiter.shutdown().await;
        }
        info!("Background tasks stopped");
    }
}
