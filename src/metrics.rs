//! Prometheus metrics for gateway observability.
//!
//! Recording goes through the `metrics` facade, so every function here is a
//! no-op until a recorder is installed. `main` installs the Prometheus
//! recorder with [`install_recorder`] and the handle is rendered at
//! `GET /metrics`.
//!
//! # Available Metrics
//!
//! ## Counters
//! - `mcp_http_requests_total` - Requests handled (labels: path, method, status)
//! - `mcp_rate_limit_rejections_total` - Requests denied by admission control
//! - `mcp_auth_failures_total` - Authentication failures (label: reason)
//! - `mcp_tool_calls_total` - Tool invocations (labels: tool, status)
//!
//! ## Histograms
//! - `mcp_http_request_duration_seconds` - Request duration (labels: path, method, status)
//! - `mcp_tool_call_duration_seconds` - Tool execution time (label: tool)
//!
//! ## Gauges
//! - `mcp_rate_limit_tracked_clients` - Buckets held by the rate limiter after each sweep

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Metric names as constants for consistency.
pub mod names {
    pub const HTTP_REQUESTS_TOTAL: &str = "mcp_http_requests_total";
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "mcp_http_request_duration_seconds";
    pub const RATE_LIMIT_REJECTIONS_TOTAL: &str = "mcp_rate_limit_rejections_total";
    pub const AUTH_FAILURES_TOTAL: &str = "mcp_auth_failures_total";
    pub const RATE_LIMIT_TRACKED_CLIENTS: &str = "mcp_rate_limit_tracked_clients";
    pub const TOOL_CALLS_TOTAL: &str = "mcp_tool_calls_total";
    pub const TOOL_CALL_DURATION_SECONDS: &str = "mcp_tool_call_duration_seconds";
}

/// Install the global Prometheus recorder and describe all metrics.
///
/// Can only succeed once per process.
///
/// # Returns
///
/// A handle for rendering the exposition text, or an error message.
pub fn install_recorder() -> Result<PrometheusHandle, String> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus recorder: {e}"))?;

    describe_counter!(
        names::HTTP_REQUESTS_TOTAL,
        "Total number of HTTP requests handled"
    );
    describe_counter!(
        names::RATE_LIMIT_REJECTIONS_TOTAL,
        "Total number of requests rejected by the rate limiter"
    );
    describe_counter!(
        names::AUTH_FAILURES_TOTAL,
        "Total number of failed API key authentications"
    );
    describe_counter!(names::TOOL_CALLS_TOTAL, "Total number of tool invocations");

    describe_histogram!(
        names::HTTP_REQUEST_DURATION_SECONDS,
        "HTTP request duration in seconds"
    );
    describe_histogram!(
        names::TOOL_CALL_DURATION_SECONDS,
        "Tool execution duration in seconds"
    );

    describe_gauge!(
        names::RATE_LIMIT_TRACKED_CLIENTS,
        "Number of client buckets held by the rate limiter"
    );

    info!("Prometheus recorder installed");
    Ok(handle)
}

/// Record a completed HTTP request.
pub fn record_request(path: &str, method: &str, status: u16, duration_secs: f64) {
    let status = status.to_string();
    counter!(names::HTTP_REQUESTS_TOTAL, "path" => path.to_string(), "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    histogram!(names::HTTP_REQUEST_DURATION_SECONDS, "path" => path.to_string(), "method" => method.to_string(), "status" => status)
        .record(duration_secs);
}

/// Record a request denied by admission control.
pub fn record_rate_limit_rejection() {
    counter!(names::RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
}

/// Record an authentication failure (`missing`, `invalid` or `throttled`).
pub fn record_auth_failure(reason: &'static str) {
    counter!(names::AUTH_FAILURES_TOTAL, "reason" => reason).increment(1);
}

/// Update the tracked-clients gauge.
pub fn set_tracked_clients(count: usize) {
    gauge!(names::RATE_LIMIT_TRACKED_CLIENTS).set(count as f64);
}

/// Record a tool invocation and its duration.
pub fn record_tool_call(tool: &'static str, success: bool, duration_secs: f64) {
    let status = if success { "success" } else { "error" };
    counter!(names::TOOL_CALLS_TOTAL, "tool" => tool, "status" => status).increment(1);
    histogram!(names::TOOL_CALL_DURATION_SECONDS, "tool" => tool).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    // Recording without an installed recorder must be a silent no-op.

    #[test]
    fn test_record_request() {
        record_request("/mcp", "POST", 200, 0.01);
    }

    #[test]
    fn test_record_admission_and_auth() {
        record_rate_limit_rejection();
        record_auth_failure("missing");
        record_auth_failure("invalid");
        set_tracked_clients(3);
    }

    #[test]
    fn test_record_tool_call() {
        record_tool_call("generate_uuid", true, 0.0001);
        record_tool_call("generate_uuid", false, 0.0001);
    }
}
