//! # MCP Gateway
//!
//! An HTTP gateway that admits, authenticates, observes and meters JSON-RPC
//! requests before they reach an MCP tool dispatcher:
//!
//! - **Admission control**: per-client token buckets with background expiry
//! - **Authentication**: constant-time API key checks on protected prefixes
//! - **Observability**: JSON-RPC method, id and tool name on every request span,
//!   with payloads recorded only on explicit opt-in
//! - **Metrics**: request, denial and tool-call counters for Prometheus
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Trace → Request ID → Introspection → Metrics               │
//! │        → Rate Limit → Auth → Body limit / Timeout           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  JSON-RPC dispatcher (initialize, ping, tools/*)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  ToolRegistry (Traced<T: Tool>)                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::net::SocketAddr;
//! use mcp_gateway::{AppState, Config, build_router};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let state = AppState::new(config.clone());
//!     let app = build_router(state.clone());
//!
//!     let listener = tokio::net::TcpListener::bind(config.server_addr()).await?;
//!     axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;
//!
//!     state.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Security Configuration
//!
//! Enable API key authentication:
//! ```bash
//! AUTH_ENABLED=true API_KEYS=key-one,key-two cargo run
//! ```
//!
//! Tune rate limiting:
//! ```bash
//! RATE_LIMIT_RPS=100 RATE_LIMIT_BURST=50 cargo run
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod rpc;
pub mod state;
pub mod tools;
pub mod utils;

// Re-exports for convenience
pub use config::Config;
pub use error::{AppError, AppResult};
pub use routes::build_router;
pub use state::AppState;
pub use tools::{Tool, ToolRegistry};
