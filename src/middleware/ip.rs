//! Client identity resolution for admission control.
//!
//! The identity string is the rate limiter's bucket key (and the auth failure
//! throttle's key). It is derived the way a reverse proxy presents the true
//! client:
//!
//! 1. `X-Forwarded-For`: first comma-separated entry, trimmed
//! 2. `X-Real-IP`: trimmed
//! 3. The raw peer address with its port stripped
//! 4. [`UNKNOWN_CLIENT`] when none of the above is available
//!
//! # Performance
//!
//! - Uses `Cow<'static, str>` to avoid allocation for the "unknown" fallback
//! - Header parsing short-circuits on the first match
//!
//! # Security Warning: Identity Spoofing Risk
//!
//! **Header values are trusted verbatim.** They are treated as opaque identity
//! strings and never validated as addresses. A client that can reach this
//! service directly can pick its own bucket by setting `X-Forwarded-For`.
//! Deploy behind a reverse proxy that overwrites (not appends to) these
//! headers, and block direct access:
//!
//! ```nginx
//! proxy_set_header X-Real-IP $remote_addr;
//! proxy_set_header X-Forwarded-For $remote_addr;
//! ```
//!
//! # Internal Architecture
//!
//! ```text
//!   ┌────────────────────────┐   ┌─────────────────────────┐
//!   │ resolve_identity()     │ ← │ client_identity(&req)   │
//!   │ pure, header strings   │   │ reads headers +         │
//!   │ + peer address string  │   │ ConnectInfo<SocketAddr> │
//!   └────────────────────────┘   └─────────────────────────┘
//! ```

use std::borrow::Cow;
use std::net::SocketAddr;

use axum::extract::ConnectInfo;
use axum::http::Request;

/// Header carrying the proxy chain, client first.
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Header carrying the single client address set by some proxies.
pub const X_REAL_IP: &str = "x-real-ip";

/// Fallback identity when no client address can be determined.
///
/// All such requests share one bucket. This happens when the service is
/// driven without `ConnectInfo` (e.g. in-process tests) and no proxy headers
/// are present.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Where an identity was found.
///
/// Kept separate from the string so callers can log the source without
/// re-parsing headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentitySource {
    ForwardedFor,
    RealIp,
    Peer,
    Unknown,
}

/// Resolve a client identity from raw header values and the peer address.
///
/// Empty header values are treated as absent, so an empty
/// `X-Forwarded-For` falls through to `X-Real-IP`.
// TODO: accept a trusted-proxy hop list and walk X-Forwarded-For from the
// right, skipping trusted hops, instead of trusting the first entry.
pub fn resolve_identity<'a>(
    forwarded_for: Option<&'a str>,
    real_ip: Option<&'a str>,
    peer_addr: Option<&'a str>,
) -> (&'a str, IdentitySource) {
    // Format: "client, proxy1, proxy2" - we want the first (client) entry
    if let Some(value) = forwarded_for.filter(|v| !v.is_empty()) {
        let first = value.split(',').next().unwrap_or(value);
        return (first.trim(), IdentitySource::ForwardedFor);
    }

    if let Some(value) = real_ip.filter(|v| !v.is_empty()) {
        return (value.trim(), IdentitySource::RealIp);
    }

    match peer_addr {
        Some(addr) => (split_host(addr).unwrap_or(addr), IdentitySource::Peer),
        None => (UNKNOWN_CLIENT, IdentitySource::Unknown),
    }
}

/// Strip the port from a `host:port` address.
///
/// Accepts bracketed IPv6 (`[::1]:8080`). Returns `None` when the address has
/// no port or is ambiguous (a bare IPv6 address), in which case callers use
/// the address verbatim.
pub fn split_host(addr: &str) -> Option<&str> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        after.strip_prefix(':')?;
        return Some(host);
    }

    let (host, _port) = addr.rsplit_once(':')?;
    if host.contains(':') {
        // Too many colons: unbracketed IPv6
        return None;
    }
    Some(host)
}

/// Resolve the client identity for a request.
///
/// Reads `X-Forwarded-For`, `X-Real-IP` and, failing those, the peer address
/// from axum's `ConnectInfo<SocketAddr>` extension (present when the server is
/// started with `into_make_service_with_connect_info`).
///
/// # Returns
///
/// `Cow<'static, str>` - Borrowed for "unknown" (no allocation), owned otherwise.
#[inline]
pub fn client_identity<B>(req: &Request<B>) -> (Cow<'static, str>, IdentitySource) {
    let header = |name: &str| req.headers().get(name).and_then(|v| v.to_str().ok());
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string());

    let (identity, source) = resolve_identity(
        header(X_FORWARDED_FOR),
        header(X_REAL_IP),
        peer.as_deref(),
    );

    match source {
        IdentitySource::Unknown => (Cow::Borrowed(UNKNOWN_CLIENT), source),
        _ => (Cow::Owned(identity.to_string()), source),
    }
}
