//! Fuzz testing for request introspection and client identity parsing.
//!
//! Both run on untrusted input before any authentication, so they must
//! never panic:
//!
//! - `extract_metadata`: arbitrary request bodies, with and without payload logging
//! - `truncate_payload`: arbitrary bytes, including invalid UTF-8
//! - `resolve_identity` / `split_host`: arbitrary header and peer address strings
//!
//! # Running the Fuzz Tests
//!
//! ```bash
//! cargo +nightly install cargo-fuzz
//! cargo +nightly fuzz run fuzz_introspection -- -max_total_time=60
//! ```

#![no_main]

use libfuzzer_sys::fuzz_target;
use mcp_gateway::middleware::introspect::{
    MAX_LOGGED_PAYLOAD_BYTES, TRUNCATION_MARKER, extract_metadata, truncate_payload,
};
use mcp_gateway::middleware::ip::{resolve_identity, split_host};

fuzz_target!(|data: &[u8]| {
    let quiet = extract_metadata(data, false);
    let verbose = extract_metadata(data, true);

    // Payload logging only ever adds fields
    assert_eq!(quiet.is_some(), verbose.is_some());
    if let Some(quiet) = &quiet {
        assert!(quiet.tool_arguments.is_none());
        assert!(quiet.payload.is_none());
    }

    let truncated = truncate_payload(data);
    assert!(truncated.len() <= MAX_LOGGED_PAYLOAD_BYTES + TRUNCATION_MARKER.len());

    if let Ok(s) = std::str::from_utf8(data) {
        let _ = split_host(s);

        // Split the input three ways to drive every precedence branch
        let mut parts = s.splitn(3, '\n');
        let forwarded = parts.next();
        let real_ip = parts.next();
        let peer = parts.next();
        let (identity, _source) = resolve_identity(forwarded, real_ip, peer);
        assert!(identity.len() <= s.len().max(mcp_gateway::middleware::UNKNOWN_CLIENT.len()));
    }
});
