//! Environment variable name constants for lockrpc configuration.
//!
//! This module provides constant string names for the environment variables
//! consumed by the gateway, ensuring a single source of truth across the
//! codebase.
//!
//! # Environment Variables
//!
//! - [`CACHE_DURATION_SECONDS`] - Edge cache TTL in seconds
//! - [`GATEWAY_SECRET`] - Shared secret for trusted-caller rate-limit bypass
//! - [`GATEWAY_UPSTREAM_PREFIX`] - Prefix for per-network upstream URL overrides
//! - [`GATEWAY_ORIGIN`] - `Origin` header value sent on forwarded requests

use std::env;
use tracing::warn;

/// Environment variable for the edge cache time-to-live (TTL) in seconds.
///
/// Must be a positive integer. Invalid or absent values fall back to the
/// gateway's one-hour default rather than failing the call.
///
/// ```bash
/// CACHE_DURATION_SECONDS=600 lockrpc-gateway
/// ```
pub const CACHE_DURATION_SECONDS: &str = "CACHE_DURATION_SECONDS";

/// Environment variable for the trusted-caller shared secret.
///
/// Requests presenting this value as their `secret` query parameter bypass
/// rate limiting entirely. When unset, no caller is trusted.
pub const GATEWAY_SECRET: &str = "GATEWAY_SECRET";

/// Prefix for per-network upstream URL overrides.
///
/// `GATEWAY_UPSTREAM_<network id>` replaces the built-in upstream URL for
/// that network, e.g.:
///
/// ```bash
/// GATEWAY_UPSTREAM_137=https://polygon.example.com/rpc lockrpc-gateway
/// ```
pub const GATEWAY_UPSTREAM_PREFIX: &str = "GATEWAY_UPSTREAM_";

/// Environment variable for the `Origin` header sent to upstream providers.
///
/// Some providers allowlist a specific origin; when unset no `Origin` header
/// is attached.
pub const GATEWAY_ORIGIN: &str = "GATEWAY_ORIGIN";

/// Reads an optional, non-empty environment variable.
pub fn read_env(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Reads a positive integer from the environment, falling back to a default.
///
/// Invalid values are logged and replaced by the default; configuration
/// mistakes must never fail the request path.
pub fn read_env_u64_or(name: &str, default: u64) -> u64 {
    match read_env(name) {
        Some(raw) => match raw.parse::<u64>() {
            Ok(value) if value > 0 => value,
            _ => {
                warn!("Invalid {} value: {}, using default: {}", name, raw, default);
                default
            }
        },
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_env_u64_or_defaults_on_garbage() {
        std::env::set_var("LOCKRPC_TEST_TTL", "not-a-number");
        assert_eq!(read_env_u64_or("LOCKRPC_TEST_TTL", 3600), 3600);

        std::env::set_var("LOCKRPC_TEST_TTL", "0");
        assert_eq!(read_env_u64_or("LOCKRPC_TEST_TTL", 3600), 3600);

        std::env::set_var("LOCKRPC_TEST_TTL", "600");
        assert_eq!(read_env_u64_or("LOCKRPC_TEST_TTL", 3600), 600);

        std::env::remove_var("LOCKRPC_TEST_TTL");
        assert_eq!(read_env_u64_or("LOCKRPC_TEST_TTL", 3600), 3600);
    }

    #[test]
    fn test_read_env_filters_empty() {
        std::env::set_var("LOCKRPC_TEST_EMPTY", "   ");
        assert_eq!(read_env("LOCKRPC_TEST_EMPTY"), None);
        std::env::remove_var("LOCKRPC_TEST_EMPTY");
    }
}
