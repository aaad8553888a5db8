//! Request counters for gateway monitoring

use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters covering the gateway's request flow
///
/// Cheap to bump from any task; a JSON snapshot is exposed on the health
/// endpoint.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Inbound HTTP calls
    pub calls: AtomicU64,
    /// Inbound calls that were batches
    pub batch_calls: AtomicU64,
    /// Individual requests across all calls
    pub requests: AtomicU64,
    /// Requests answered locally (chain-id and friends)
    pub local_responses: AtomicU64,
    /// Full-body edge cache hits
    pub edge_cache_hits: AtomicU64,
    /// Resolver cache hits
    pub resolver_cache_hits: AtomicU64,
    /// Requests sent upstream
    pub forwarded: AtomicU64,
    /// Requests the limiter would have blocked
    pub rate_limited_observed: AtomicU64,
    /// Calls that failed reaching or parsing the upstream
    pub upstream_errors: AtomicU64,
    /// Calls rejected before classification (bad method/network/body)
    pub client_errors: AtomicU64,
}

impl Metrics {
    /// Creates a zeroed metrics set
    pub fn new() -> Self {
        Self::default()
    }

    /// Increments a counter by one
    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `n` to a counter
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Returns a point-in-time JSON snapshot of all counters
    pub fn snapshot(&self) -> Value {
        json!({
            "calls": self.calls.load(Ordering::Relaxed),
            "batch_calls": self.batch_calls.load(Ordering::Relaxed),
            "requests": self.requests.load(Ordering::Relaxed),
            "local_responses": self.local_responses.load(Ordering::Relaxed),
            "edge_cache_hits": self.edge_cache_hits.load(Ordering::Relaxed),
            "resolver_cache_hits": self.resolver_cache_hits.load(Ordering::Relaxed),
            "forwarded": self.forwarded.load(Ordering::Relaxed),
            "rate_limited_observed": self.rate_limited_observed.load(Ordering::Relaxed),
            "upstream_errors": self.upstream_errors.load(Ordering::Relaxed),
            "client_errors": self.client_errors.load(Ordering::Relaxed),
        })
    }
}
