//! Two-tier rate limiting keyed on client identity and target resource
//!
//! The limiter is a signal, not a gate: the dispatcher records its verdict
//! but still forwards limited requests (observational enforcement). Any
//! backend failure fails open — a limiter outage must never become a
//! denial of service against legitimate traffic.

use crate::utils::has_valid_gateway_secret;
use dashmap::DashMap;
use eyre::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, warn};

/// Backend counter store consulted by the limiter
///
/// The production store is in-process; a distributed deployment swaps in a
/// shared store behind the same seam. Errors propagate so the limiter can
/// fail open.
pub trait CounterStore: Send + Sync {
    /// Records a hit against `key`, returning whether it is within the limit
    fn try_acquire(&self, key: &str) -> Result<bool>;

    /// Drops windows that have been idle past their useful life
    fn sweep(&self) -> usize {
        0
    }
}

/// Fixed-window counter over a concurrent map
///
/// Each key gets a window that resets once its duration elapses. The key
/// space is capped; hitting the cap is reported as an error so the caller's
/// fail-open policy decides (spoofed identities must not OOM the process).
pub struct FixedWindowCounter {
    windows: DashMap<String, Window>,
    limit: u32,
    window: Duration,
    max_keys: usize,
}

struct Window {
    started: Instant,
    count: u32,
}

impl FixedWindowCounter {
    const DEFAULT_MAX_KEYS: usize = 100_000;

    /// Creates a counter allowing `limit` hits per `window` per key
    pub fn new(limit: u32, window: Duration) -> Self {
        Self { windows: DashMap::new(), limit, window, max_keys: Self::DEFAULT_MAX_KEYS }
    }

    /// Number of tracked keys
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

impl CounterStore for FixedWindowCounter {
    fn try_acquire(&self, key: &str) -> Result<bool> {
        let now = Instant::now();

        if !self.windows.contains_key(key) && self.windows.len() >= self.max_keys {
            eyre::bail!("Counter store at capacity ({} keys)", self.max_keys);
        }

        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| Window { started: now, count: 0 });

        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        entry.count += 1;
        Ok(entry.count <= self.limit)
    }

    fn sweep(&self) -> usize {
        let before = self.windows.len();
        let ttl = self.window * 2;
        let now = Instant::now();
        self.windows.retain(|_, window| now.duration_since(window.started) < ttl);
        before - self.windows.len()
    }
}

/// Limits for the two tiers
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Hits allowed per rate key in the fine window
    pub fine_limit: u32,
    /// Fine window length (seconds scale)
    pub fine_window: Duration,
    /// Hits allowed per identity in the coarse window
    pub coarse_limit: u32,
    /// Coarse window length (tens-of-seconds scale)
    pub coarse_window: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            fine_limit: 10,
            fine_window: Duration::from_secs(10),
            coarse_limit: 600,
            coarse_window: Duration::from_secs(60),
        }
    }
}

/// Two-tier rate limiter with a trusted-caller bypass
///
/// Tier one counts per `identity:resource` over a short window; tier two
/// counts per identity over a longer window. Callers presenting the shared
/// secret bypass both.
pub struct RateLimiter {
    fine: Arc<dyn CounterStore>,
    coarse: Arc<dyn CounterStore>,
    secret: Option<String>,
}

impl RateLimiter {
    /// Creates a limiter with in-process fixed-window counters
    pub fn new(config: RateLimiterConfig, secret: Option<String>) -> Self {
        Self {
            fine: Arc::new(FixedWindowCounter::new(config.fine_limit, config.fine_window)),
            coarse: Arc::new(FixedWindowCounter::new(config.coarse_limit, config.coarse_window)),
            secret,
        }
    }

    /// Creates a limiter over caller-provided counter stores
    pub fn with_stores(
        fine: Arc<dyn CounterStore>,
        coarse: Arc<dyn CounterStore>,
        secret: Option<String>,
    ) -> Self {
        Self { fine, coarse, secret }
    }

    /// Checks whether a request is allowed (true = allowed)
    ///
    /// The rate key prefers the target contract, falls back to the method,
    /// and finally to a fixed marker, always scoped under the identity.
    pub fn check_rate_limit(
        &self,
        identity: &str,
        method: &str,
        contract_address: Option<&str>,
        provided_secret: Option<&str>,
    ) -> bool {
        if has_valid_gateway_secret(provided_secret, self.secret.as_deref()) {
            debug!("Trusted caller bypassing rate limits");
            return true;
        }

        let rate_key = match contract_address {
            Some(contract) => format!("{identity}:{}", contract.to_lowercase()),
            None if !method.is_empty() => format!("{identity}:{method}"),
            None => format!("{identity}:unknown"),
        };

        match self.fine.try_acquire(&rate_key) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Fine rate limit exceeded for {}", rate_key);
                return false;
            }
            Err(e) => {
                warn!("Rate limiter backend failed, allowing request: {}", e);
                return true;
            }
        }

        match self.coarse.try_acquire(identity) {
            Ok(allowed) => {
                if !allowed {
                    debug!("Coarse rate limit exceeded for {}", identity);
                }
                allowed
            }
            Err(e) => {
                warn!("Rate limiter backend failed, allowing request: {}", e);
                true
            }
        }
    }

    /// Sweeps stale windows from both tiers
    pub fn sweep(&self) -> usize {
        self.fine.sweep() + self.coarse.sweep()
    }
}
