//! Health reporting for the gateway process

use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};

/// Health service backing the `/health` endpoint
///
/// Records the process start time and renders status payloads with uptime
/// and version information.
pub struct HealthService {
    start_time: u64,
}

impl HealthService {
    /// Creates a new health service, capturing the current time as start time
    pub fn new() -> Self {
        let start_time = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

        Self { start_time }
    }

    /// Returns the health/info payload
    pub fn info(&self) -> Value {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();

        json!({
            "status": "ok",
            "service": "lockrpc-gateway",
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": now.saturating_sub(self.start_time),
            "started_at": self.start_time,
        })
    }
}

impl Default for HealthService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_info_payload_shape() {
        let health = HealthService::new();
        let info = health.info();

        assert_eq!(info["status"], "ok");
        assert_eq!(info["service"], "lockrpc-gateway");
        assert!(info["uptime"].is_number());
        assert!(info["version"].is_string());
    }
}
