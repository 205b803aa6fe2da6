//! Client-side tuning knobs.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Retry policy for requests that hit a mid-handoff or mis-routed
/// authority. These are transient by contract; the client re-routes with
/// capped exponential backoff before giving up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Re-route attempts before a transient routing error is surfaced.
    pub max_route_retries: u32,
    /// Initial backoff between re-route attempts, in milliseconds.
    pub route_retry_backoff_ms: u64,
    /// Backoff ceiling, in milliseconds.
    pub route_retry_backoff_max_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_route_retries: 32,
            route_retry_backoff_ms: 1,
            route_retry_backoff_max_ms: 20,
        }
    }
}

impl ClientConfig {
    /// Backoff before retry number `attempt` (0-based): doubles from the
    /// initial value up to the ceiling.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1_u64 << attempt.min(16);
        let ms = self
            .route_retry_backoff_ms
            .saturating_mul(factor)
            .min(self.route_retry_backoff_max_ms);
        Duration::from_millis(ms)
    }
}
