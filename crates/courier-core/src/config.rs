//! Engine configuration.
//!
//! Defaults are overridable from the environment; nothing is hardcoded at
//! the call sites.

use serde::{Deserialize, Serialize};

/// Configuration for the delivery engine, queue, and webhook fan-out.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Durable queue name jobs are submitted to.
    pub queue_name: String,
    /// Number of concurrent delivery workers.
    pub worker_concurrency: usize,
    /// Default maximum delivery attempts per notification (floor 1).
    pub default_max_retries: u32,
    /// Base exponential backoff delay, in minutes.
    pub base_backoff_minutes: i64,
    /// Per-call webhook POST timeout, in seconds.
    pub webhook_timeout_secs: u64,
    /// Worker poll interval while the queue is empty, in milliseconds.
    pub poll_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_name: "notifications".to_string(),
            worker_concurrency: 5,
            default_max_retries: 3,
            base_backoff_minutes: 5,
            webhook_timeout_secs: 10,
            poll_interval_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(name) = std::env::var("COURIER_QUEUE_NAME") {
            if !name.is_empty() {
                config.queue_name = name;
            }
        }
        if let Ok(v) = std::env::var("COURIER_WORKER_CONCURRENCY") {
            config.worker_concurrency = v.parse().unwrap_or(config.worker_concurrency);
        }
        if let Ok(v) = std::env::var("COURIER_MAX_RETRIES") {
            config.default_max_retries = v.parse().unwrap_or(config.default_max_retries);
        }
        if let Ok(v) = std::env::var("COURIER_BASE_BACKOFF_MINUTES") {
            config.base_backoff_minutes = v.parse().unwrap_or(config.base_backoff_minutes);
        }
        if let Ok(v) = std::env::var("COURIER_WEBHOOK_TIMEOUT_SECS") {
            config.webhook_timeout_secs = v.parse().unwrap_or(config.webhook_timeout_secs);
        }
        if let Ok(v) = std::env::var("COURIER_POLL_INTERVAL_MS") {
            config.poll_interval_ms = v.parse().unwrap_or(config.poll_interval_ms);
        }

        config.normalize()
    }

    /// Clamp values to their documented floors.
    pub fn normalize(mut self) -> Self {
        self.default_max_retries = self.default_max_retries.max(1);
        self.worker_concurrency = self.worker_concurrency.max(1);
        self.base_backoff_minutes = self.base_backoff_minutes.max(1);
        self
    }
}
