//! Sync configuration.

use std::env;
use std::time::Duration;

use serde::Deserialize;

/// Tunables for retry scheduling and the background drain.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    pub delivery_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub drain_batch_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            jitter_ratio: 0.25,
            delivery_timeout_ms: 10_000,
            poll_interval_ms: 500,
            drain_batch_size: 50,
        }
    }
}

impl SyncConfig {
    /// Read `LOGBOOK_SYNC_*` variables, falling back to defaults for missing
    /// or malformed values.
    pub fn from_env() -> Self {
        let defaults = SyncConfig::default();
        SyncConfig {
            max_attempts: env_or("LOGBOOK_SYNC_MAX_ATTEMPTS", defaults.max_attempts),
            base_delay_ms: env_or("LOGBOOK_SYNC_BASE_DELAY_MS", defaults.base_delay_ms),
            max_delay_ms: env_or("LOGBOOK_SYNC_MAX_DELAY_MS", defaults.max_delay_ms),
            jitter_ratio: env_or("LOGBOOK_SYNC_JITTER_RATIO", defaults.jitter_ratio),
            delivery_timeout_ms: env_or(
                "LOGBOOK_SYNC_DELIVERY_TIMEOUT_MS",
                defaults.delivery_timeout_ms,
            ),
            poll_interval_ms: env_or("LOGBOOK_SYNC_POLL_INTERVAL_MS", defaults.poll_interval_ms),
            drain_batch_size: env_or("LOGBOOK_SYNC_DRAIN_BATCH_SIZE", defaults.drain_batch_size),
        }
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max;
        self
    }

    pub fn with_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter_ratio(mut self, ratio: f64) -> Self {
        self.jitter_ratio = ratio;
        self
    }

    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_drain_batch_size(mut self, size: usize) -> Self {
        self.drain_batch_size = size;
        self
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.trim().parse().ok())
        .unwrap_or(default)
}
