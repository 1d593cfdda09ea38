use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

/// Exponential backoff with additive jitter.
///
/// The n-th retry waits `min(base * 2^(n-1), max)` plus a uniform jitter of
/// up to `jitter_ratio` of that delay, capped at `max`. With the ratio kept
/// in `[0, 1]` successive delays never shrink.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        let jitter_ratio = if jitter_ratio.is_finite() {
            jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            base,
            max: max.max(base),
            jitter_ratio,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
            config.jitter_ratio,
        )
    }

    /// Delay before the next attempt, given how many attempts were made.
    pub fn delay_for(&self, attempts: u32) -> Duration {
        self.delay_with_rng(attempts, &mut rand::rng())
    }

    pub fn delay_with_rng<G: Rng>(&self, attempts: u32, rng: &mut G) -> Duration {
        let raw = self.raw_delay(attempts);
        let jitter_ms = (raw.as_millis() as f64 * self.jitter_ratio) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rng.random_range(0..=jitter_ms))
        };
        (raw + jitter).min(self.max)
    }

    /// Delay without jitter.
    pub fn raw_delay(&self, attempts: u32) -> Duration {
        let shift = attempts.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << shift)
            .unwrap_or(self.max)
            .min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}
