// Retry strategy for transient store failures, with exponential backoff
// and jitter. A dropped claim must never be silent, so the dispatch loop
// retries Unavailable errors up to the cap before surfacing them.

use rand::Rng;
use std::time::Duration;

/// Maximum number of retry attempts for a transient store error.
pub const MAX_RETRIES: u32 = 5;

/// Retry strategy trait for calculating retry delays
pub trait RetryStrategy: Send + Sync {
    /// Delay before the next retry attempt; None when retries are exhausted.
    fn next_delay(&self, attempt: u32) -> Option<Duration>;

    fn should_retry(&self, attempt: u32) -> bool {
        attempt < MAX_RETRIES
    }

    fn max_retries(&self) -> u32 {
        MAX_RETRIES
    }
}

/// Exponential backoff with jitter.
/// Sequence: 1s, 3s, 9s, 27s, ... capped at max_delay.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base_delay_secs: u64,
    max_delay_secs: u64,
    /// 0.0 to 1.0; random fraction of the delay added on top.
    jitter_factor: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_delay_secs: 1,
            max_delay_secs: 60,
            jitter_factor: 0.1,
        }
    }
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(base_delay_secs: u64, max_delay_secs: u64, jitter_factor: f64) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
            jitter_factor: jitter_factor.clamp(0.0, 1.0),
        }
    }

    fn calculate_base_delay(&self, attempt: u32) -> u64 {
        let delay = self.base_delay_secs.saturating_mul(3_u64.saturating_pow(attempt));
        delay.min(self.max_delay_secs)
    }

    fn add_jitter_ms(&self, base_delay_secs: u64) -> u64 {
        if self.jitter_factor == 0.0 {
            return base_delay_secs * 1000;
        }

        let mut rng = rand::thread_rng();
        let base_delay_ms = base_delay_secs * 1000;
        let jitter_range_ms = (base_delay_ms as f64 * self.jitter_factor) as u64;

        let jitter_ms = if jitter_range_ms > 0 {
            rng.gen_range(0..=jitter_range_ms)
        } else {
            0
        };

        base_delay_ms + jitter_ms
    }
}

impl RetryStrategy for ExponentialBackoff {
    fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt >= MAX_RETRIES {
            return None;
        }

        let base_delay_secs = self.calculate_base_delay(attempt);
        Some(Duration::from_millis(self.add_jitter_ms(base_delay_secs)))
    }
}
