//! Per-chunk speed throttling
//!
//! After every chunk the transfer sleeps for the time that chunk would take
//! at the configured rate. There is no window or token bucket: the average
//! rate is bounded, bursts within a single chunk are not corrected.

use std::time::Duration;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// Speed limiter for a single transfer
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiter {
    /// MB/s, `None` when unlimited
    limit_mbps: Option<f64>,
}

impl RateLimiter {
    /// Create a limiter for `limit_mbps` MB/s; zero, negative or NaN limits are unlimited
    pub fn new(limit_mbps: Option<f64>) -> Self {
        Self {
            limit_mbps: limit_mbps.filter(|l| l.is_finite() && *l > 0.0),
        }
    }

    /// Create an unlimited rate limiter (no throttling)
    pub fn unlimited() -> Self {
        Self { limit_mbps: None }
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit_mbps.is_none()
    }

    /// Sleep owed after a chunk of `chunk_len` bytes: `C / (L * 1024 * 1024)` seconds
    pub fn delay_for(&self, chunk_len: usize) -> Duration {
        match self.limit_mbps {
            Some(limit) => Duration::from_secs_f64(chunk_len as f64 / (limit * BYTES_PER_MB)),
            None => Duration::ZERO,
        }
    }

    /// Apply the delay for a chunk that was just written
    pub async fn throttle(&self, chunk_len: usize) {
        let delay = self.delay_for(chunk_len);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::unlimited()
    }
}
