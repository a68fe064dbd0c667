use crate::error::ReconError;
use crate::recon::config::RetrySection;
use std::thread;
use std::time::Duration;

/// Bounded exponential backoff for transient store failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetrySection) -> Self {
        Self {
            max_attempts: cfg.max_attempts.max(1),
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
        }
    }

    /// Delay before attempt `attempt + 1`, where `attempt` starts at 1.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Run `op`, retrying while it fails with a retryable error.
///
/// Returns the attempt count alongside the last error so callers can
/// escalate it into their own variant.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    label: &str,
    mut op: impl FnMut() -> Result<T, ReconError>,
) -> Result<T, (u32, ReconError)> {
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    op = label,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "transient failure, backing off"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err((attempt, err)),
        }
    }
}
