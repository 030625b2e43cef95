use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::CallError;

/// Bounded exponential backoff shared by every external call site.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Adds up to 25% random extra delay.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

/// The last error seen once a call stops being retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryExhausted {
    pub attempts: u32,
    pub last_error: CallError,
}

impl BackoffPolicy {
    /// No waiting between attempts. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay before retry number `retry` (0 = wait after the first failure), without jitter.
    pub fn base_delay_for(&self, retry: u32) -> Duration {
        let ms = self.base_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let capped = ms.min(self.max_delay.as_millis() as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    fn delay_for(&self, retry: u32) -> Duration {
        let base = self.base_delay_for(retry);
        if self.jitter && !base.is_zero() {
            let extra = rand::thread_rng().gen_range(0.0..0.25);
            base + base.mul_f64(extra)
        } else {
            base
        }
    }

    /// Run `call` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `call` receives the 1-based attempt number. A timeout reported as
    /// [`CallError::Transient`] consumes one attempt like any other transient error.
    pub fn run<T, F>(&self, operation: &str, mut call: F) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Result<T, CallError>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match call(attempt) {
                Ok(value) => return Ok(value),
                Err(err) if !err.is_transient() || attempt >= max_attempts => {
                    return Err(RetryExhausted {
                        attempts: attempt,
                        last_error: err,
                    });
                }
                Err(err) => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        operation,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after transient error"
                    );
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}
