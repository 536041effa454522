#![forbid(unsafe_code)]

use super::StoreError;
use rand::Rng;
use std::time::Duration;

/// Bounded exponential backoff for lock contention between processes.
///
/// Only contention is retried; every other error returns on the first
/// attempt. Once `max_attempts` is spent the caller gets
/// [`StoreError::Contention`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 64,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    /// Upper bound of the sleep before attempt `attempt + 1` (1-based).
    pub fn backoff_ceiling(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff)
    }

    pub(crate) fn run<T>(
        &self,
        op: &'static str,
        mut f: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match f() {
                Err(err) if err.is_contention() => {
                    if attempt >= max_attempts {
                        tracing::warn!(op, attempts = attempt, "store contention exhausted retries");
                        return Err(StoreError::Contention {
                            op,
                            attempts: attempt,
                        });
                    }
                    let ceiling = self.backoff_ceiling(attempt);
                    // Full jitter keeps competing writers from retrying in lockstep.
                    let ceiling_us = u64::try_from(ceiling.as_micros()).unwrap_or(u64::MAX);
                    let delay = Duration::from_micros(rand::rng().random_range(0..=ceiling_us));
                    tracing::debug!(
                        op,
                        attempt,
                        delay_us = delay.as_micros() as u64,
                        "store busy; retrying"
                    );
                    std::thread::sleep(delay);
                }
                other => return other,
            }
        }
    }
}
