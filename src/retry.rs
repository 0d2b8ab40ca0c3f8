//! Exponential backoff for transient failures
//!
//! Transient network and conflict errors are retried with exponential
//! backoff. Reconcilers use the same [`Backoff`] to space out requeues.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::cancel::CancellationToken;
use crate::error::Result;

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Backoff {
    /// Delay before the first retry, in milliseconds
    pub base_ms: u64,
    /// Multiplier applied after every attempt
    pub factor: f64,
    /// Upper bound for a single delay, in milliseconds
    pub cap_ms: u64,
    /// Relative jitter applied to every delay (0.2 = ±20%)
    pub jitter: f64,
    /// Attempts made by [`retry_transient`] before giving up
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_ms: 500,
            factor: 2.0,
            cap_ms: 30_000,
            jitter: 0.2,
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based), without jitter
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.base_ms as f64 * self.factor.powi(exp);
        let capped = raw.min(self.cap_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Delay before retry number `attempt` with jitter applied
    pub fn delay(&self, attempt: u32) -> Duration {
        let nominal = self.nominal_delay(attempt).as_millis() as f64;
        if self.jitter <= 0.0 {
            return Duration::from_millis(nominal as u64);
        }
        let spread = rand::thread_rng().gen_range(-self.jitter..=self.jitter);
        Duration::from_millis((nominal * (1.0 + spread)).max(0.0) as u64)
    }
}

/// Run `op`, retrying retryable errors with backoff
///
/// The token is checked before every attempt and while waiting.
pub fn retry_transient<T, F>(token: &CancellationToken, backoff: &Backoff, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        token.check("retry")?;
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.kind().is_retryable() && attempt + 1 < backoff.max_attempts => {
                let delay = backoff.delay(attempt);
                tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying transient failure");
                sleep_cancellable(token, delay)?;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn sleep_cancellable(token: &CancellationToken, delay: Duration) -> Result<()> {
    let step = Duration::from_millis(50);
    let mut left = delay;
    while !left.is_zero() {
        token.check("retry backoff")?;
        let nap = left.min(step);
        std::thread::sleep(nap);
        left = left.saturating_sub(nap);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PorchError;

    fn fast() -> Backoff {
        Backoff {
            base_ms: 1,
            factor: 2.0,
            cap_ms: 4,
            jitter: 0.0,
            max_attempts: 4,
        }
    }

    #[test]
    fn test_default_delays() {
        let backoff = Backoff::default();
        assert_eq!(backoff.nominal_delay(0), Duration::from_millis(500));
        assert_eq!(backoff.nominal_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff.nominal_delay(3), Duration::from_millis(4000));
        assert_eq!(backoff.nominal_delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let backoff = Backoff::default();
        for _ in 0..100 {
            let delay = backoff.delay(1).as_millis();
            assert!((800..=1200).contains(&delay), "delay {delay} out of range");
        }
    }

    #[test]
    fn test_retry_until_success() {
        let mut calls = 0;
        let value = retry_transient(&CancellationToken::none(), &fast(), || {
            calls += 1;
            if calls < 3 {
                Err(PorchError::GitFetchFailed {
                    url: "u".to_string(),
                    reason: "network".to_string(),
                })
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }

    #[test]
    fn test_non_retryable_fails_fast() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(&CancellationToken::none(), &fast(), || {
            calls += 1;
            Err(PorchError::internal("bug"))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut calls = 0;
        let result: Result<()> = retry_transient(&CancellationToken::none(), &fast(), || {
            calls += 1;
            Err(PorchError::Cancelled)
        });
        assert!(result.is_err());
        assert_eq!(calls, 4);
    }
}
