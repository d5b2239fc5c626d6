//! Bounded exponential-backoff runner for all external calls
//!
//! Every ubus call, subprocess, ping, and dish RPC goes through
//! [`run_with_retry`]. The policy caps attempts, doubles the backoff with
//! jitter, honors an overall deadline, and stops immediately on cancellation
//! or on an error the caller classifies as non-retryable.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::time_provider::SharedTimeProvider;

/// Backoff and attempt limits for one class of external call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Backoff before the second attempt.
    pub initial_backoff: Duration,
    /// Cap on any single backoff.
    pub max_backoff: Duration,
    /// Backoff growth factor per attempt.
    pub multiplier: f64,
    /// Fraction of the backoff randomized in both directions, 0..1.
    pub jitter_fraction: f64,
    /// Overall deadline across all attempts and backoffs.
    pub deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(5),
            multiplier: 2.0,
            jitter_fraction: 0.2,
            deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Policy for calls that must finish inside a collector deadline.
    #[must_use]
    pub fn short(deadline: Duration) -> Self {
        Self {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            deadline: Some(deadline),
            ..Self::default()
        }
    }

    /// Backoff before attempt `n + 1` (zero-based `n`), jittered and capped.
    fn backoff_for(&self, completed_attempts: u32) -> Duration {
        let exp = self
            .multiplier
            .powi(i32::try_from(completed_attempts.saturating_sub(1)).unwrap_or(i32::MAX));
        let base = self.initial_backoff.as_secs_f64() * exp;
        let capped = base.min(self.max_backoff.as_secs_f64());
        let jitter = if self.jitter_fraction > 0.0 {
            let spread = capped * self.jitter_fraction;
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// All attempts failed; carries the last error.
    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Error from the final attempt.
        last: E,
    },
    /// The overall deadline expired before success.
    #[error("retry deadline exceeded after {attempts} attempts")]
    DeadlineExceeded {
        /// Attempts made before the deadline cut in.
        attempts: u32,
        /// Error from the last completed attempt, if any.
        last: Option<E>,
    },
    /// Cancellation arrived; no further attempts were made.
    #[error("operation cancelled")]
    Cancelled,
    /// The classifier declared the error terminal.
    #[error("non-retryable error: {0}")]
    NonRetryable(E),
}

impl<E> RetryError<E> {
    /// The underlying error from the last attempt, when one exists.
    pub fn into_last(self) -> Option<E> {
        match self {
            RetryError::Exhausted { last, .. } | RetryError::NonRetryable(last) => Some(last),
            RetryError::DeadlineExceeded { last, .. } => last,
            RetryError::Cancelled => None,
        }
    }
}

/// Runs `op` until it succeeds, attempts run out, the deadline passes, the
/// classifier rejects the error, or `cancel` fires.
///
/// `retryable` returns `true` for errors worth another attempt. Cancellation
/// is checked before every attempt and interrupts backoff sleeps; the runner
/// never retries after cancellation.
///
/// # Errors
///
/// Returns a [`RetryError`] describing which bound stopped the retries.
pub async fn run_with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    clock: &SharedTimeProvider,
    cancel: &CancellationToken,
    mut op: F,
    retryable: P,
) -> Result<T, RetryError<E>>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let started = clock.mono();
    let mut attempts = 0u32;
    let mut last_error: Option<E> = None;

    while attempts < policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }
        if let Some(deadline) = policy.deadline {
            if clock.mono().since(started) >= deadline {
                return Err(RetryError::DeadlineExceeded {
                    attempts,
                    last: last_error,
                });
            }
        }

        attempts += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) => return Err(RetryError::NonRetryable(err)),
            Err(err) => {
                debug!(attempt = attempts, error = %err, "external call failed, will retry");
                last_error = Some(err);
            }
        }

        if attempts < policy.max_attempts {
            let mut backoff = policy.backoff_for(attempts);
            if let Some(deadline) = policy.deadline {
                let remaining = deadline.saturating_sub(clock.mono().since(started));
                if remaining.is_zero() {
                    return Err(RetryError::DeadlineExceeded {
                        attempts,
                        last: last_error,
                    });
                }
                backoff = backoff.min(remaining);
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(RetryError::Cancelled),
                () = clock.sleep(backoff) => {}
            }
        }
    }

    match last_error {
        Some(last) => Err(RetryError::Exhausted { attempts, last }),
        // max_attempts is validated > 0, so at least one attempt ran.
        None => Err(RetryError::DeadlineExceeded {
            attempts,
            last: None,
        }),
    }
}
