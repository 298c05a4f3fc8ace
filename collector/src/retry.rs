//! Retry classification and the backoff loop used by the fetcher.
//!
//! The loop is generic over the attempt and the classifier so that the policy
//! can be exercised without any network I/O.

use crate::types::RetryPolicy;
use std::future::Future;
use tokio::time::{Duration, sleep};

/// Statuses that indicate a configuration or feed lifecycle problem.
pub const ABANDON_STATUS_CODES: &[u16] = &[
    400, // Bad request
    401, // Unauthorized
    403, // Forbidden
    404, // Not found, URL changed
    410, // Gone, feed discontinued
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    Retryable,
    Abandon,
}

/// The outcome of a single attempt that did not produce a 2xx response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptFailure {
    Status(u16),
    Timeout,
    Transport,
}

pub fn classify(failure: &AttemptFailure) -> Verdict {
    match failure {
        AttemptFailure::Status(code) if ABANDON_STATUS_CODES.contains(code) => Verdict::Abandon,
        AttemptFailure::Status(_) | AttemptFailure::Timeout | AttemptFailure::Transport => {
            Verdict::Retryable
        }
    }
}

/// Delay before the attempt following `attempt` (1-based):
/// `min(base * 2^(attempt-1), max)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(63) as i32;
    let secs = (policy.backoff_base * 2f64.powi(exponent)).min(policy.backoff_max);
    Duration::from_secs_f64(secs.max(0.0))
}

#[derive(Debug, PartialEq)]
pub enum RetryError<E> {
    /// The classifier returned `Abandon`; remaining attempts were not used.
    Abandoned { error: E, attempts: u32 },
    /// Every attempt failed with a retryable error.
    Exhausted { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Abandoned { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }
}

/// Runs `attempt` up to `policy.max_attempts` times. The classifier is
/// consulted after every failed attempt; an `Abandon` verdict returns
/// immediately. Sleeps suspend only the calling task.
///
/// On success returns the value and the number of attempts used.
pub async fn retry_with_backoff<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    classifier: C,
    mut attempt: F,
) -> Result<(T, u32), RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> Verdict,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut current = 1;

    loop {
        match attempt(current).await {
            Ok(value) => return Ok((value, current)),
            Err(error) => {
                if classifier(&error) == Verdict::Abandon {
                    return Err(RetryError::Abandoned {
                        error,
                        attempts: current,
                    });
                }
                if current >= max_attempts {
                    return Err(RetryError::Exhausted {
                        error,
                        attempts: current,
                    });
                }
                sleep(backoff_delay(policy, current)).await;
                current += 1;
            }
        }
    }
}
