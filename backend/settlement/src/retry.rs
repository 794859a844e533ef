//! Bounded exponential back-off around fallible ledger operations.
//!
//! An operation is attempted up to [`BackoffPolicy::max_attempts`] times,
//! sleeping `base_delay * 2^attempt` between attempts. Errors that are not
//! [`Transient`] end the run immediately. The total time spent sleeping is
//! capped by [`BackoffPolicy::max_elapsed`] so a caller on the reconciliation
//! loop is never parked indefinitely.

use std::fmt::Display;
use std::future::Future;
use std::time::{Duration, Instant};

use tracing::warn;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_ELAPSED: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_elapsed: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_elapsed: DEFAULT_MAX_ELAPSED,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after the failed attempt with zero-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }
}

/// Classifies errors worth another attempt.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

/// Why a retried operation did not produce a value.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The operation failed with an error that retrying cannot fix.
    Permanent(E),
    /// Every allowed attempt failed; `last` is the final error.
    Exhausted { attempts: u32, last: E },
}

impl<E> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            Self::Permanent(e) | Self::Exhausted { last: e, .. } => e,
        }
    }
}

/// Run `op` under `policy`. The closure receives the zero-based attempt
/// number and must rebuild all of its state on every call.
pub async fn run<T, E, F, Fut>(
    policy: &BackoffPolicy,
    label: &str,
    mut op: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Transient + Display,
{
    let started = Instant::now();
    let mut attempt = 0u32;

    loop {
        let err = match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(RetryError::Permanent(err));
        }

        let attempts = attempt + 1;
        if attempts >= policy.max_attempts {
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        }

        let delay = policy.delay_for(attempt);
        if started.elapsed() + delay > policy.max_elapsed {
            warn!("{label}: retry budget of {:?} spent: {err}", policy.max_elapsed);
            return Err(RetryError::Exhausted {
                attempts,
                last: err,
            });
        }

        warn!("{label} failed (attempt {attempts}, will retry in {delay:?}): {err}");
        tokio::time::sleep(delay).await;
        attempt = attempts;
    }
}
