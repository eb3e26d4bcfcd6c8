//! Linear backoff around any fallible async operation.
//!
//! The k-th retry waits `base + step * (k - 1)`; a step of zero gives a fixed
//! interval. There is no jitter and no cap.

use std::{fmt, future::Future, time::Duration};

use tokio::time::sleep;

use crate::error::{CrawlError, HttpError};

/// Decides whether a failed attempt may be repeated.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for CrawlError {
    fn is_retryable(&self) -> bool {
        CrawlError::is_retryable(self)
    }
}

impl Retryable for HttpError {
    fn is_retryable(&self) -> bool {
        HttpError::is_retryable(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    step: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_secs(30),
            step: Duration::from_secs(10),
        }
    }
}

/// Counter and upcoming delay for one logical operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryState {
    pub attempt: u32,
    pub delay: Duration,
}

/// A successful value plus how many attempts it took.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub attempts: u32,
}

#[derive(Debug)]
pub enum RetryError<E> {
    /// Every attempt failed with a retryable error; `last` is the final one.
    Exhausted { attempts: u32, last: E },
    /// A non-retryable error ended the operation early.
    Fatal { attempt: u32, error: E },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Exhausted { attempts, .. } => *attempts,
            RetryError::Fatal { attempt, .. } => *attempt,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Exhausted { last, .. } => last,
            RetryError::Fatal { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Exhausted { attempts, last } => {
                write!(f, "max attempts {} exhausted: {}", attempts, last)
            }
            RetryError::Fatal { attempt, error } => {
                write!(f, "attempt {} failed fatally: {}", attempt, error)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

impl From<RetryError<CrawlError>> for CrawlError {
    fn from(err: RetryError<CrawlError>) -> Self {
        match err {
            RetryError::Exhausted { attempts, last } => CrawlError::RetriesExhausted {
                attempts,
                last: Box::new(last),
            },
            RetryError::Fatal { error, .. } => error,
        }
    }
}

impl RetryPolicy {
    /// `max_attempts` counts the first try; zero is treated as one.
    pub fn new(max_attempts: u32, base_delay: Duration, step: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            step,
        }
    }

    /// Retry immediately, useful for tests and local sources.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the `retry`-th retry (1-based). Saturates at `Duration::MAX`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.step
            .checked_mul(retry.saturating_sub(1))
            .and_then(|steps| self.base_delay.checked_add(steps))
            .unwrap_or(Duration::MAX)
    }

    /// Run `op` until it succeeds, fails fatally or runs out of attempts.
    /// `op` receives the 1-based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> Result<Attempted<T>, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut state = RetryState {
            attempt: 0,
            delay: self.base_delay,
        };
        loop {
            state.attempt += 1;
            match op(state.attempt).await {
                Ok(value) => {
                    return Ok(Attempted {
                        value,
                        attempts: state.attempt,
                    })
                }
                Err(error) if !error.is_retryable() => {
                    return Err(RetryError::Fatal {
                        attempt: state.attempt,
                        error,
                    })
                }
                Err(error) if state.attempt >= self.max_attempts => {
                    tracing::error!(
                        attempts = state.attempt,
                        "<Retry> giving up: {}",
                        error
                    );
                    return Err(RetryError::Exhausted {
                        attempts: state.attempt,
                        last: error,
                    });
                }
                Err(error) => {
                    state.delay = self.delay_for(state.attempt);
                    tracing::warn!(
                        attempt = state.attempt,
                        max_attempts = self.max_attempts,
                        delay = ?state.delay,
                        "<Retry> [{}/{}] failed, sleeping before next try: {}",
                        state.attempt,
                        self.max_attempts,
                        error
                    );
                    sleep(state.delay).await;
                }
            }
        }
    }
}
