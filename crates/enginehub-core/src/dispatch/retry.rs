//! Bounded retry with exponential backoff and jitter.
//!
//! Only errors for which [`HubError::is_retryable`] holds are retried: a
//! connection failure observed while sending. Running out of attempts wraps
//! the last error in [`HubError::Dispatch`].
//!
//! An instance that reports a reload is waited on separately: the operation is
//! repeated after the pause the instance asked for (bounded), without using
//! up attempts, until the reload wait budget is spent. Everything else
//! propagates after the first attempt.

use crate::config::RetryDefaults;
use crate::error::{HubError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Retry policy for command sends.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first one).
    pub max_attempts: u32,
    /// Initial delay between retries.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
    /// Exponential base (2.0 doubles each attempt).
    pub exponential_base: f64,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
    /// How long to keep repeating while the instance reports a reload.
    pub reload_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: RetryDefaults::MAX_ATTEMPTS,
            base_delay: RetryDefaults::BASE_DELAY,
            max_delay: RetryDefaults::MAX_DELAY,
            exponential_base: RetryDefaults::EXPONENTIAL_BASE,
            jitter: true,
            reload_wait: RetryDefaults::RELOAD_MAX_WAIT,
        }
    }
}

/// Progress of one retried operation.
#[derive(Debug, Clone, Default)]
pub struct RetryState {
    /// Attempts made so far (1-based once the first attempt starts).
    pub attempt: u32,
    pub last_error: Option<String>,
    /// Delay before the next attempt, when one is scheduled.
    pub next_delay: Option<Duration>,
    pub total_delay: Duration,
    /// Attempts answered with a reload notice.
    pub reload_waits: u32,
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_reload_wait(mut self, wait: Duration) -> Self {
        self.reload_wait = wait.min(RetryDefaults::RELOAD_WAIT_CAP);
        self
    }

    /// Delay after the given attempt (0-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = self.exponential_base.powi(attempt as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            let mut rng = rand::rng();
            let jitter_factor =
                rng.random_range(RetryDefaults::JITTER_MIN..RetryDefaults::JITTER_MAX);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }

    /// Pause before repeating an attempt that hit a reload.
    pub fn reload_delay(retry_after: Option<Duration>) -> Duration {
        retry_after
            .unwrap_or(RetryDefaults::RELOAD_RETRY_DELAY)
            .clamp(RetryDefaults::RELOAD_MIN_DELAY, RetryDefaults::RELOAD_MAX_DELAY)
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// The operation sees the current [`RetryState`], so each attempt can
    /// re-resolve its target.
    pub async fn execute<F, Fut, T>(&self, mut operation: F) -> (Result<T>, RetryState)
    where
        F: FnMut(&RetryState) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut state = RetryState::default();
        let mut reload_started: Option<Instant> = None;

        loop {
            state.attempt += 1;
            state.next_delay = None;

            let err = match operation(&state).await {
                Ok(value) => {
                    if state.attempt > 1 {
                        debug!("Operation succeeded after {} attempts", state.attempt);
                    }
                    return (Ok(value), state);
                }
                Err(e) => e,
            };
            state.last_error = Some(err.to_string());

            if err.is_reloading() {
                let started = *reload_started.get_or_insert_with(Instant::now);
                let waited = started.elapsed();
                if waited >= self.reload_wait
                    || state.reload_waits >= RetryDefaults::RELOAD_MAX_RETRIES
                {
                    debug!("Gave up waiting for reload after {:?}: {}", waited, err);
                    return (Err(err), state);
                }

                let delay = Self::reload_delay(err.retry_after());
                state.reload_waits += 1;
                state.next_delay = Some(delay);
                state.total_delay += delay;
                debug!(
                    "Instance reloading (wait {}, {:?} so far); retrying in {:?}",
                    state.reload_waits, waited, delay
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            if !err.is_retryable() {
                debug!("Error is not retryable: {}", err);
                return (Err(err), state);
            }

            let failures = state.attempt - state.reload_waits;
            if failures >= max_attempts {
                warn!(
                    "All {} attempts exhausted. Last error: {}",
                    max_attempts, err
                );
                let attempts = state.attempt;
                return (
                    Err(HubError::Dispatch {
                        attempts,
                        source: Box::new(err),
                    }),
                    state,
                );
            }

            let delay = self.calculate_delay(failures - 1);
            state.next_delay = Some(delay);
            state.total_delay += delay;

            warn!(
                "Attempt {}/{} failed: {}. Retrying in {:?}",
                failures, max_attempts, err, delay
            );

            tokio::time::sleep(delay).await;
        }
    }
}
