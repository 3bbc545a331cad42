//! Bounded retry policy shared by connection and session establishment.

use crate::error::BleError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

type DelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// A retry sequence ran out of attempts
#[derive(Debug, Clone)]
pub struct RetryExhausted {
    pub operation: &'static str,
    pub attempts: u32,
    pub last_error: Option<BleError>,
}

impl fmt::Display for RetryExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed after {} attempts", self.operation, self.attempts)?;
        if let Some(e) = &self.last_error {
            write!(f, ": {}", e)?;
        }
        Ok(())
    }
}

impl From<RetryExhausted> for BleError {
    fn from(exhausted: RetryExhausted) -> Self {
        BleError::RetriesExhausted {
            operation: exhausted.operation,
            attempts: exhausted.attempts,
        }
    }
}

/// Maximum attempt count plus the delay inserted before each retry.
///
/// Attempt indices start at 0. No delay precedes attempt 0; before attempt
/// `i > 0` the policy sleeps for `delay(i)`.
#[derive(Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: DelayFn,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay: Arc::new(delay),
        }
    }

    /// Retry straight away
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, |_| Duration::ZERO)
    }

    /// Wait `attempt × unit` before each retry
    pub fn linear(max_attempts: u32, unit: Duration) -> Self {
        Self::new(max_attempts, move |attempt| unit * attempt)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            Duration::ZERO
        } else {
            (self.delay)(attempt)
        }
    }

    /// Run `attempt_fn` until it succeeds or the attempt budget is spent.
    ///
    /// Dropping the returned future cancels any pending delay.
    pub async fn run<T, F, Fut>(
        &self,
        operation: &'static str,
        mut attempt_fn: F,
    ) -> Result<T, RetryExhausted>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BleError>>,
    {
        let mut last_error = None;

        for attempt in 0..self.max_attempts {
            let delay = self.delay_before(attempt);
            if !delay.is_zero() {
                debug!(operation, attempt, ?delay, "Waiting before retry");
                tokio::time::sleep(delay).await;
            }

            match attempt_fn(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt, "Succeeded after retrying");
                    }
                    return Ok(value);
                }
                Err(e) if attempt + 1 < self.max_attempts => {
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Attempt failed, retrying"
                    );
                    last_error = Some(e);
                }
                Err(e) => {
                    error!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Final attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        error!(
            operation,
            max_attempts = self.max_attempts,
            "Maximum attempt count reached"
        );
        Err(RetryExhausted {
            operation,
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Like [`RetryPolicy::run`], but hands exhaustion to a corrective action
    /// instead of returning it.
    pub async fn run_or_else<T, F, Fut, C, CFut>(
        &self,
        operation: &'static str,
        attempt_fn: F,
        on_exhausted: C,
    ) -> Option<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, BleError>>,
        C: FnOnce(RetryExhausted) -> CFut,
        CFut: Future<Output = ()>,
    {
        match self.run(operation, attempt_fn).await {
            Ok(value) => Some(value),
            Err(exhausted) => {
                on_exhausted(exhausted).await;
                None
            }
        }
    }
}
