//! Coordinated retry.
//!
//! Runs a remote operation under a bounded attempt budget. Before each
//! attempt the subject's readiness is re-checked, so that the first reads
//! after sign-in wait out credential propagation instead of failing with
//! permission errors that are not the caller's fault.

use crate::clock::Clock;
use crate::config::RetryConfig;
use crate::error::{CoordinationError, Disposition, ErrorKind, StoreError, classify};
use crate::provider::SubjectId;
use crate::readiness::ReadinessWaiter;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Backoff
// ============================================================================

/// How delays grow between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time
    Fixed,
    /// delay * (retry + 1)
    Linear,
    /// delay * 2^retry
    Exponential,
    /// Exponential plus up to 20% random extra, so clients do not retry in lockstep
    #[default]
    ExponentialWithJitter,
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (0 = first retry), capped at `max_delay`.
    #[must_use]
    pub fn delay(&self, retry: u32, base_delay: Duration, max_delay: Duration) -> Duration {
        let delay = match self {
            Self::Fixed => base_delay,
            Self::Linear => base_delay.saturating_mul(retry.saturating_add(1)),
            Self::Exponential => base_delay.saturating_mul(2u32.saturating_pow(retry)),
            Self::ExponentialWithJitter => {
                let exp = base_delay.saturating_mul(2u32.saturating_pow(retry));
                let jitter = exp.mul_f64(0.2 * rand::random::<f64>());
                exp.saturating_add(jitter)
            }
        };
        delay.min(max_delay)
    }
}

/// One step of a retry run. Logged, never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryAttempt {
    pub attempt_number: u32,
    /// `None` when the attempt was skipped because readiness was not confirmed
    pub error: Option<ErrorKind>,
    pub next_delay: Duration,
}

// ============================================================================
// Executor
// ============================================================================

/// Bounded-attempt executor that re-validates readiness between attempts.
#[derive(Debug)]
pub struct RetryExecutor {
    waiter: Arc<ReadinessWaiter>,
    clock: Arc<dyn Clock>,
    config: RetryConfig,
    propagation_window: Duration,
}

impl RetryExecutor {
    #[must_use]
    pub fn new(
        waiter: Arc<ReadinessWaiter>,
        clock: Arc<dyn Clock>,
        config: RetryConfig,
        propagation_window: Duration,
    ) -> Self {
        Self {
            waiter,
            clock,
            config,
            propagation_window,
        }
    }

    #[must_use]
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` for `subject` with up to `max_attempts` attempts.
    ///
    /// Each attempt first waits for readiness. An attempt whose readiness is
    /// not confirmed (timed out or denied) backs off without invoking
    /// `operation` unless it is the last one; the last attempt always
    /// invokes it. Terminal failures return immediately,
    /// retryable ones back off and try again until the budget runs out.
    ///
    /// # Arguments
    ///
    /// * `subject` - Signed-in subject the operation runs as
    /// * `operation` - Produces one invocation of the remote call per attempt
    /// * `max_attempts` - Attempt budget, treated as at least 1
    /// * `cancel` - Aborts readiness waits and backoff sleeps
    ///
    /// # Errors
    ///
    /// [`CoordinationError::Terminal`], [`CoordinationError::Retryable`] once
    /// the budget is spent, or [`CoordinationError::Cancelled`].
    pub async fn execute<T, F, Fut>(
        &self,
        subject: &SubjectId,
        mut operation: F,
        max_attempts: u32,
        cancel: &CancellationToken,
    ) -> Result<T, CoordinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut attempt = 0u32;
        let mut invocations = 0u32;

        loop {
            attempt += 1;
            let is_final = attempt >= max_attempts;

            let readiness = self
                .waiter
                .wait(subject, self.config.per_attempt_readiness_timeout, cancel)
                .await?;
            if !readiness.is_ready() {
                if !is_final {
                    let step = RetryAttempt {
                        attempt_number: attempt,
                        error: None,
                        next_delay: self.next_delay(attempt),
                    };
                    tracing::debug!(
                        subject = %subject,
                        attempt = ?step,
                        readiness = ?readiness,
                        delay_ms = millis(step.next_delay),
                        "Readiness unconfirmed, deferring attempt"
                    );
                    self.pause(step.next_delay, cancel).await?;
                    continue;
                }
                tracing::debug!(subject = %subject, attempt, readiness = ?readiness, "Readiness unconfirmed on final attempt, proceeding");
            }

            invocations += 1;
            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(subject = %subject, attempt, invocations, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            let disposition = classify(
                &error,
                self.waiter.credential_age(subject),
                self.propagation_window,
            );
            match disposition {
                Disposition::Terminal => {
                    tracing::warn!(subject = %subject, attempt, error = %error, "Terminal failure, not retrying");
                    return Err(CoordinationError::Terminal {
                        attempts: invocations,
                        source: error,
                    });
                }
                Disposition::Retryable if is_final => {
                    tracing::warn!(subject = %subject, attempts = invocations, error = %error, "Retry budget exhausted");
                    return Err(CoordinationError::Retryable {
                        attempts: invocations,
                        source: error,
                    });
                }
                Disposition::Retryable => {
                    let step = RetryAttempt {
                        attempt_number: attempt,
                        error: Some(ErrorKind::Retryable),
                        next_delay: self.next_delay(attempt),
                    };
                    tracing::debug!(
                        subject = %subject,
                        attempt = ?step,
                        delay_ms = millis(step.next_delay),
                        error = %error,
                        "Retryable failure"
                    );
                    self.pause(step.next_delay, cancel).await?;
                }
            }
        }
    }

    fn next_delay(&self, attempt: u32) -> Duration {
        self.config.backoff.delay(
            attempt.saturating_sub(1),
            self.config.base_delay,
            self.config.max_delay,
        )
    }

    async fn pause(&self, delay: Duration, cancel: &CancellationToken) -> Result<(), CoordinationError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoordinationError::cancelled_by_reset()),
            _ = self.clock.sleep(delay) => Ok(()),
        }
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Tests
// ============================================================================
