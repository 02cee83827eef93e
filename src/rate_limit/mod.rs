//! Per-requester rate limiting for authentication entry points.
//!
//! Login, signup, password reset and token checks each get an
//! [`OperationPolicy`]. Callers must ask [`RateLimiter::is_allowed`] before
//! every attempt, including the ones that end up succeeding: the failure
//! count is driven by call volume, and [`RateLimiter::record_attempt`] only
//! resets state on success.
//!
//! State is in-memory and per-process. A restart clears every counter.

pub mod policy;
pub mod window;

pub use policy::{OperationPolicy, PolicyTable, operation};
pub use window::{AttemptRecord, Block, SlidingWindowCounter};

use crate::clock::Clock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Decision
// ============================================================================

/// Outcome of a rate limit check. Denial is a normal value, not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the attempt may proceed
    pub allowed: bool,
    /// Attempts left in the current window (allowed decisions only)
    pub remaining: Option<u32>,
    /// When the current window closes (allowed decisions only)
    pub reset_at: Option<Instant>,
    /// When the block lifts (denied decisions only)
    pub blocked_until: Option<Instant>,
}

impl RateLimitDecision {
    #[must_use]
    pub fn allow(remaining: u32, reset_at: Instant) -> Self {
        Self {
            allowed: true,
            remaining: Some(remaining),
            reset_at: Some(reset_at),
            blocked_until: None,
        }
    }

    #[must_use]
    pub fn deny(blocked_until: Instant) -> Self {
        Self {
            allowed: false,
            remaining: None,
            reset_at: None,
            blocked_until: Some(blocked_until),
        }
    }

    /// Time left until the block lifts, measured from `now`.
    #[must_use]
    pub fn retry_after(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .map(|until| until.saturating_duration_since(now))
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Policy-driven attempt limiter.
///
/// Holds a sliding-window counter per `(identifier, operation)` and applies
/// the policy table, falling back to the strictest policy for unknown
/// operation classes.
#[derive(Debug)]
pub struct RateLimiter {
    policies: PolicyTable,
    counter: SlidingWindowCounter,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter over `policies`, reading time from `clock`.
    #[must_use]
    pub fn new(policies: PolicyTable, clock: Arc<dyn Clock>) -> Self {
        Self {
            policies,
            counter: SlidingWindowCounter::new(),
            clock,
        }
    }

    /// Record an attempt and decide whether it may proceed.
    pub fn is_allowed(&self, identifier: &str, operation: &str) -> RateLimitDecision {
        let policy = self.policies.get(operation);
        let decision = self
            .counter
            .hit(identifier, operation, policy, self.clock.now());
        tracing::debug!(
            identifier = %identifier,
            operation = %operation,
            allowed = decision.allowed,
            remaining = ?decision.remaining,
            "Rate limit check"
        );
        decision
    }

    /// Report how an attempt ended.
    ///
    /// Success clears the identifier's record for this operation and any block
    /// on the identifier. Failure changes nothing; it was already counted by
    /// [`RateLimiter::is_allowed`].
    pub fn record_attempt(&self, identifier: &str, operation: &str, success: bool) {
        if success {
            self.counter.forgive(identifier, operation);
            tracing::debug!(identifier = %identifier, operation = %operation, "Attempts forgiven");
        }
    }

    /// Attempts left for the pair, without consuming one.
    #[must_use]
    pub fn remaining_attempts(&self, identifier: &str, operation: &str) -> u32 {
        let policy = self.policies.get(operation);
        self.counter
            .remaining(identifier, operation, policy, self.clock.now())
    }

    /// When the identifier's block lifts, if it is currently blocked.
    #[must_use]
    pub fn blocked_until(&self, identifier: &str) -> Option<Instant> {
        self.counter.active_block(identifier, self.clock.now())
    }

    /// Forget every record and block for an identifier.
    pub fn clear_identifier(&self, identifier: &str) {
        self.counter.clear_identifier(identifier);
    }

    /// Drop elapsed windows and expired blocks.
    pub fn sweep(&self) -> (usize, usize) {
        let (records, blocks) = self.counter.sweep(self.clock.now());
        if records + blocks > 0 {
            tracing::debug!(records, blocks, "Rate limiter sweep");
        }
        (records, blocks)
    }

    #[must_use]
    pub fn policies(&self) -> &PolicyTable {
        &self.policies
    }

    #[must_use]
    pub fn counter(&self) -> &SlidingWindowCounter {
        &self.counter
    }

    /// Spawn a task that sweeps on a fixed cadence until `shutdown` fires.
    ///
    /// The cadence is wall-clock driven and independent of request volume.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // First tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        limiter.sweep();
                    }
                }
            }
            tracing::debug!("Rate limiter sweeper stopped");
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
