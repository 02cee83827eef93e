//! Credential readiness waiting.
//!
//! A freshly issued credential is not usable against the data store straight
//! away. Reads issued during the propagation delay fail with spurious
//! permission errors. The [`ReadinessWaiter`] polls a cheap probe until the
//! store accepts the credential or a timeout elapses.
//!
//! This is a bounded heuristic, not a synchronization primitive: a timeout
//! means readiness could not be confirmed, and callers may still proceed.

use crate::clock::{Clock, deadline_after};
use crate::config::ReadinessConfig;
use crate::error::{CoordinationError, Disposition, StoreError, classify};
use crate::provider::{AccessProbe, Credential, IdentityProvider, SubjectId};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Per-subject readiness. Dropped wholesale on sign-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadinessState {
    pub subject: SubjectId,
    /// The provider returned a credential for this subject
    pub token_validated: bool,
    /// The store accepted that credential
    pub store_access_confirmed: bool,
    pub last_checked_at: Option<Instant>,
    /// Issuance time of the most recently seen credential
    pub credential_issued_at: Option<Instant>,
}

impl ReadinessState {
    fn new(subject: SubjectId) -> Self {
        Self {
            subject,
            token_validated: false,
            store_access_confirmed: false,
            last_checked_at: None,
            credential_issued_at: None,
        }
    }

    fn is_fresh(&self, now: Instant, grace: Duration) -> bool {
        self.store_access_confirmed
            && self
                .last_checked_at
                .is_some_and(|checked| now.saturating_duration_since(checked) < grace)
    }
}

/// Result of a readiness wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadinessOutcome {
    /// The store accepts the credential. `cached` when no probe was needed.
    Ready { cached: bool },
    /// Not confirmed before the timeout. The operation may still succeed.
    TimedOut { waited: Duration },
    /// The probe hit a genuine authorization failure; waiting longer will not help.
    Denied { error: StoreError },
}

impl ReadinessOutcome {
    #[must_use]
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready { .. })
    }

    /// Convert to a result for callers that want to stop when readiness is unconfirmed.
    pub fn into_result(self, subject: &SubjectId) -> Result<(), CoordinationError> {
        match self {
            Self::Ready { .. } => Ok(()),
            Self::TimedOut { waited } => Err(CoordinationError::ReadinessTimeout {
                subject: subject.to_string(),
                waited,
            }),
            Self::Denied { error } => Err(CoordinationError::Terminal {
                attempts: 1,
                source: error,
            }),
        }
    }
}

enum Probe {
    Ready,
    Pending(StoreError),
    Denied(StoreError),
}

/// Polls the identity provider and data store until a subject's credential is usable.
pub struct ReadinessWaiter {
    provider: Arc<dyn IdentityProvider>,
    probe: Arc<dyn AccessProbe>,
    clock: Arc<dyn Clock>,
    config: ReadinessConfig,
    propagation_window: Duration,
    states: DashMap<SubjectId, ReadinessState>,
}

impl std::fmt::Debug for ReadinessWaiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadinessWaiter")
            .field("config", &self.config)
            .field("subjects", &self.states.len())
            .finish()
    }
}

impl ReadinessWaiter {
    #[must_use]
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        probe: Arc<dyn AccessProbe>,
        clock: Arc<dyn Clock>,
        config: ReadinessConfig,
        propagation_window: Duration,
    ) -> Self {
        Self {
            provider,
            probe,
            clock,
            config,
            propagation_window,
            states: DashMap::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &ReadinessConfig {
        &self.config
    }

    /// Start tracking a newly issued credential, discarding older readiness.
    pub fn mark_authenticated(&self, credential: &Credential) {
        let mut state = ReadinessState::new(credential.subject.clone());
        state.credential_issued_at = Some(credential.issued_at);
        self.states.insert(credential.subject.clone(), state);
    }

    /// Wait until `subject` is ready, returning `true` on confirmation.
    ///
    /// `false` covers both timeout and genuine denial.
    pub async fn wait_for_ready(
        &self,
        subject: &SubjectId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> bool {
        matches!(
            self.wait(subject, timeout, cancel).await,
            Ok(ReadinessOutcome::Ready { .. })
        )
    }

    /// Wait until `subject` is ready, or `timeout` elapses, or `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::Cancelled`] when `cancel` fires mid-wait.
    pub async fn wait(
        &self,
        subject: &SubjectId,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ReadinessOutcome, CoordinationError> {
        let started = self.clock.now();
        if self.is_cached(subject, started) {
            tracing::debug!(subject = %subject, "Readiness cached");
            return Ok(ReadinessOutcome::Ready { cached: true });
        }

        let deadline = deadline_after(started, timeout);
        let mut polls = 0u32;
        loop {
            polls += 1;
            let probe = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoordinationError::cancelled_by_reset()),
                probe = self.probe_once(subject, cancel) => probe,
            };
            if cancel.is_cancelled() {
                return Err(CoordinationError::cancelled_by_reset());
            }

            match probe {
                Probe::Ready => {
                    self.record(subject, cancel, |state| {
                        state.store_access_confirmed = true;
                    });
                    tracing::debug!(subject = %subject, polls, "Credential ready");
                    return Ok(ReadinessOutcome::Ready { cached: false });
                }
                Probe::Denied(error) => {
                    tracing::warn!(subject = %subject, error = %error, "Readiness probe denied");
                    return Ok(ReadinessOutcome::Denied { error });
                }
                Probe::Pending(error) => {
                    tracing::debug!(subject = %subject, polls, error = %error, "Credential not ready yet");
                }
            }

            let now = self.clock.now();
            if now >= deadline {
                let waited = now.saturating_duration_since(started);
                tracing::warn!(
                    subject = %subject,
                    waited_ms = u64::try_from(waited.as_millis()).unwrap_or(u64::MAX),
                    polls,
                    "Readiness not confirmed before timeout"
                );
                return Ok(ReadinessOutcome::TimedOut { waited });
            }

            let delay = self.config.poll_interval.min(deadline - now);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(CoordinationError::cancelled_by_reset()),
                _ = self.clock.sleep(delay) => {}
            }
        }
    }

    async fn probe_once(&self, subject: &SubjectId, cancel: &CancellationToken) -> Probe {
        let credential = match self.provider.refresh_credential(false).await {
            Ok(credential) => credential,
            Err(error) => return self.judge(subject, error),
        };
        if &credential.subject != subject {
            return Probe::Denied(StoreError::invalid_credentials(format!(
                "active credential belongs to {}, not {subject}",
                credential.subject
            )));
        }
        self.record(subject, cancel, |state| {
            state.token_validated = true;
            state.credential_issued_at = Some(credential.issued_at);
        });

        match self.probe.check_access(&credential).await {
            Ok(()) => Probe::Ready,
            Err(error) => self.judge(subject, error),
        }
    }

    fn judge(&self, subject: &SubjectId, error: StoreError) -> Probe {
        match classify(&error, self.credential_age(subject), self.propagation_window) {
            Disposition::Retryable => Probe::Pending(error),
            Disposition::Terminal => Probe::Denied(error),
        }
    }

    /// Apply `update` to the subject's state unless `cancel` has fired.
    ///
    /// The cancellation check happens under the entry's shard lock. A reset
    /// cancels before clearing, so a poll finishing on another worker either
    /// writes before the clear or sees the cancellation and writes nothing.
    fn record(
        &self,
        subject: &SubjectId,
        cancel: &CancellationToken,
        update: impl FnOnce(&mut ReadinessState),
    ) {
        let now = self.clock.now();
        let entry = self.states.entry(subject.clone());
        if cancel.is_cancelled() {
            tracing::debug!(subject = %subject, "Dropping readiness update from a reset session");
            return;
        }
        let mut state = entry.or_insert_with(|| ReadinessState::new(subject.clone()));
        update(&mut *state);
        state.last_checked_at = Some(now);
    }

    fn is_cached(&self, subject: &SubjectId, now: Instant) -> bool {
        self.states
            .get(subject)
            .is_some_and(|state| state.is_fresh(now, self.config.grace_period))
    }

    /// Time since the subject's credential was issued, if known.
    #[must_use]
    pub fn credential_age(&self, subject: &SubjectId) -> Option<Duration> {
        let issued = self.states.get(subject)?.credential_issued_at?;
        Some(self.clock.now().saturating_duration_since(issued))
    }

    /// Snapshot of a subject's readiness state.
    #[must_use]
    pub fn state(&self, subject: &SubjectId) -> Option<ReadinessState> {
        self.states.get(subject).map(|state| state.clone())
    }

    /// Drop one subject's readiness.
    pub fn forget(&self, subject: &SubjectId) {
        self.states.remove(subject);
    }

    /// Drop every subject's readiness.
    pub fn clear(&self) {
        self.states.clear();
    }
}

// ============================================================================
// Tests
// ============================================================================
