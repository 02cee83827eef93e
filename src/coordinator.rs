//! Auth coordination facade.
//!
//! [`AuthCoordinator`] is the single surface the rest of the application
//! calls. It owns the rate limiter, the in-flight registry, the readiness
//! waiter and the retry executor, and drives the per-subject session state
//! machine:
//!
//! ```text
//! SignedOut -> Authenticating -> ReadinessPending -> Ready -> SignedOut
//! ```
//!
//! Entering `SignedOut` from any signed-in phase discards every in-flight
//! request, all readiness state and (optionally) the subject's rate limit
//! records, and cancels outstanding readiness polls and backoff sleeps so
//! that nothing from the old session resolves against the next one.
//!
//! Construct one instance at the application's composition root and share
//! it by `Arc`; there is no global instance.

use crate::clock::{Clock, TokioClock};
use crate::config::CoordinatorConfig;
use crate::error::{ConfigError, CoordinationError, Disposition, StoreError, classify};
use crate::inflight::InFlightRegistry;
use crate::provider::{AccessProbe, Credential, IdentityProvider, SubjectId};
use crate::rate_limit::{RateLimitDecision, RateLimiter};
use crate::readiness::{ReadinessOutcome, ReadinessState, ReadinessWaiter};
use crate::retry::RetryExecutor;
use arc_swap::ArcSwap;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Session state machine
// ============================================================================

/// Where a subject is in the sign-in lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    SignedOut,
    /// Credential issued, provider has not confirmed it yet
    Authenticating,
    /// Provider confirmed, store access not yet observed
    ReadinessPending,
    /// Store access confirmed, or the caller chose to proceed without confirmation
    Ready {
        /// Readiness was never confirmed
        degraded: bool,
    },
}

impl SessionPhase {
    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub fn can_transition_to(&self, next: SessionPhase) -> bool {
        use SessionPhase::*;
        matches!(
            (self, next),
            (SignedOut, Authenticating)
                | (Authenticating, ReadinessPending)
                | (ReadinessPending, Ready { .. })
                | (Ready { degraded: true }, Ready { degraded: false })
                | (Authenticating | ReadinessPending | Ready { .. }, SignedOut)
        )
    }

    #[must_use]
    pub fn is_signed_in(&self) -> bool {
        !matches!(self, SessionPhase::SignedOut)
    }
}

#[derive(Debug, Clone, Copy)]
struct Session {
    phase: SessionPhase,
    /// Correlates log lines of one sign-in
    id: Uuid,
}

// ============================================================================
// Coordinator
// ============================================================================

/// Coordinates authentication-dependent work for the application.
pub struct AuthCoordinator {
    config: CoordinatorConfig,
    clock: Arc<dyn Clock>,
    limiter: Arc<RateLimiter>,
    registry: InFlightRegistry,
    waiter: Arc<ReadinessWaiter>,
    retry: RetryExecutor,
    sessions: DashMap<SubjectId, Session>,
    /// Cancelled and replaced on every coordination reset
    session_token: ArcSwap<CancellationToken>,
    /// Cancelled once, on shutdown; stops background tasks
    shutdown: CancellationToken,
}

impl std::fmt::Debug for AuthCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthCoordinator")
            .field("sessions", &self.sessions.len())
            .field("registry", &self.registry)
            .field("waiter", &self.waiter)
            .finish()
    }
}

impl AuthCoordinator {
    /// Build a coordinator on the tokio clock.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if `config` fails validation.
    pub fn new(
        config: CoordinatorConfig,
        provider: Arc<dyn IdentityProvider>,
        probe: Arc<dyn AccessProbe>,
    ) -> Result<Self, ConfigError> {
        Self::with_clock(config, provider, probe, Arc::new(TokioClock))
    }

    /// Build a coordinator on an explicit clock.
    pub fn with_clock(
        config: CoordinatorConfig,
        provider: Arc<dyn IdentityProvider>,
        probe: Arc<dyn AccessProbe>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(
            config.rate_limit.table.clone(),
            clock.clone(),
        ));
        let waiter = Arc::new(ReadinessWaiter::new(
            provider,
            probe,
            clock.clone(),
            config.readiness.clone(),
            config.propagation_window,
        ));
        let retry = RetryExecutor::new(
            waiter.clone(),
            clock.clone(),
            config.retry.clone(),
            config.propagation_window,
        );

        Ok(Self {
            config,
            clock,
            limiter,
            registry: InFlightRegistry::new(),
            waiter,
            retry,
            sessions: DashMap::new(),
            session_token: ArcSwap::from_pointee(CancellationToken::new()),
            shutdown: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    #[must_use]
    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    #[must_use]
    pub fn registry(&self) -> &InFlightRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------------
    // Readiness
    // ------------------------------------------------------------------------

    /// Wait until `subject`'s credential is usable against the store.
    ///
    /// Returns `false` when readiness could not be confirmed in time, when the
    /// probe hit a genuine authorization failure, or when a reset aborted the
    /// wait. `false` is advisory: the caller may still proceed, see
    /// [`AuthCoordinator::proceed_degraded`].
    pub async fn wait_for_auth_ready(&self, subject: &SubjectId, timeout: Duration) -> bool {
        matches!(
            self.readiness(subject, timeout).await,
            Ok(ReadinessOutcome::Ready { .. })
        )
    }

    /// [`AuthCoordinator::wait_for_auth_ready`] bounded by `readiness.timeout`.
    pub async fn wait_for_auth_ready_default(&self, subject: &SubjectId) -> bool {
        self.wait_for_auth_ready(subject, self.config.readiness.timeout)
            .await
    }

    /// Like [`AuthCoordinator::wait_for_auth_ready`], for callers that must stop
    /// when readiness is unconfirmed.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::ReadinessTimeout`], [`CoordinationError::Terminal`]
    /// for a denied probe, or [`CoordinationError::Cancelled`].
    pub async fn ensure_auth_ready(
        &self,
        subject: &SubjectId,
        timeout: Duration,
    ) -> Result<(), CoordinationError> {
        self.readiness(subject, timeout).await?.into_result(subject)
    }

    async fn readiness(
        &self,
        subject: &SubjectId,
        timeout: Duration,
    ) -> Result<ReadinessOutcome, CoordinationError> {
        let token = self.session_token.load_full();
        let outcome = self.waiter.wait(subject, timeout, &token).await?;
        if outcome.is_ready() {
            self.transition(subject, SessionPhase::Ready { degraded: false });
        }
        Ok(outcome)
    }

    /// Move a subject whose readiness timed out to `Ready` anyway.
    pub fn proceed_degraded(&self, subject: &SubjectId) {
        self.transition(subject, SessionPhase::Ready { degraded: true });
    }

    /// Snapshot of the subject's readiness state.
    #[must_use]
    pub fn readiness_state(&self, subject: &SubjectId) -> Option<ReadinessState> {
        self.waiter.state(subject)
    }

    // ------------------------------------------------------------------------
    // Deduplication and retry
    // ------------------------------------------------------------------------

    /// Run `loader` unless an identical request is already in flight, in which
    /// case join it. Every joined caller receives the same outcome.
    pub async fn run_deduplicated<T, F, Fut>(
        &self,
        key: &str,
        loader: F,
    ) -> Result<T, CoordinationError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CoordinationError>> + Send + 'static,
    {
        self.registry.join_or_start(key, loader).await
    }

    /// Run `operation` as `subject` under coordinated retry.
    ///
    /// # Errors
    ///
    /// See [`RetryExecutor::execute`].
    pub async fn run_with_coordinated_retry<T, F, Fut>(
        &self,
        subject: &SubjectId,
        operation: F,
        max_attempts: u32,
    ) -> Result<T, CoordinationError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let token = self.session_token.load_full();
        let result = self
            .retry
            .execute(subject, operation, max_attempts, &token)
            .await;
        if result.is_ok() && self.phase(subject) == SessionPhase::ReadinessPending {
            // The operation went through, so the store accepted the credential.
            self.transition(subject, SessionPhase::Ready { degraded: false });
        }
        result
    }

    /// Get-or-join a shared load that itself runs under coordinated retry.
    ///
    /// This is the usual shape for profile and workspace reads issued by many
    /// components at once right after sign-in.
    pub async fn load_shared<T, F, Fut>(
        self: &Arc<Self>,
        subject: &SubjectId,
        key: &str,
        operation: F,
    ) -> Result<T, CoordinationError>
    where
        T: Clone + Send + Sync + 'static,
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, StoreError>> + Send + 'static,
    {
        let this = Arc::clone(self);
        let subject = subject.clone();
        let attempts = self.config.retry.max_attempts;
        self.registry
            .join_or_start(key, move || async move {
                this.run_with_coordinated_retry(&subject, operation, attempts)
                    .await
            })
            .await
    }

    // ------------------------------------------------------------------------
    // Rate limiting
    // ------------------------------------------------------------------------

    /// Record an attempt for `identifier` and decide whether it may proceed.
    pub fn is_operation_allowed(&self, identifier: &str, operation: &str) -> RateLimitDecision {
        self.limiter.is_allowed(identifier, operation)
    }

    /// Report the outcome of an attempt. Success forgives earlier failures.
    pub fn record_operation_outcome(&self, identifier: &str, operation: &str, success: bool) {
        self.limiter.record_attempt(identifier, operation, success);
    }

    /// Run an authentication entry point behind the rate limiter.
    ///
    /// Checks the limiter before invoking `attempt` and records the outcome
    /// afterwards.
    ///
    /// # Errors
    ///
    /// [`CoordinationError::RateLimited`] without invoking `attempt` when the
    /// identifier is blocked; otherwise the attempt's own failure classified
    /// as terminal or retryable.
    pub async fn guard_auth_operation<T, Fut>(
        &self,
        identifier: &str,
        operation: &str,
        attempt: impl FnOnce() -> Fut,
    ) -> Result<T, CoordinationError>
    where
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let decision = self.is_operation_allowed(identifier, operation);
        if !decision.allowed {
            let retry_after = decision.retry_after(self.clock.now()).unwrap_or_default();
            tracing::warn!(
                identifier = %identifier,
                operation = %operation,
                retry_after_secs = retry_after.as_secs(),
                "Auth operation rate limited"
            );
            return Err(CoordinationError::RateLimited {
                identifier: identifier.to_string(),
                operation: operation.to_string(),
                retry_after,
            });
        }

        let result = attempt().await;
        self.record_operation_outcome(identifier, operation, result.is_ok());
        result.map_err(|source| match classify(&source, None, self.config.propagation_window) {
            Disposition::Retryable => CoordinationError::Retryable {
                attempts: 1,
                source,
            },
            Disposition::Terminal => CoordinationError::Terminal {
                attempts: 1,
                source,
            },
        })
    }

    // ------------------------------------------------------------------------
    // Session lifecycle
    // ------------------------------------------------------------------------

    /// Current phase of `subject`.
    #[must_use]
    pub fn phase(&self, subject: &SubjectId) -> SessionPhase {
        self.sessions
            .get(subject)
            .map_or(SessionPhase::SignedOut, |session| session.phase)
    }

    /// A credential was issued for its subject.
    ///
    /// Any other signed-in subject is signed out first, so the new session
    /// starts from a clean slate.
    pub fn on_credential_issued(&self, credential: &Credential) {
        let others: Vec<SubjectId> = self
            .sessions
            .iter()
            .filter(|entry| entry.key() != &credential.subject && entry.phase.is_signed_in())
            .map(|entry| entry.key().clone())
            .collect();
        for other in others {
            self.on_signed_out(&other);
        }

        let subject = &credential.subject;
        if self.phase(subject).is_signed_in() {
            tracing::debug!(subject = %subject, "Credential reissued for signed-in subject");
            return;
        }
        let id = Uuid::new_v4();
        self.sessions.insert(
            subject.clone(),
            Session {
                phase: SessionPhase::Authenticating,
                id,
            },
        );
        self.waiter.mark_authenticated(credential);
        tracing::info!(subject = %subject, session = %id, "Session authenticating");
    }

    /// The provider confirmed the subject's credential.
    pub fn on_credential_confirmed(&self, subject: &SubjectId) {
        self.transition(subject, SessionPhase::ReadinessPending);
    }

    /// The subject signed out. Triggers a full coordination reset.
    pub fn on_signed_out(&self, subject: &SubjectId) {
        let previous = self.phase(subject);
        if !previous.is_signed_in() {
            return;
        }
        let session = self.sessions.remove(subject).map(|(_, s)| s.id);
        self.reset_coordination_state();
        if self.config.rate_limit.reset_on_sign_out {
            self.limiter.clear_identifier(subject.as_str());
        }
        tracing::info!(subject = %subject, session = ?session, from = ?previous, "Session signed out");
    }

    /// Discard every in-flight request and all readiness state, and abort
    /// outstanding readiness polls and backoff sleeps.
    ///
    /// Rate limit records survive; a sign-out must not reset brute-force
    /// counters unless `rate_limit.reset_on_sign_out` is set.
    pub fn reset_coordination_state(&self) {
        let previous = self
            .session_token
            .swap(Arc::new(CancellationToken::new()));
        previous.cancel();
        let aborted = self.registry.clear();
        self.waiter.clear();
        tracing::info!(aborted_requests = aborted, "Coordination state reset");
    }

    fn transition(&self, subject: &SubjectId, next: SessionPhase) {
        let Some(mut session) = self.sessions.get_mut(subject) else {
            tracing::debug!(subject = %subject, to = ?next, "Transition ignored for signed-out subject");
            return;
        };
        if session.phase == next {
            return;
        }
        if !session.phase.can_transition_to(next) {
            tracing::debug!(subject = %subject, from = ?session.phase, to = ?next, "Transition ignored");
            return;
        }
        tracing::info!(subject = %subject, session = %session.id, from = ?session.phase, to = ?next, "Session transition");
        session.phase = next;
    }

    // ------------------------------------------------------------------------
    // Background tasks
    // ------------------------------------------------------------------------

    /// Drive the session state machine from the provider's credential stream.
    pub fn watch_identity(self: &Arc<Self>, provider: Arc<dyn IdentityProvider>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let mut changes = provider.subscribe();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut current: Option<SubjectId> = None;
            loop {
                let credential = changes.borrow_and_update().clone();
                current = this.apply_credential_change(current, credential);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    changed = changes.changed() => {
                        if changed.is_err() {
                            tracing::debug!("Identity provider closed its credential stream");
                            break;
                        }
                    }
                }
            }
        })
    }

    fn apply_credential_change(
        &self,
        current: Option<SubjectId>,
        credential: Option<Credential>,
    ) -> Option<SubjectId> {
        match (current, credential) {
            (None, None) => None,
            (Some(previous), None) => {
                self.on_signed_out(&previous);
                None
            }
            (Some(previous), Some(credential)) if previous == credential.subject => Some(previous),
            (previous, Some(credential)) => {
                if let Some(previous) = previous {
                    self.on_signed_out(&previous);
                }
                self.on_credential_issued(&credential);
                self.on_credential_confirmed(&credential.subject);
                Some(credential.subject)
            }
        }
    }

    /// Start the periodic rate limiter sweep. Stops on [`AuthCoordinator::shutdown`].
    pub fn spawn_sweeper(&self) -> JoinHandle<()> {
        self.limiter
            .spawn_sweeper(self.config.rate_limit.sweep_interval, self.shutdown.clone())
    }

    /// Stop background tasks and abort everything outstanding.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.reset_coordination_state();
    }
}
