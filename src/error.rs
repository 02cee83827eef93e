//! Error taxonomy for the auth coordination core.
//!
//! Remote operations fail with a [`StoreError`]. The coordination layer turns
//! those into a [`CoordinationError`] whose [`ErrorKind`] tells callers
//! whether to try again shortly, check their credentials, or slow down.

use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// Remote store errors
// ============================================================================

/// Kind of failure reported by the identity provider or the data store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreErrorKind {
    /// Connection reset, DNS failure, request aborted.
    Network,
    /// Store temporarily unavailable (overloaded, failing over).
    Unavailable,
    /// Remote call exceeded its deadline.
    Timeout,
    /// Caller is authenticated but not authorized for this resource.
    PermissionDenied,
    /// Credential rejected outright (wrong password, revoked token).
    InvalidCredentials,
    /// Requested record does not exist.
    NotFound,
    /// Anything the store could not categorize.
    Other,
}

/// Failure of a single remote invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct StoreError {
    /// What went wrong
    pub kind: StoreErrorKind,
    /// Message from the remote side
    pub message: String,
}

impl StoreError {
    /// Create a store error.
    pub fn new(kind: StoreErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Network, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::Unavailable, message)
    }

    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::PermissionDenied, message)
    }

    pub fn invalid_credentials(message: impl Into<String>) -> Self {
        Self::new(StoreErrorKind::InvalidCredentials, message)
    }
}

// ============================================================================
// Classification
// ============================================================================

/// Whether re-attempting an operation could plausibly succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Retryable,
    Terminal,
}

/// Classify a store error as retryable or terminal.
///
/// A permission denial counts as retryable only when the credential was
/// issued less than `propagation_window` ago: the store may simply not have
/// seen the new token yet. The same error long after issuance is a real
/// authorization failure.
///
/// # Arguments
///
/// * `error` - The failure to classify
/// * `since_issued` - Time since the current credential was issued, if known
/// * `propagation_window` - How long after issuance denials are presumed transient
#[must_use]
pub fn classify(
    error: &StoreError,
    since_issued: Option<Duration>,
    propagation_window: Duration,
) -> Disposition {
    match error.kind {
        StoreErrorKind::Network | StoreErrorKind::Unavailable | StoreErrorKind::Timeout => {
            Disposition::Retryable
        }
        StoreErrorKind::PermissionDenied => match since_issued {
            Some(age) if age < propagation_window => Disposition::Retryable,
            _ => Disposition::Terminal,
        },
        StoreErrorKind::InvalidCredentials | StoreErrorKind::NotFound | StoreErrorKind::Other => {
            Disposition::Terminal
        }
    }
}

// ============================================================================
// Coordination errors
// ============================================================================

/// Coarse error kind exposed to the presentation layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    RateLimited,
    ReadinessTimeout,
    Retryable,
    Terminal,
    RegistryFault,
    Cancelled,
}

/// What the user should be told to do about a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UserHint {
    /// Transient problem, the same action will probably work in a moment.
    TryAgainShortly,
    /// The credentials or permissions are wrong.
    CheckCredentials,
    /// Too many attempts, wait before trying again.
    SlowDown,
}

/// Failure returned by the coordination layer.
///
/// `Clone` because a single in-flight outcome is handed to every caller that
/// joined it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinationError {
    /// Identifier is blocked for this operation class
    #[error("Too many {operation} attempts for {identifier}, retry after {retry_after:?}")]
    RateLimited {
        /// Requester identifier (user id, email, client address)
        identifier: String,
        /// Operation class that was denied
        operation: String,
        /// How long until the block lifts
        retry_after: Duration,
    },

    /// Credential propagation could not be confirmed in time
    #[error("Readiness for subject {subject} not confirmed after {waited:?}")]
    ReadinessTimeout {
        /// Subject that was being waited on
        subject: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// Transient failure that persisted through every attempt
    #[error("Operation failed after {attempts} attempts: {source}")]
    Retryable {
        /// Number of times the operation was invoked
        attempts: u32,
        /// Last observed failure
        source: StoreError,
    },

    /// Failure that retrying cannot fix
    #[error("Operation failed permanently on attempt {attempts}: {source}")]
    Terminal {
        /// Attempt number on which the failure was observed
        attempts: u32,
        /// The failure
        source: StoreError,
    },

    /// The shared in-flight work failed before producing a result
    #[error("In-flight request for key {key} faulted: {details}")]
    RegistryFault {
        /// Dedup key
        key: String,
        /// Error details
        details: String,
    },

    /// A wait was aborted because coordination state was reset
    #[error("Cancelled: {reason}")]
    Cancelled {
        /// Why the wait was aborted
        reason: String,
    },
}

impl CoordinationError {
    /// Coarse kind for presentation and metrics labels.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::ReadinessTimeout { .. } => ErrorKind::ReadinessTimeout,
            Self::Retryable { .. } => ErrorKind::Retryable,
            Self::Terminal { .. } => ErrorKind::Terminal,
            Self::RegistryFault { .. } => ErrorKind::RegistryFault,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
        }
    }

    /// Suggested user-facing action.
    #[must_use]
    pub fn user_hint(&self) -> UserHint {
        match self {
            Self::RateLimited { .. } => UserHint::SlowDown,
            Self::Terminal { source, .. } => match source.kind {
                StoreErrorKind::InvalidCredentials | StoreErrorKind::PermissionDenied => {
                    UserHint::CheckCredentials
                }
                _ => UserHint::TryAgainShortly,
            },
            _ => UserHint::TryAgainShortly,
        }
    }

    /// Underlying store error, if this failure came from a remote call.
    #[must_use]
    pub fn store_error(&self) -> Option<&StoreError> {
        match self {
            Self::Retryable { source, .. } | Self::Terminal { source, .. } => Some(source),
            _ => None,
        }
    }

    pub(crate) fn cancelled_by_reset() -> Self {
        Self::Cancelled {
            reason: "coordination state was reset".to_string(),
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Config file could not be parsed
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yml::Error),

    /// Environment override could not be parsed
    #[error("Invalid value for {var}: {details}")]
    Env { var: String, details: String },

    /// Parsed values are inconsistent
    #[error("Invalid config: {0}")]
    Invalid(String),
}
