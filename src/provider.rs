//! Interfaces of the external identity provider and data store.
//!
//! The coordinator never sees token formats or record shapes. It needs to
//! know who is signed in, when their credential was issued, and whether a
//! trivial authorized read currently succeeds.

use crate::error::StoreError;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::watch;
use tokio::time::Instant;

/// Authenticated user identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubjectId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Credential issued by the identity provider.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub subject: SubjectId,
    /// Opaque bearer token
    pub token: String,
    /// When the provider issued this credential
    pub issued_at: Instant,
}

impl Credential {
    pub fn new(subject: impl Into<SubjectId>, token: impl Into<String>, issued_at: Instant) -> Self {
        Self {
            subject: subject.into(),
            token: token.into(),
            issued_at,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("subject", &self.subject)
            .field("token", &"[REDACTED]")
            .field("issued_at", &self.issued_at)
            .finish()
    }
}

/// Identity provider the application signs in with.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Credential of the signed-in user, if any.
    async fn current_credential(&self) -> Option<Credential>;

    /// Fetch a fresh credential. `force` bypasses any provider-side cache.
    async fn refresh_credential(&self, force: bool) -> Result<Credential, StoreError>;

    /// Stream of credential changes; `None` means signed out.
    fn subscribe(&self) -> watch::Receiver<Option<Credential>>;
}

/// Lightweight authorized read against the data store.
///
/// Succeeds once the store accepts the credential.
#[async_trait]
pub trait AccessProbe: Send + Sync {
    async fn check_access(&self, credential: &Credential) -> Result<(), StoreError>;
}
