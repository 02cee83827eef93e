//! In-memory identity provider and data store for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use authcoord::{AccessProbe, Credential, IdentityProvider, StoreError, SubjectId};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Provider whose credential is set by the test.
pub struct FakeProvider {
    tx: watch::Sender<Option<Credential>>,
}

impl FakeProvider {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }

    /// Issue a credential for `subject` now.
    pub fn sign_in(&self, subject: &str) -> Credential {
        let credential = Credential::new(subject, format!("token-{subject}"), Instant::now());
        self.tx.send_replace(Some(credential.clone()));
        credential
    }

    pub fn sign_out(&self) {
        self.tx.send_replace(None);
    }
}

#[async_trait]
impl IdentityProvider for FakeProvider {
    async fn current_credential(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    async fn refresh_credential(&self, _force: bool) -> Result<Credential, StoreError> {
        self.tx
            .borrow()
            .clone()
            .ok_or_else(|| StoreError::invalid_credentials("no user signed in"))
    }

    fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

/// Store that rejects every credential for `propagation` after its issuance.
pub struct FakeStore {
    propagation: Mutex<Duration>,
    probes: AtomicU32,
}

impl FakeStore {
    pub fn with_propagation(propagation: Duration) -> Self {
        Self {
            propagation: Mutex::new(propagation),
            probes: AtomicU32::new(0),
        }
    }

    pub fn set_propagation(&self, propagation: Duration) {
        *self.propagation.lock().unwrap() = propagation;
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Simulated authorized read.
    pub fn read(&self, credential: &Credential) -> Result<(), StoreError> {
        let propagation = *self.propagation.lock().unwrap();
        if Instant::now() < credential.issued_at + propagation {
            Err(StoreError::permission_denied(
                "missing or insufficient permissions",
            ))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AccessProbe for FakeStore {
    async fn check_access(&self, credential: &Credential) -> Result<(), StoreError> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.read(credential)
    }
}

pub fn subject(id: &str) -> SubjectId {
    SubjectId::from(id)
}
