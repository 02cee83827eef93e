//! authcoord - auth coordination and abuse protection core.
//!
//! This library sits between application code and two remote dependencies,
//! an identity provider and a data store, and provides:
//!
//! - **Request deduplication:** concurrent callers asking for the same work
//!   join one underlying call ([`inflight`]).
//! - **Credential readiness:** bounded polling until a freshly issued
//!   credential is accepted by the store ([`readiness`]).
//! - **Coordinated retry:** bounded attempts with backoff that re-check
//!   readiness and separate transient from terminal failures ([`retry`]).
//! - **Rate limiting:** per-requester sliding windows and temporary blocks
//!   for login, signup, password reset and token checks ([`rate_limit`]).
//!
//! [`coordinator::AuthCoordinator`] composes all four and drives the
//! per-subject session lifecycle.
//!
//! State is in-memory and per-process.

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod inflight;
pub mod logging;
pub mod provider;
pub mod rate_limit;
pub mod readiness;
pub mod retry;

pub use config::CoordinatorConfig;
pub use coordinator::{AuthCoordinator, SessionPhase};
pub use error::{CoordinationError, ErrorKind, StoreError, StoreErrorKind};
pub use provider::{AccessProbe, Credential, IdentityProvider, SubjectId};
pub use rate_limit::RateLimitDecision;
