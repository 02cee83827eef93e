//! Per-operation rate limiting policies.

use crate::config::humantime_serde;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Well-known operation classes.
pub mod operation {
    pub const LOGIN: &str = "login";
    pub const SIGNUP: &str = "signup";
    pub const PASSWORD_RESET: &str = "password-reset";
    pub const TOKEN_CHECK: &str = "token-check";
}

const MINUTE: u64 = 60;

/// Limits applied to one operation class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationPolicy {
    /// Attempts allowed inside one window
    pub max_attempts: u32,

    /// Length of the counting window
    #[serde(with = "humantime_serde")]
    pub window: Duration,

    /// How long an identifier stays blocked once the limit is hit
    #[serde(with = "humantime_serde")]
    pub block: Duration,
}

impl OperationPolicy {
    #[must_use]
    pub const fn new(max_attempts: u32, window: Duration, block: Duration) -> Self {
        Self {
            max_attempts,
            window,
            block,
        }
    }

    pub const fn login() -> Self {
        Self::new(
            5,
            Duration::from_secs(15 * MINUTE),
            Duration::from_secs(30 * MINUTE),
        )
    }

    pub const fn signup() -> Self {
        Self::new(
            3,
            Duration::from_secs(60 * MINUTE),
            Duration::from_secs(60 * MINUTE),
        )
    }

    pub const fn password_reset() -> Self {
        Self::new(
            2,
            Duration::from_secs(60 * MINUTE),
            Duration::from_secs(120 * MINUTE),
        )
    }

    pub const fn token_check() -> Self {
        Self::new(
            10,
            Duration::from_secs(5 * MINUTE),
            Duration::from_secs(15 * MINUTE),
        )
    }
}

/// Policy lookup keyed by operation class.
///
/// Unknown classes resolve to the fallback policy, which defaults to the
/// most restrictive built-in policy so that a typo in an operation name
/// fails closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyTable {
    #[serde(default = "default_policies")]
    pub policies: HashMap<String, OperationPolicy>,

    #[serde(default = "OperationPolicy::password_reset")]
    pub fallback: OperationPolicy,
}

fn default_policies() -> HashMap<String, OperationPolicy> {
    HashMap::from([
        (operation::LOGIN.to_string(), OperationPolicy::login()),
        (operation::SIGNUP.to_string(), OperationPolicy::signup()),
        (
            operation::PASSWORD_RESET.to_string(),
            OperationPolicy::password_reset(),
        ),
        (
            operation::TOKEN_CHECK.to_string(),
            OperationPolicy::token_check(),
        ),
    ])
}

impl Default for PolicyTable {
    fn default() -> Self {
        Self {
            policies: default_policies(),
            fallback: OperationPolicy::password_reset(),
        }
    }
}

impl PolicyTable {
    /// Policy for `operation`, or the fallback when the class is unknown.
    #[must_use]
    pub fn get(&self, operation: &str) -> &OperationPolicy {
        self.policies.get(operation).unwrap_or(&self.fallback)
    }

    /// Set or replace the policy for one class.
    #[must_use]
    pub fn with(mut self, operation: impl Into<String>, policy: OperationPolicy) -> Self {
        self.policies.insert(operation.into(), policy);
        self
    }
}
