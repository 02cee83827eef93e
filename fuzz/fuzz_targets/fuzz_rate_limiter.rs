#![no_main]

//! Fuzz target for the sliding-window rate limiter.
//!
//! Drives arbitrary interleavings of checks, outcomes, clock advances and
//! sweeps across a few identifiers and checks that:
//! - a denied decision always carries a block ending in the future
//! - remaining attempts never exceed the policy maximum
//! - a success always lifts the identifier's block

use arbitrary::Arbitrary;
use authcoord::clock::{Clock, ManualClock};
use authcoord::rate_limit::{PolicyTable, RateLimiter, operation};
use libfuzzer_sys::fuzz_target;
use std::sync::Arc;
use std::time::Duration;

const IDENTIFIERS: [&str; 3] = ["alice", "bob", "10.0.0.1"];
const OPERATIONS: [&str; 5] = [
    operation::LOGIN,
    operation::SIGNUP,
    operation::PASSWORD_RESET,
    operation::TOKEN_CHECK,
    "unlisted",
];

#[derive(Debug, Arbitrary)]
enum Step {
    Check { who: u8, op: u8 },
    Outcome { who: u8, op: u8, success: bool },
    Advance { secs: u16 },
    Sweep,
    Clear { who: u8 },
}

fuzz_target!(|steps: Vec<Step>| {
    let clock = Arc::new(ManualClock::new());
    let table = PolicyTable::default();
    let limiter = RateLimiter::new(table.clone(), clock.clone());

    for step in steps.into_iter().take(512) {
        match step {
            Step::Check { who, op } => {
                let id = IDENTIFIERS[usize::from(who) % IDENTIFIERS.len()];
                let op = OPERATIONS[usize::from(op) % OPERATIONS.len()];
                let decision = limiter.is_allowed(id, op);
                let now = clock.now();
                if decision.allowed {
                    let remaining = decision.remaining.unwrap_or_default();
                    assert!(remaining < table.get(op).max_attempts);
                } else {
                    let until = decision.blocked_until.expect("denial carries a block");
                    assert!(until > now);
                }
            }
            Step::Outcome { who, op, success } => {
                let id = IDENTIFIERS[usize::from(who) % IDENTIFIERS.len()];
                let op = OPERATIONS[usize::from(op) % OPERATIONS.len()];
                limiter.record_attempt(id, op, success);
                if success {
                    assert!(limiter.blocked_until(id).is_none());
                    assert_eq!(limiter.remaining_attempts(id, op), table.get(op).max_attempts);
                }
            }
            Step::Advance { secs } => clock.advance(Duration::from_secs(u64::from(secs))),
            Step::Sweep => {
                limiter.sweep();
            }
            Step::Clear { who } => {
                let id = IDENTIFIERS[usize::from(who) % IDENTIFIERS.len()];
                limiter.clear_identifier(id);
                assert!(limiter.blocked_until(id).is_none());
            }
        }
    }
});
