//! Sliding-window attempt counter with temporary blocks.
//!
//! One [`AttemptRecord`] lives per `(identifier, operation)` pair. When a
//! record reaches its policy limit it is replaced by a [`Block`] on the
//! identifier, which denies every operation class until it expires.

use super::{OperationPolicy, RateLimitDecision};
use crate::clock::deadline_after;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

/// Attempts observed for one identifier and operation class in the current window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub identifier: String,
    pub operation: String,
    pub count: u32,
    pub window_start: Instant,
    pub window_end: Instant,
}

impl AttemptRecord {
    fn open(identifier: &str, operation: &str, policy: &OperationPolicy, now: Instant) -> Self {
        Self {
            identifier: identifier.to_string(),
            operation: operation.to_string(),
            count: 1,
            window_start: now,
            window_end: deadline_after(now, policy.window),
        }
    }

    fn is_elapsed(&self, now: Instant) -> bool {
        now >= self.window_end
    }
}

/// Temporary denial of all operations for an identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub identifier: String,
    pub unblock_at: Instant,
}

impl Block {
    fn is_active(&self, now: Instant) -> bool {
        now < self.unblock_at
    }
}

type RecordKey = (String, String);

/// Counts attempts per `(identifier, operation)` and tracks blocks per identifier.
///
/// Each map entry is guarded by its shard lock, so the check-then-increment
/// in [`SlidingWindowCounter::hit`] is atomic for a given pair even when
/// callers run on different worker threads.
#[derive(Debug, Default)]
pub struct SlidingWindowCounter {
    records: DashMap<RecordKey, AttemptRecord>,
    blocks: DashMap<String, Block>,
}

impl SlidingWindowCounter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt and decide whether it may proceed.
    pub fn hit(
        &self,
        identifier: &str,
        operation: &str,
        policy: &OperationPolicy,
        now: Instant,
    ) -> RateLimitDecision {
        if let Some(unblock_at) = self.active_block(identifier, now) {
            return RateLimitDecision::deny(unblock_at);
        }

        let key = (identifier.to_string(), operation.to_string());
        match self.records.entry(key) {
            Entry::Vacant(vacant) => {
                let record = vacant.insert(AttemptRecord::open(identifier, operation, policy, now));
                RateLimitDecision::allow(
                    policy.max_attempts.saturating_sub(record.count),
                    record.window_end,
                )
            }
            Entry::Occupied(mut occupied) => {
                let record = occupied.get_mut();
                if record.is_elapsed(now) {
                    *record = AttemptRecord::open(identifier, operation, policy, now);
                    RateLimitDecision::allow(policy.max_attempts.saturating_sub(1), record.window_end)
                } else if record.count < policy.max_attempts {
                    record.count += 1;
                    RateLimitDecision::allow(
                        policy.max_attempts - record.count,
                        record.window_end,
                    )
                } else {
                    // The block supersedes the window; a fresh window opens once it lifts.
                    occupied.remove();
                    let unblock_at = deadline_after(now, policy.block);
                    self.blocks.insert(
                        identifier.to_string(),
                        Block {
                            identifier: identifier.to_string(),
                            unblock_at,
                        },
                    );
                    tracing::warn!(
                        identifier = %identifier,
                        operation = %operation,
                        block_secs = policy.block.as_secs(),
                        "Attempt limit reached, identifier blocked"
                    );
                    RateLimitDecision::deny(unblock_at)
                }
            }
        }
    }

    /// Attempts left for the pair without consuming one.
    #[must_use]
    pub fn remaining(
        &self,
        identifier: &str,
        operation: &str,
        policy: &OperationPolicy,
        now: Instant,
    ) -> u32 {
        if self.active_block(identifier, now).is_some() {
            return 0;
        }
        let key = (identifier.to_string(), operation.to_string());
        match self.records.get(&key) {
            Some(record) if !record.is_elapsed(now) => {
                policy.max_attempts.saturating_sub(record.count)
            }
            _ => policy.max_attempts,
        }
    }

    /// Expiry of the identifier's block, if one is active. Expired blocks are dropped.
    pub fn active_block(&self, identifier: &str, now: Instant) -> Option<Instant> {
        if let Some(block) = self.blocks.get(identifier) {
            if block.is_active(now) {
                return Some(block.unblock_at);
            }
        }
        self.blocks.remove_if(identifier, |_, block| !block.is_active(now));
        None
    }

    /// Forget the pair's attempt record and any block on the identifier.
    pub fn forgive(&self, identifier: &str, operation: &str) {
        self.records
            .remove(&(identifier.to_string(), operation.to_string()));
        self.blocks.remove(identifier);
    }

    /// Forget everything recorded for an identifier, across operation classes.
    pub fn clear_identifier(&self, identifier: &str) {
        self.records.retain(|(id, _), _| id != identifier);
        self.blocks.remove(identifier);
    }

    /// Drop elapsed records and expired blocks.
    ///
    /// Returns `(records_removed, blocks_removed)`.
    pub fn sweep(&self, now: Instant) -> (usize, usize) {
        let records_before = self.records.len();
        self.records.retain(|_, record| !record.is_elapsed(now));
        let blocks_before = self.blocks.len();
        self.blocks.retain(|_, block| block.is_active(now));
        (
            records_before.saturating_sub(self.records.len()),
            blocks_before.saturating_sub(self.blocks.len()),
        )
    }

    /// Number of live attempt records.
    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of blocks, including expired ones not yet swept.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn clear(&self) {
        self.records.clear();
        self.blocks.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn policy() -> OperationPolicy {
        OperationPolicy::new(3, Duration::from_secs(60), Duration::from_secs(300))
    }

    #[test]
    fn test_block_lifts_after_expiry() {
        let counter = SlidingWindowCounter::new();
        let policy = policy();
        let t0 = Instant::now();

        for _ in 0..3 {
            assert!(counter.hit("ip-1", "login", &policy, t0).allowed);
        }
        let denied = counter.hit("ip-1", "login", &policy, t0);
        assert!(!denied.allowed);
        assert_eq!(denied.blocked_until, Some(t0 + Duration::from_secs(300)));

        let later = t0 + Duration::from_secs(301);
        let decision = counter.hit("ip-1", "login", &policy, later);
        assert!(decision.allowed);
        assert_eq!(decision.remaining, Some(2));
        assert_eq!(counter.block_count(), 0);
    }

    #[test]
    fn test_block_covers_every_operation_class() {
        let counter = SlidingWindowCounter::new();
        let policy = policy();
        let now = Instant::now();

        for _ in 0..4 {
            counter.hit("ip-1", "login", &policy, now);
        }

        assert!(!counter.hit("ip-1", "signup", &policy, now).allowed);
        assert!(counter.hit("ip-2", "login", &policy, now).allowed);
    }

    #[test]
    fn test_remaining_does_not_consume() {
        let counter = SlidingWindowCounter::new();
        let policy = policy();
        let now = Instant::now();

        counter.hit("ip-1", "login", &policy, now);
        assert_eq!(counter.remaining("ip-1", "login", &policy, now), 2);
        assert_eq!(counter.remaining("ip-1", "login", &policy, now), 2);
        assert_eq!(counter.remaining("ip-1", "signup", &policy, now), 3);
    }

    #[test]
    fn test_sweep_removes_stale_state() {
        let counter = SlidingWindowCounter::new();
        let policy = policy();
        let t0 = Instant::now();

        counter.hit("fresh", "login", &policy, t0 + Duration::from_secs(50));
        counter.hit("stale", "login", &policy, t0);
        for _ in 0..4 {
            counter.hit("blocked", "login", &policy, t0);
        }
        assert_eq!(counter.record_count(), 2);
        assert_eq!(counter.block_count(), 1);

        let (records, blocks) = counter.sweep(t0 + Duration::from_secs(61));
        assert_eq!((records, blocks), (1, 0));
        assert_eq!(counter.record_count(), 1);

        let (_, blocks) = counter.sweep(t0 + Duration::from_secs(301));
        assert_eq!(blocks, 1);
        assert_eq!(counter.block_count(), 0);
    }

    #[test]
    fn test_huge_durations_do_not_overflow() {
        let policy = OperationPolicy::new(1, Duration::MAX, Duration::MAX);
        let counter = SlidingWindowCounter::new();
        let now = Instant::now();

        let first = counter.hit("ip-1", "login", &policy, now);
        assert!(first.allowed);
        assert!(first.reset_at.unwrap() > now);

        let denied = counter.hit("ip-1", "login", &policy, now);
        assert!(!denied.allowed);
        assert!(denied.blocked_until.unwrap() > now + Duration::from_secs(86_400 * 365));
        assert!(!counter.hit("ip-1", "signup", &policy, now).allowed);
    }

    #[test]
    fn test_clear_identifier_spans_operations() {
        let counter = SlidingWindowCounter::new();
        let policy = policy();
        let now = Instant::now();

        counter.hit("u1", "login", &policy, now);
        counter.hit("u1", "signup", &policy, now);
        counter.hit("u2", "login", &policy, now);

        counter.clear_identifier("u1");
        assert_eq!(counter.record_count(), 1);
    }
}
