//! In-flight request registry.
//!
//! Concurrent callers asking for the same dedup key join one underlying
//! call instead of issuing their own. Entries live only while the work is
//! outstanding: the entry is removed as the work settles, before any joined
//! caller observes the outcome, so a call arriving afterwards always starts
//! fresh work.
//!
//! Work is spawned onto the runtime as soon as it is registered. Dropping
//! every caller's future does not cancel it; [`InFlightRegistry::clear`]
//! does, and joined callers then resolve to
//! [`CoordinationError::Cancelled`].

use crate::error::CoordinationError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::any::{Any, TypeId};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::task::AbortHandle;

/// Shared handle on an in-flight outcome. Every clone resolves to the same value.
pub type InFlight<T> = Shared<BoxFuture<'static, Result<T, CoordinationError>>>;

/// Dedup key. The output type is part of the key, so two loaders that
/// happen to share a string key but produce different types never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RegistryKey {
    key: String,
    output: TypeId,
}

impl RegistryKey {
    fn new<T: 'static>(key: &str) -> Self {
        Self {
            key: key.to_string(),
            output: TypeId::of::<T>(),
        }
    }
}

struct InFlightEntry {
    /// Distinguishes this registration from a later one under the same key
    generation: u64,
    /// `InFlight<T>` for the key's output type
    outcome: Box<dyn Any + Send + Sync>,
    abort: AbortHandle,
}

/// Map from dedup key to the single outstanding call for that key.
#[derive(Default)]
pub struct InFlightRegistry {
    entries: Arc<DashMap<RegistryKey, InFlightEntry>>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for InFlightRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InFlightRegistry")
            .field("in_flight", &self.entries.len())
            .finish()
    }
}

impl InFlightRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the outstanding call for `key`, or start one with `factory`.
    ///
    /// The join-or-start decision is made synchronously, when this method is
    /// called, not when the returned future is first polled. At most one
    /// `factory` runs per key at any instant.
    ///
    /// A `factory` that panics, either while building its future or while
    /// that future runs, still releases the key; every joined caller receives
    /// [`CoordinationError::RegistryFault`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn join_or_start<T, F, Fut>(&self, key: &str, factory: F) -> InFlight<T>
    where
        T: Clone + Send + Sync + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, CoordinationError>> + Send + 'static,
    {
        let registry_key = RegistryKey::new::<T>(key);
        match self.entries.entry(registry_key.clone()) {
            Entry::Occupied(occupied) => {
                match occupied.get().outcome.downcast_ref::<InFlight<T>>() {
                    Some(shared) => {
                        tracing::debug!(key = %key, "Joining in-flight request");
                        shared.clone()
                    }
                    None => futures_util::future::ready(Err(CoordinationError::RegistryFault {
                        key: key.to_string(),
                        details: "registered outcome has an unexpected type".to_string(),
                    }))
                    .boxed()
                    .shared(),
                }
            }
            Entry::Vacant(vacant) => {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                let entries = Arc::clone(&self.entries);
                let task_key = key.to_string();

                tracing::debug!(key = %key, generation, "Starting in-flight request");
                let task = tokio::spawn(async move {
                    let outcome = AssertUnwindSafe(async move { factory().await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(CoordinationError::RegistryFault {
                                key: task_key.clone(),
                                details: panic_details(panic.as_ref()),
                            })
                        });
                    // Release the key before any caller sees the outcome.
                    entries.remove_if(&registry_key, |_, entry| entry.generation == generation);
                    tracing::debug!(key = %task_key, ok = outcome.is_ok(), "In-flight request settled");
                    outcome
                });

                let abort = task.abort_handle();
                let fault_key = key.to_string();
                let shared: InFlight<T> = async move {
                    match task.await {
                        Ok(outcome) => outcome,
                        Err(e) if e.is_cancelled() => Err(CoordinationError::cancelled_by_reset()),
                        Err(e) => Err(CoordinationError::RegistryFault {
                            key: fault_key,
                            details: e.to_string(),
                        }),
                    }
                }
                .boxed()
                .shared();

                vacant.insert(InFlightEntry {
                    generation,
                    outcome: Box::new(shared.clone()),
                    abort,
                });
                shared
            }
        }
    }

    /// Whether any call is outstanding under `key`.
    #[must_use]
    pub fn is_in_flight(&self, key: &str) -> bool {
        self.entries.iter().any(|entry| entry.key().key == key)
    }

    /// Number of outstanding calls.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Abort every outstanding call and forget all entries.
    ///
    /// Returns the number of calls aborted.
    pub fn clear(&self) -> usize {
        let keys: Vec<RegistryKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut aborted = 0;
        for key in keys {
            if let Some((_, entry)) = self.entries.remove(&key) {
                entry.abort.abort();
                aborted += 1;
            }
        }
        aborted
    }
}

fn panic_details(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("loader panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("loader panicked: {s}")
    } else {
        "loader panicked".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Profile {
        name: String,
    }

    /// Tests that concurrent callers share one loader invocation.
    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_call() {
        let registry = InFlightRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let futures: Vec<_> = (0..10)
            .map(|_| {
                let calls = Arc::clone(&calls);
                registry.join_or_start("profile:u1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(Arc::new(Profile {
                        name: "Ada".to_string(),
                    }))
                })
            })
            .collect();

        assert_eq!(registry.len(), 1);
        let results = futures::future::join_all(futures).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = results[0].as_ref().unwrap();
        for result in &results {
            assert!(Arc::ptr_eq(first, result.as_ref().unwrap()));
        }
        assert!(registry.is_empty());
    }

    /// Tests that failures are shared too, and the key is released afterwards.
    #[tokio::test]
    async fn test_failure_is_shared_and_released() {
        let registry = InFlightRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let make = |calls: Arc<AtomicUsize>| {
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::task::yield_now().await;
                Err::<u32, _>(CoordinationError::Terminal {
                    attempts: 1,
                    source: StoreError::invalid_credentials("expired"),
                })
            }
        };

        let a = registry.join_or_start("k", make(Arc::clone(&calls)));
        let b = registry.join_or_start("k", make(Arc::clone(&calls)));
        let (a, b) = tokio::join!(a, b);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(a, b);
        assert!(a.is_err());
        assert!(!registry.is_in_flight("k"));

        // Settled: the next call starts genuinely new work.
        let c = registry.join_or_start("k", make(Arc::clone(&calls))).await;
        assert!(c.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Tests that a loader panicking before producing its future still cleans up.
    #[tokio::test]
    async fn test_factory_panic_becomes_registry_fault() {
        let registry = InFlightRegistry::new();

        #[allow(unreachable_code)]
        let a = registry.join_or_start::<u32, _, _>("boom", || {
            panic!("profile loader misconfigured");
            async { Ok(1) }
        });
        let b = registry.join_or_start::<u32, _, _>("boom", || async { Ok(2) });
        let (a, b) = tokio::join!(a, b);

        for result in [a, b] {
            match result {
                Err(CoordinationError::RegistryFault { key, details }) => {
                    assert_eq!(key, "boom");
                    assert!(details.contains("misconfigured"));
                }
                other => panic!("expected registry fault, got {other:?}"),
            }
        }
        assert!(registry.is_empty());
    }

    /// Tests that different output types under one string key do not collide.
    #[tokio::test]
    async fn test_output_type_is_part_of_key() {
        let registry = InFlightRegistry::new();

        let n = registry.join_or_start("k", || async { Ok(7u32) });
        let s = registry.join_or_start("k", || async { Ok("seven".to_string()) });
        assert_eq!(registry.len(), 2);

        assert_eq!(n.await.unwrap(), 7);
        assert_eq!(s.await.unwrap(), "seven");
    }

    /// Tests that clearing aborts outstanding work.
    #[tokio::test(start_paused = true)]
    async fn test_clear_cancels_joined_callers() {
        let registry = InFlightRegistry::new();
        let pending = registry.join_or_start("slow", || async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(1u8)
        });

        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
        assert!(matches!(
            pending.await,
            Err(CoordinationError::Cancelled { .. })
        ));
    }
}
