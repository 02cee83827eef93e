//! End-to-end coordination flows against in-memory collaborators.

mod common;

use anyhow::Context;
use authcoord::clock::ManualClock;
use authcoord::config::ENV_READINESS_TIMEOUT;
use authcoord::rate_limit::operation;
use authcoord::{
    AuthCoordinator, CoordinationError, CoordinatorConfig, Credential, SessionPhase, StoreError,
};
use common::{FakeProvider, FakeStore, subject};
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

struct Fixture {
    coordinator: Arc<AuthCoordinator>,
    provider: Arc<FakeProvider>,
    store: Arc<FakeStore>,
}

fn fixture(propagation: Duration) -> anyhow::Result<Fixture> {
    let provider = Arc::new(FakeProvider::new());
    let store = Arc::new(FakeStore::with_propagation(propagation));
    let coordinator = Arc::new(AuthCoordinator::new(
        CoordinatorConfig::default(),
        provider.clone(),
        store.clone(),
    )?);
    Ok(Fixture {
        coordinator,
        provider,
        store,
    })
}

async fn wait_for_phase(coordinator: &AuthCoordinator, who: &str, phase: SessionPhase) {
    for _ in 0..100 {
        if coordinator.phase(&subject(who)) == phase {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "{who} never reached {phase:?}, stuck at {:?}",
        coordinator.phase(&subject(who))
    );
}

/// Tests that concurrent identical loads run the loader exactly once.
#[tokio::test(start_paused = true)]
async fn test_dedup_runs_loader_once() -> anyhow::Result<()> {
    let f = fixture(Duration::ZERO)?;
    let calls = Arc::new(AtomicU32::new(0));

    let loads = (0..20).map(|_| {
        let calls = Arc::clone(&calls);
        let coordinator = Arc::clone(&f.coordinator);
        async move {
            coordinator
                .run_deduplicated("profile:u1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(Arc::new("Ada Lovelace".to_string()))
                })
                .await
        }
    });
    let results = futures::future::join_all(loads).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let first = results[0].clone()?;
    assert!(results.iter().all(|r| Arc::ptr_eq(&first, r.as_ref().unwrap())));
    assert!(f.coordinator.registry().is_empty());
    Ok(())
}

/// Tests the first reads after sign-in: several components load the profile
/// while the credential is still propagating to the store.
#[tokio::test(start_paused = true)]
async fn test_sign_in_then_shared_profile_load() -> anyhow::Result<()> {
    let f = fixture(Duration::from_millis(600))?;
    let listener = f.coordinator.watch_identity(f.provider.clone());

    let credential = f.provider.sign_in("u1");
    wait_for_phase(&f.coordinator, "u1", SessionPhase::ReadinessPending).await;

    let reads = Arc::new(AtomicU32::new(0));
    let loads = (0..5).map(|_| {
        let coordinator = Arc::clone(&f.coordinator);
        let store = Arc::clone(&f.store);
        let credential = credential.clone();
        let reads = Arc::clone(&reads);
        async move {
            coordinator
                .load_shared(&subject("u1"), "profile:u1", move || {
                    reads.fetch_add(1, Ordering::SeqCst);
                    let result = store.read(&credential).map(|()| "profile".to_string());
                    async move { result }
                })
                .await
        }
    });
    let results = futures::future::join_all(loads).await;

    for result in &results {
        assert_eq!(result.as_deref(), Ok("profile"));
    }
    // Readiness absorbed the propagation delay, so the read ran once.
    assert_eq!(reads.load(Ordering::SeqCst), 1);
    assert!(f.store.probes() > 1);
    assert_eq!(
        f.coordinator.phase(&subject("u1")),
        SessionPhase::Ready { degraded: false }
    );

    f.coordinator.shutdown();
    listener.await?;
    Ok(())
}

/// Tests that signing out aborts a retry that is waiting on readiness.
#[tokio::test(start_paused = true)]
async fn test_sign_out_cancels_outstanding_wait() -> anyhow::Result<()> {
    let f = fixture(Duration::from_secs(3600))?;
    let listener = f.coordinator.watch_identity(f.provider.clone());
    let credential = f.provider.sign_in("u1");
    wait_for_phase(&f.coordinator, "u1", SessionPhase::ReadinessPending).await;

    let pending = {
        let coordinator = Arc::clone(&f.coordinator);
        let store = Arc::clone(&f.store);
        tokio::spawn(async move {
            coordinator
                .run_with_coordinated_retry(
                    &subject("u1"),
                    || {
                        let result = store.read(&credential);
                        async move { result }
                    },
                    5,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(700)).await;
    f.provider.sign_out();
    wait_for_phase(&f.coordinator, "u1", SessionPhase::SignedOut).await;

    let result = pending.await?;
    assert!(matches!(result, Err(CoordinationError::Cancelled { .. })));
    assert!(f.coordinator.readiness_state(&subject("u1")).is_none());

    f.coordinator.shutdown();
    listener.await?;
    Ok(())
}

/// Tests that a reset forgets settled work and cached readiness.
#[tokio::test(start_paused = true)]
async fn test_reset_completeness() -> anyhow::Result<()> {
    let f = fixture(Duration::ZERO)?;
    let credential = f.provider.sign_in("u1");
    f.coordinator.on_credential_issued(&credential);
    f.coordinator.on_credential_confirmed(&subject("u1"));

    assert!(
        f.coordinator
            .wait_for_auth_ready(&subject("u1"), Duration::from_secs(1))
            .await
    );
    let state = f
        .coordinator
        .readiness_state(&subject("u1"))
        .context("readiness state after a confirmed wait")?;
    assert!(state.store_access_confirmed);

    let calls = Arc::new(AtomicU32::new(0));
    let load = |calls: Arc<AtomicU32>| {
        move || async move { Ok(calls.fetch_add(1, Ordering::SeqCst) + 1) }
    };
    let first = f
        .coordinator
        .run_deduplicated("workspace:w1", load(calls.clone()))
        .await;
    assert_eq!(first, Ok(1));

    f.coordinator.reset_coordination_state();

    let second = f
        .coordinator
        .run_deduplicated("workspace:w1", load(calls.clone()))
        .await;
    assert_eq!(second, Ok(2));
    assert!(f.coordinator.readiness_state(&subject("u1")).is_none());

    let probes_before = f.store.probes();
    assert!(
        f.coordinator
            .wait_for_auth_ready(&subject("u1"), Duration::from_secs(1))
            .await
    );
    assert_eq!(f.store.probes(), probes_before + 1);
    Ok(())
}

/// Tests that an explicit sign-out resets coordination but leaves the state
/// machine able to sign the same subject in again.
#[tokio::test(start_paused = true)]
async fn test_sign_out_and_back_in() -> anyhow::Result<()> {
    let f = fixture(Duration::ZERO)?;

    let credential = f.provider.sign_in("u1");
    f.coordinator.on_credential_issued(&credential);
    f.coordinator.on_credential_confirmed(&subject("u1"));
    assert!(
        f.coordinator
            .wait_for_auth_ready(&subject("u1"), Duration::from_secs(1))
            .await
    );
    assert_eq!(
        f.coordinator.phase(&subject("u1")),
        SessionPhase::Ready { degraded: false }
    );

    f.coordinator.on_signed_out(&subject("u1"));
    assert_eq!(f.coordinator.phase(&subject("u1")), SessionPhase::SignedOut);

    let credential = f.provider.sign_in("u1");
    f.coordinator.on_credential_issued(&credential);
    assert_eq!(
        f.coordinator.phase(&subject("u1")),
        SessionPhase::Authenticating
    );
    Ok(())
}

/// Tests that a timed-out wait can still proceed in degraded mode.
#[tokio::test(start_paused = true)]
async fn test_degraded_readiness() -> anyhow::Result<()> {
    let f = fixture(Duration::from_secs(3600))?;
    let credential = f.provider.sign_in("u1");
    f.coordinator.on_credential_issued(&credential);
    f.coordinator.on_credential_confirmed(&subject("u1"));

    let ready = f
        .coordinator
        .wait_for_auth_ready(&subject("u1"), Duration::from_secs(2))
        .await;
    assert!(!ready);

    let err = f
        .coordinator
        .ensure_auth_ready(&subject("u1"), Duration::from_secs(1))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinationError::ReadinessTimeout { .. }));

    f.coordinator.proceed_degraded(&subject("u1"));
    assert_eq!(
        f.coordinator.phase(&subject("u1")),
        SessionPhase::Ready { degraded: true }
    );

    f.store.set_propagation(Duration::ZERO);
    assert!(
        f.coordinator
            .wait_for_auth_ready(&subject("u1"), Duration::from_secs(1))
            .await
    );
    assert_eq!(
        f.coordinator.phase(&subject("u1")),
        SessionPhase::Ready { degraded: false }
    );
    Ok(())
}

/// Tests that a terminal failure is returned after one invocation.
#[tokio::test(start_paused = true)]
async fn test_terminal_failure_through_facade() -> anyhow::Result<()> {
    let f = fixture(Duration::ZERO)?;
    let credential = f.provider.sign_in("u1");
    f.coordinator.on_credential_issued(&credential);

    let calls = AtomicU32::new(0);
    let result: Result<(), _> = f
        .coordinator
        .run_with_coordinated_retry(
            &subject("u1"),
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(StoreError::invalid_credentials("token revoked")) }
            },
            4,
        )
        .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(result.unwrap_err().kind(), authcoord::ErrorKind::Terminal);
    Ok(())
}

/// Tests brute-force protection around the login entry point.
#[tokio::test]
async fn test_guarded_login_blocks_after_failures() -> anyhow::Result<()> {
    let clock = Arc::new(ManualClock::new());
    let provider = Arc::new(FakeProvider::new());
    let store = Arc::new(FakeStore::with_propagation(Duration::ZERO));
    let coordinator = AuthCoordinator::with_clock(
        CoordinatorConfig::default(),
        provider,
        store,
        clock.clone(),
    )?;

    let attempts = AtomicU32::new(0);
    let bad_login = || {
        attempts.fetch_add(1, Ordering::SeqCst);
        async { Err::<Credential, _>(StoreError::invalid_credentials("wrong password")) }
    };

    for _ in 0..5 {
        let err = coordinator
            .guard_auth_operation("alice@example.com", operation::LOGIN, bad_login)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::Terminal { .. }));
    }

    let err = coordinator
        .guard_auth_operation("alice@example.com", operation::LOGIN, bad_login)
        .await
        .unwrap_err();
    match err {
        CoordinationError::RateLimited { retry_after, .. } => {
            assert_eq!(retry_after, Duration::from_secs(30 * 60));
        }
        other => panic!("expected rate limit, got {other:?}"),
    }
    assert_eq!(attempts.load(Ordering::SeqCst), 5);

    // Other requesters are unaffected.
    assert!(
        coordinator
            .is_operation_allowed("bob@example.com", operation::LOGIN)
            .allowed
    );

    clock.advance(Duration::from_secs(31 * 60));
    let ok = coordinator
        .guard_auth_operation("alice@example.com", operation::LOGIN, || async {
            Ok::<_, StoreError>("session")
        })
        .await;
    assert_eq!(ok, Ok("session"));
    assert_eq!(
        coordinator
            .rate_limiter()
            .remaining_attempts("alice@example.com", operation::LOGIN),
        5
    );
    Ok(())
}

/// Tests that rate limit records survive sign-out unless configured otherwise.
#[tokio::test(start_paused = true)]
async fn test_sign_out_keeps_rate_limits_by_default() -> anyhow::Result<()> {
    for reset_on_sign_out in [false, true] {
        let provider = Arc::new(FakeProvider::new());
        let store = Arc::new(FakeStore::with_propagation(Duration::ZERO));
        let mut config = CoordinatorConfig::default();
        config.rate_limit.reset_on_sign_out = reset_on_sign_out;
        let coordinator = AuthCoordinator::new(config, provider.clone(), store)?;

        let credential = provider.sign_in("u1");
        coordinator.on_credential_issued(&credential);
        coordinator.is_operation_allowed("u1", operation::TOKEN_CHECK);
        coordinator.on_signed_out(&subject("u1"));

        let remaining = coordinator
            .rate_limiter()
            .remaining_attempts("u1", operation::TOKEN_CHECK);
        assert_eq!(remaining, if reset_on_sign_out { 10 } else { 9 });
    }
    Ok(())
}

async fn default_wait(config: CoordinatorConfig) -> anyhow::Result<(bool, Duration)> {
    let provider = Arc::new(FakeProvider::new());
    let store = Arc::new(FakeStore::with_propagation(Duration::from_secs(3600)));
    let coordinator = AuthCoordinator::new(config, provider.clone(), store)?;
    let credential = provider.sign_in("u1");
    coordinator.on_credential_issued(&credential);
    coordinator.on_credential_confirmed(&subject("u1"));

    let started = tokio::time::Instant::now();
    let ready = coordinator.wait_for_auth_ready_default(&subject("u1")).await;
    Ok((ready, started.elapsed()))
}

/// Tests that the default readiness wait follows the configured timeout,
/// including an environment override.
#[tokio::test(start_paused = true)]
#[serial]
async fn test_default_wait_uses_configured_timeout() -> anyhow::Result<()> {
    let (ready, waited) = default_wait(CoordinatorConfig::default()).await?;
    assert!(!ready);
    assert!(waited >= Duration::from_secs(5));

    unsafe {
        std::env::set_var(ENV_READINESS_TIMEOUT, "1s");
    }
    let mut config = CoordinatorConfig::default();
    let applied = config.apply_env_overrides();
    unsafe {
        std::env::remove_var(ENV_READINESS_TIMEOUT);
    }
    applied?;

    let (ready, waited) = default_wait(config).await?;
    assert!(!ready);
    assert!(waited >= Duration::from_secs(1));
    assert!(waited < Duration::from_secs(5));
    Ok(())
}
