//! Replays a sign-in against in-memory collaborators and prints what the
//! coordinator decided. Handy for tuning readiness and rate limit settings.
//!
//! ```text
//! cargo run --features sim --bin authcoord_sim -- --propagation 800ms --login-attempts 7
//! ```

use async_trait::async_trait;
use authcoord::logging::{self, LogFormat};
use authcoord::rate_limit::operation;
use authcoord::{
    AccessProbe, AuthCoordinator, CoordinatorConfig, Credential, IdentityProvider, StoreError,
    SubjectId,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

#[derive(Debug, Parser)]
#[command(name = "authcoord_sim", about = "Simulate sign-in coordination")]
struct Args {
    /// YAML config file
    #[arg(long, env = "AUTHCOORD_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,

    /// Simulated credential propagation delay
    #[arg(long, default_value = "600ms", value_parser = humantime::parse_duration)]
    propagation: Duration,

    /// Failed login attempts to replay before the successful one
    #[arg(long, default_value_t = 6)]
    login_attempts: u32,

    /// Components loading the profile concurrently after sign-in
    #[arg(long, default_value_t = 5)]
    readers: usize,
}

struct SimProvider {
    tx: watch::Sender<Option<Credential>>,
}

#[async_trait]
impl IdentityProvider for SimProvider {
    async fn current_credential(&self) -> Option<Credential> {
        self.tx.borrow().clone()
    }

    async fn refresh_credential(&self, _force: bool) -> Result<Credential, StoreError> {
        self.tx
            .borrow()
            .clone()
            .ok_or_else(|| StoreError::invalid_credentials("signed out"))
    }

    fn subscribe(&self) -> watch::Receiver<Option<Credential>> {
        self.tx.subscribe()
    }
}

struct SimStore {
    propagation: Duration,
}

impl SimStore {
    fn read(&self, credential: &Credential) -> Result<(), StoreError> {
        if credential.issued_at.elapsed() < self.propagation {
            Err(StoreError::permission_denied("credential not yet recognized"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl AccessProbe for SimStore {
    async fn check_access(&self, credential: &Credential) -> Result<(), StoreError> {
        self.read(credential)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    logging::init(args.log_format)?;

    let config = match &args.config {
        Some(path) => CoordinatorConfig::load(path)?,
        None => {
            let mut config = CoordinatorConfig::default();
            config.apply_env_overrides()?;
            config
        }
    };

    let (tx, _) = watch::channel(None);
    let provider = Arc::new(SimProvider { tx });
    let store = Arc::new(SimStore {
        propagation: args.propagation,
    });
    let coordinator = Arc::new(AuthCoordinator::new(
        config,
        provider.clone(),
        store.clone(),
    )?);
    let sweeper = coordinator.spawn_sweeper();
    let listener = coordinator.watch_identity(provider.clone());

    // Brute-force replay against the login entry point.
    let identifier = "alice@example.com";
    for attempt in 1..=args.login_attempts {
        let result = coordinator
            .guard_auth_operation(identifier, operation::LOGIN, || async {
                Err::<(), _>(StoreError::invalid_credentials("wrong password"))
            })
            .await;
        let err = result.err().map(|e| (e.kind(), e.user_hint(), e.to_string()));
        println!("login attempt {attempt}: {}", serde_json::to_string(&err)?);
    }

    // Sign in as a different requester and load the profile from several components.
    let subject = SubjectId::from("bob");
    let credential = Credential::new(subject.clone(), "opaque-token", Instant::now());
    provider.tx.send_replace(Some(credential.clone()));

    let started = Instant::now();
    let mut loads = Vec::with_capacity(args.readers);
    for reader in 0..args.readers {
        let coordinator = Arc::clone(&coordinator);
        let store = Arc::clone(&store);
        let credential = credential.clone();
        let subject = subject.clone();
        loads.push(tokio::spawn(async move {
            let result = coordinator
                .load_shared(&subject, "profile:bob", move || {
                    let result = store.read(&credential).map(|()| "Bob's profile".to_string());
                    async move { result }
                })
                .await;
            (reader, result)
        }));
    }
    for load in loads {
        let (reader, result) = load.await?;
        println!(
            "reader {reader}: {result:?} after {:?}",
            started.elapsed()
        );
    }
    println!("phase: {:?}", coordinator.phase(&subject));

    provider.tx.send_replace(None);
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!("phase after sign-out: {:?}", coordinator.phase(&subject));

    coordinator.shutdown();
    sweeper.await?;
    listener.await?;
    Ok(())
}
