use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use kcvlock::storage::{Entry, InMemoryStoreManager, StoreManager, TransactionConfig};
use kcvlock::{
    ExpectedValueCheckingStoreManager, LocalLockMediators, LockConfig, LockCoordinate,
    SystemTimestamps,
};

const STORE: &str = "accounts";

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    // Both simulated processes share one backend but carry their own owner id
    // and their own local mediators.
    let backend: Arc<dyn StoreManager> = Arc::new(InMemoryStoreManager::new());
    let alice = process(&backend, "alice");
    let bob = process(&backend, "bob");

    let coordinate = LockCoordinate::new(b"account-42".to_vec(), b"balance".to_vec());

    let alice_store = alice.open_store(STORE).await?;
    let bob_store = bob.open_store(STORE).await?;
    let mut alice_txn = alice.begin_transaction(TransactionConfig::default()).await?;
    let mut bob_txn = bob.begin_transaction(TransactionConfig::default()).await?;

    alice_store
        .acquire_lock(coordinate.clone(), None, &mut alice_txn)
        .await?;
    bob_store
        .acquire_lock(coordinate.clone(), None, &mut bob_txn)
        .await?;
    info!(%coordinate, "both processes wrote a claim");

    let balance = vec![Entry::new(coordinate.column.clone(), b"100".to_vec())];
    match alice_store
        .mutate(&coordinate.key, balance.clone(), Vec::new(), &mut alice_txn)
        .await
    {
        Ok(()) => info!(owner = "alice", "won the lock and wrote the balance"),
        Err(err) => warn!(owner = "alice", error = %err, "lost the lock"),
    }
    match bob_store
        .mutate(&coordinate.key, balance, Vec::new(), &mut bob_txn)
        .await
    {
        Ok(()) => info!(owner = "bob", "won the lock and wrote the balance"),
        Err(err) => warn!(owner = "bob", error = %err, "lost the lock"),
    }

    alice_txn.commit().await?;
    bob_txn.rollback().await?;
    info!("done");
    Ok(())
}

fn process(backend: &Arc<dyn StoreManager>, owner: &str) -> ExpectedValueCheckingStoreManager {
    let config = LockConfig::new(owner);
    let times = SystemTimestamps::shared(config.timestamp_resolution);
    let mediators = Arc::new(LocalLockMediators::new());
    ExpectedValueCheckingStoreManager::new(backend.clone(), config, times, mediators)
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
