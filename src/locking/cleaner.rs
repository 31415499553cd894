use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::runtime::Handle;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::storage::{
    KeyColumnValueStore, KeySliceQuery, StoreManager, StoreTransaction, TransactionConfig,
};
use crate::time::TimestampProvider;
use crate::types::{Key, Timestamp};

use super::codec::{self, LOCK_COL_END, LOCK_COL_START, LockCoordinate};
use super::error::LockingError;

/// Entries past this count make expired cooldowns eligible for a sweep, at
/// most once per cooldown window.
const SWEEP_THRESHOLD: usize = 1024;

/// Receives expired claims observed while checking locks.
#[async_trait]
pub trait LockCleanerService: Send + Sync + fmt::Debug {
    /// Requests deletion of every claim on `coordinate` older than `cutoff`.
    /// Must not block on the deletion itself.
    fn clean(&self, coordinate: &LockCoordinate, cutoff: Timestamp, txn: &dyn StoreTransaction);

    /// Waits for every cleanup requested so far to finish.
    async fn drain(&self) {}
}

/// Remembers recently enqueued coordinates for a fixed cooldown window.
#[derive(Debug)]
pub struct CooldownCache {
    entries: DashMap<LockCoordinate, Timestamp>,
    cooldown: u64,
    last_sweep: AtomicU64,
    times: Arc<dyn TimestampProvider>,
}

impl CooldownCache {
    pub fn new(cooldown: Duration, times: Arc<dyn TimestampProvider>) -> Self {
        Self {
            entries: DashMap::new(),
            cooldown: times.ticks(cooldown),
            last_sweep: AtomicU64::new(times.now()),
            times,
        }
    }

    /// Returns `true` for the first caller per coordinate per cooldown window.
    pub fn try_insert(&self, coordinate: &LockCoordinate) -> bool {
        let now = self.times.now();
        let inserted = match self.entries.entry(coordinate.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
            Entry::Occupied(mut occupied) => {
                if now.saturating_sub(*occupied.get()) >= self.cooldown {
                    occupied.insert(now);
                    true
                } else {
                    false
                }
            }
        };
        if self.entries.len() > SWEEP_THRESHOLD {
            self.maybe_sweep(now);
        }
        inserted
    }

    /// Drops expired entries unless another sweep ran within the last window.
    fn maybe_sweep(&self, now: Timestamp) {
        let last = self.last_sweep.load(Ordering::Acquire);
        if now.saturating_sub(last) < self.cooldown {
            return;
        }
        if self
            .last_sweep
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.entries
            .retain(|_, inserted_at| now.saturating_sub(*inserted_at) < self.cooldown);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Deletes expired claims from a lock store on a small pool of tokio tasks.
///
/// At most one task per coordinate is enqueued per cooldown window. Tasks are
/// aborted if the service is dropped while they are still running.
pub struct StandardLockCleanerService {
    store: Arc<dyn KeyColumnValueStore>,
    manager: Arc<dyn StoreManager>,
    times: Arc<dyn TimestampProvider>,
    blocked: CooldownCache,
    workers: Arc<Semaphore>,
    tasks: Mutex<JoinSet<()>>,
}

impl fmt::Debug for StandardLockCleanerService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardLockCleanerService")
            .field("store", &self.store.name())
            .field("blocked", &self.blocked.len())
            .finish_non_exhaustive()
    }
}

impl StandardLockCleanerService {
    pub fn new(
        store: Arc<dyn KeyColumnValueStore>,
        manager: Arc<dyn StoreManager>,
        times: Arc<dyn TimestampProvider>,
        cooldown: Duration,
        max_workers: usize,
    ) -> Self {
        Self {
            store,
            manager,
            blocked: CooldownCache::new(cooldown, times.clone()),
            times,
            workers: Arc::new(Semaphore::new(max_workers.max(1))),
            tasks: Mutex::new(JoinSet::new()),
        }
    }
}

#[async_trait]
impl LockCleanerService for StandardLockCleanerService {
    fn clean(&self, coordinate: &LockCoordinate, cutoff: Timestamp, txn: &dyn StoreTransaction) {
        if !self.blocked.try_insert(coordinate) {
            debug!(%coordinate, cutoff, txn = %txn.id(), "blocked redundant attempt to enqueue lock cleaner task");
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            warn!(%coordinate, cutoff, "no async runtime available; dropping expired lock cleaner task");
            return;
        };

        info!(%coordinate, cutoff, txn = %txn.id(), "enqueuing expired lock cleaner task");
        let task = CleanupTask {
            store: self.store.clone(),
            manager: self.manager.clone(),
            times: self.times.clone(),
            coordinate: coordinate.clone(),
            cutoff,
            config: txn.config().clone(),
        };
        let workers = self.workers.clone();

        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        while tasks.try_join_next().is_some() {}
        tasks.spawn_on(
            async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    return;
                };
                task.run().await;
            },
            &runtime,
        );
    }

    async fn drain(&self) {
        let mut tasks = {
            let mut guard = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *guard)
        };
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                warn!(error = %err, "expired lock cleaner task did not complete");
            }
        }
    }
}

struct CleanupTask {
    store: Arc<dyn KeyColumnValueStore>,
    manager: Arc<dyn StoreManager>,
    times: Arc<dyn TimestampProvider>,
    coordinate: LockCoordinate,
    cutoff: Timestamp,
    config: TransactionConfig,
}

impl CleanupTask {
    async fn run(self) {
        match self.clean_expired().await {
            Ok(0) => debug!(coordinate = %self.coordinate, "no expired claims left to delete"),
            Ok(deleted) => {
                debug!(coordinate = %self.coordinate, deleted, "expired lock cleaner finished")
            }
            Err(err) => {
                warn!(coordinate = %self.coordinate, error = %err, "expired lock cleaner failed")
            }
        }
    }

    async fn clean_expired(&self) -> Result<usize, LockingError> {
        let key = codec::lock_key(&self.coordinate)?;
        let config = self.config.clone().with_commit_time(self.times.now());
        let txn = self.manager.begin_transaction(config).await?;
        match self.delete_expired(&key, txn.as_ref()).await {
            Ok(deleted) => {
                txn.commit().await?;
                Ok(deleted)
            }
            Err(err) => {
                if let Err(rollback) = txn.rollback().await {
                    warn!(txn = %txn.id(), error = %rollback, "failed to roll back cleaner transaction");
                }
                Err(err)
            }
        }
    }

    async fn delete_expired(
        &self,
        key: &Key,
        txn: &dyn StoreTransaction,
    ) -> Result<usize, LockingError> {
        let query = KeySliceQuery::new(key.clone(), LOCK_COL_START, LOCK_COL_END);
        let claims = self.store.get_slice(&query, txn).await?;

        let mut deletions = Vec::new();
        for entry in claims {
            let claim = codec::decode_lock_column(&entry.column)?;
            if claim.timestamp < self.cutoff {
                info!(
                    coordinate = %self.coordinate,
                    rid = %claim.rid_display(),
                    timestamp = claim.timestamp,
                    cutoff = self.cutoff,
                    "deleting expired lock"
                );
                deletions.push(entry.column);
            } else {
                debug!(
                    coordinate = %self.coordinate,
                    rid = %claim.rid_display(),
                    timestamp = claim.timestamp,
                    cutoff = self.cutoff,
                    "ignoring lock newer than cutoff"
                );
            }
        }

        let deleted = deletions.len();
        if deleted > 0 {
            self.store.mutate(key, Vec::new(), deletions, txn).await?;
        }
        Ok(deleted)
    }
}
