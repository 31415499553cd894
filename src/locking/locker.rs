use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::config::LockConfig;
use crate::storage::{
    Entry, KeyColumnValueStore, KeySliceQuery, StoreError, StoreManager, StoreTransaction,
};
use crate::time::{Resolution, SystemTimestamps, TimestampProvider};
use crate::types::{Column, Key, OwnerId, Timestamp};

use super::cleaner::{LockCleanerService, StandardLockCleanerService};
use super::codec::{self, LOCK_COL_END, LOCK_COL_START, LOCK_VALUE, LockCoordinate, TimestampRid};
use super::error::LockingError;
use super::mediator::{LocalLockMediator, LocalLockMediators};
use super::metrics::{LockMetrics, LockOperation};
use super::state::{LockStatus, LockerState};

const DEFAULT_LOCK_WAIT: Duration = Duration::from_millis(100);
const DEFAULT_LOCK_EXPIRE: Duration = Duration::from_secs(300);
const DEFAULT_RETRY_COUNT: u32 = 3;

/// Acquires, verifies and releases locks on behalf of one transaction.
///
/// The caller owns the [`LockerState`] and passes it in on every call, so a
/// locker can be shared freely between transactions.
#[async_trait]
pub trait Locker: Send + Sync + fmt::Debug {
    /// Writes a claim on `coordinate`. A coordinate already present in `state`
    /// is left alone.
    async fn write_lock(
        &self,
        coordinate: &LockCoordinate,
        state: &mut LockerState,
        txn: &dyn StoreTransaction,
    ) -> Result<(), LockingError>;

    /// Verifies every unchecked claim in `state` against the lock store.
    async fn check_locks(
        &self,
        state: &mut LockerState,
        txn: &dyn StoreTransaction,
    ) -> Result<(), LockingError>;

    /// Releases every claim in `state`. Never fails; problems are logged.
    async fn delete_locks(&self, state: &mut LockerState, txn: &dyn StoreTransaction);
}

/// Outcome of one claim write, kept between attempts so the next attempt can
/// replace the previous column.
struct WriteAttempt {
    started: Timestamp,
    elapsed: u64,
    column: Column,
    outcome: Result<(), StoreError>,
}

/// Locker that writes timestamped claims into a key-consistent lock store and
/// resolves contention by seniority.
pub struct ConsistentKeyLocker {
    store: Arc<dyn KeyColumnValueStore>,
    manager: Arc<dyn StoreManager>,
    owner: OwnerId,
    times: Arc<dyn TimestampProvider>,
    mediator: Arc<LocalLockMediator>,
    metrics: Arc<LockMetrics>,
    lock_wait: u64,
    lock_expire: Duration,
    retry_count: u32,
    cleaner: Option<Arc<dyn LockCleanerService>>,
}

impl fmt::Debug for ConsistentKeyLocker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsistentKeyLocker")
            .field("store", &self.store.name())
            .field("owner", &self.owner)
            .field("lock_wait", &self.lock_wait)
            .field("lock_expire", &self.lock_expire)
            .field("retry_count", &self.retry_count)
            .field("cleaner", &self.cleaner)
            .finish_non_exhaustive()
    }
}

impl ConsistentKeyLocker {
    pub fn builder(
        store: Arc<dyn KeyColumnValueStore>,
        manager: Arc<dyn StoreManager>,
    ) -> ConsistentKeyLockerBuilder {
        ConsistentKeyLockerBuilder::new(store, manager)
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn mediator(&self) -> &Arc<LocalLockMediator> {
        &self.mediator
    }

    pub fn metrics(&self) -> &Arc<LockMetrics> {
        &self.metrics
    }

    /// Waits for background cleanup requested so far.
    pub async fn drain_cleaner(&self) {
        if let Some(cleaner) = &self.cleaner {
            cleaner.drain().await;
        }
    }

    fn expire_ticks(&self) -> u64 {
        self.times.ticks(self.lock_expire)
    }

    /// Writes a claim on `coordinate`, retrying slow or temporarily failed writes.
    pub async fn write_single_lock(
        &self,
        coordinate: &LockCoordinate,
        txn: &dyn StoreTransaction,
    ) -> Result<LockStatus, LockingError> {
        let key = codec::lock_key(coordinate)?;
        let mut previous: Option<Column> = None;

        for attempt in 0..self.retry_count {
            let written = self
                .try_write_lock_once(&key, previous.as_ref(), txn)
                .await;
            match written.outcome {
                Ok(()) if written.elapsed <= self.lock_wait => {
                    let expires = written.started.saturating_add(self.expire_ticks());
                    return Ok(LockStatus::new(written.started, expires));
                }
                Ok(()) => {
                    warn!(
                        %coordinate,
                        attempt,
                        elapsed = written.elapsed,
                        limit = self.lock_wait,
                        "lock write succeeded but took too long"
                    );
                }
                Err(err @ StoreError::Temporary(_)) => {
                    warn!(%coordinate, attempt, error = %err, "temporary failure during lock write");
                }
                Err(err) => {
                    error!(%coordinate, attempt, error = %err, "fatal failure during lock write");
                    if let Err(delete) = self
                        .try_delete_lock_once(&key, &written.column, txn)
                        .await
                    {
                        warn!(
                            %coordinate,
                            error = %delete,
                            "failed to delete lock write; abandoning potentially unreleased lock"
                        );
                    }
                    return Err(err.into());
                }
            }
            previous = Some(written.column);
        }

        if let Some(column) = previous
            && let Err(err) = self.try_delete_lock_once(&key, &column, txn).await
        {
            warn!(%coordinate, error = %err, "failed to delete last lock write after exhausting retries");
        }
        Err(LockingError::Temporary(format!(
            "lock write retry count ({}) exceeded on {coordinate}",
            self.retry_count
        )))
    }

    async fn try_write_lock_once(
        &self,
        key: &Key,
        previous: Option<&Column>,
        txn: &dyn StoreTransaction,
    ) -> WriteAttempt {
        let started = self.times.now();
        let column = codec::lock_column(started, &self.owner);
        let additions = vec![Entry::new(column.clone(), LOCK_VALUE)];
        let deletions = previous.cloned().into_iter().collect();
        let outcome = self
            .mutate_at(key, additions, deletions, started, txn)
            .await;
        if let Err(err) = &outcome {
            debug!(error = %err, "lock write attempt failed");
        }
        WriteAttempt {
            started,
            elapsed: self.times.now().saturating_sub(started),
            column,
            outcome,
        }
    }

    async fn try_delete_lock_once(
        &self,
        key: &Key,
        column: &Column,
        txn: &dyn StoreTransaction,
    ) -> Result<(), StoreError> {
        self.mutate_at(key, Vec::new(), vec![column.clone()], self.times.now(), txn)
            .await
    }

    /// Mutates the lock store in a fresh transaction stamped with `commit_time`.
    async fn mutate_at(
        &self,
        key: &Key,
        additions: Vec<Entry>,
        deletions: Vec<Column>,
        commit_time: Timestamp,
        txn: &dyn StoreTransaction,
    ) -> Result<(), StoreError> {
        let config = txn.config().clone().with_commit_time(commit_time);
        let stamped = self.manager.begin_transaction(config).await?;
        let result = match self
            .store
            .mutate(key, additions, deletions, stamped.as_ref())
            .await
        {
            Ok(()) => stamped.commit().await,
            Err(err) => Err(err),
        };
        if result.is_err()
            && let Err(err) = stamped.rollback().await
        {
            error!(txn = %stamped.id(), error = %err, "failed to roll back lock transaction; it may be leaked");
        }
        result
    }

    /// Verifies that our claim on `coordinate` is the senior live claim.
    pub async fn check_single_lock(
        &self,
        coordinate: &LockCoordinate,
        status: &mut LockStatus,
        txn: &dyn StoreTransaction,
    ) -> Result<(), LockingError> {
        if status.is_checked() {
            return Ok(());
        }

        let now = self
            .times
            .sleep_past(status.write_timestamp().saturating_add(self.lock_wait))
            .await;

        let query = KeySliceQuery::new(codec::lock_key(coordinate)?, LOCK_COL_START, LOCK_COL_END);
        let entries = self.get_slice_with_retries(coordinate, &query, txn).await?;

        let cutoff = now.saturating_sub(self.expire_ticks());
        let mut live = Vec::with_capacity(entries.len());
        for entry in entries {
            let claim = codec::decode_lock_column(&entry.column)?;
            if claim.timestamp < cutoff {
                warn!(%coordinate, timestamp = claim.timestamp, cutoff, "discarded expired claim");
                if let Some(cleaner) = &self.cleaner {
                    cleaner.clean(coordinate, cutoff, txn);
                }
                if self.owner.matches(&claim.rid) && claim.timestamp == status.write_timestamp() {
                    return Err(LockingError::Expired {
                        coordinate: coordinate.clone(),
                        timestamp: claim.timestamp,
                        expire: self.lock_expire,
                    });
                }
                continue;
            }
            live.push(claim);
        }

        self.check_seniority(coordinate, status, &live)?;
        status.set_checked();
        Ok(())
    }

    async fn get_slice_with_retries(
        &self,
        coordinate: &LockCoordinate,
        query: &KeySliceQuery,
        txn: &dyn StoreTransaction,
    ) -> Result<Vec<Entry>, LockingError> {
        for attempt in 0..self.retry_count {
            match self.store.get_slice(query, txn).await {
                Ok(entries) => return Ok(entries),
                Err(err @ StoreError::Permanent(_)) => {
                    error!(%coordinate, error = %err, "failed to check locks");
                    return Err(LockingError::Permanent(format!(
                        "failed to check locks on {coordinate}: {err}"
                    )));
                }
                Err(err) => {
                    warn!(%coordinate, attempt, error = %err, "temporary storage failure while checking locks");
                }
            }
        }
        Err(LockingError::Temporary(format!(
            "maximum retries ({}) exceeded while checking locks on {coordinate}",
            self.retry_count
        )))
    }

    /// Walks live claims in store order; the first foreign claim wins over ours.
    fn check_seniority(
        &self,
        coordinate: &LockCoordinate,
        status: &LockStatus,
        claims: &[TimestampRid],
    ) -> Result<(), LockingError> {
        for claim in claims {
            if !self.owner.matches(&claim.rid) {
                let message = format!(
                    "lock on {coordinate} already held by {} (we are {})",
                    claim.rid_display(),
                    self.owner
                );
                debug!("{message}");
                return Err(LockingError::Temporary(message));
            }
            if claim.timestamp == status.write_timestamp() {
                debug!(%coordinate, "checked lock");
                return Ok(());
            }
            warn!(
                %coordinate,
                rid = %self.owner,
                actual = claim.timestamp,
                expected = status.write_timestamp(),
                "skipping outdated lock with our rid but mismatched timestamp"
            );
        }

        if claims.is_empty() {
            Err(LockingError::Temporary(format!(
                "no lock columns found for {coordinate}"
            )))
        } else {
            Err(LockingError::Permanent(format!(
                "read {} locks with our rid {} but mismatched timestamps; \
                 no lock column contained our timestamp ({})",
                claims.len(),
                self.owner,
                status.write_timestamp()
            )))
        }
    }

    /// Removes our claim on `coordinate`. Gives up quietly on permanent failure
    /// and returns whether the claim was deleted.
    pub async fn delete_single_lock(
        &self,
        coordinate: &LockCoordinate,
        status: &LockStatus,
        txn: &dyn StoreTransaction,
    ) -> bool {
        let key = match codec::lock_key(coordinate) {
            Ok(key) => key,
            Err(err) => {
                error!(%coordinate, error = %err, "cannot encode lock key; abandoning lock");
                return false;
            }
        };
        let column = codec::lock_column(status.write_timestamp(), &self.owner);
        for attempt in 0..self.retry_count {
            match self.try_delete_lock_once(&key, &column, txn).await {
                Ok(()) => return true,
                Err(err @ StoreError::Temporary(_)) => {
                    warn!(%coordinate, attempt, error = %err, "temporary storage failure while deleting lock");
                }
                Err(err) => {
                    error!(%coordinate, error = %err, "storage failure while deleting lock; abandoning lock");
                    return false;
                }
            }
        }
        error!(%coordinate, retries = self.retry_count, "exhausted retries while deleting lock; abandoning lock");
        false
    }

    async fn acquire(
        &self,
        coordinate: &LockCoordinate,
        state: &mut LockerState,
        txn: &dyn StoreTransaction,
    ) -> Result<(), LockingError> {
        if state.has(coordinate) {
            debug!(txn = %txn.id(), %coordinate, "transaction already wrote lock");
            return Ok(());
        }

        let holder = *txn.id();
        let provisional = self.times.now().saturating_add(self.expire_ticks());
        if !self.mediator.lock(coordinate, holder, provisional) {
            return Err(LockingError::Temporary(format!(
                "local lock contention on {coordinate}"
            )));
        }

        match self.write_single_lock(coordinate, txn).await {
            Ok(status) => {
                self.mediator
                    .lock(coordinate, holder, status.expiration_timestamp());
                state.take(coordinate.clone(), status);
                Ok(())
            }
            Err(err) => {
                self.mediator.unlock(coordinate, holder);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Locker for ConsistentKeyLocker {
    async fn write_lock(
        &self,
        coordinate: &LockCoordinate,
        state: &mut LockerState,
        txn: &dyn StoreTransaction,
    ) -> Result<(), LockingError> {
        let group = txn.config().group_name.as_deref();
        self.metrics.record_call(group, LockOperation::Write);
        let result = self.acquire(coordinate, state, txn).await;
        if result.is_err() {
            self.metrics.record_failure(group, LockOperation::Write);
        }
        result
    }

    async fn check_locks(
        &self,
        state: &mut LockerState,
        txn: &dyn StoreTransaction,
    ) -> Result<(), LockingError> {
        let group = txn.config().group_name.as_deref();
        self.metrics.record_call(group, LockOperation::Check);
        for (coordinate, status) in state.iter_mut() {
            if let Err(err) = self.check_single_lock(coordinate, status, txn).await {
                self.metrics.record_failure(group, LockOperation::Check);
                return Err(err);
            }
        }
        Ok(())
    }

    async fn delete_locks(&self, state: &mut LockerState, txn: &dyn StoreTransaction) {
        let group = txn.config().group_name.as_deref();
        self.metrics.record_call(group, LockOperation::Delete);
        let holder = *txn.id();
        for (coordinate, status) in state.drain() {
            if !self.delete_single_lock(&coordinate, &status, txn).await {
                self.metrics.record_failure(group, LockOperation::Delete);
            }
            // Local release happens whether or not the stored claim went away.
            self.mediator.unlock(&coordinate, holder);
        }
    }
}

enum CleanerChoice {
    None,
    Standard { cooldown: Duration, max_workers: usize },
    Custom(Arc<dyn LockCleanerService>),
}

/// Builder for [`ConsistentKeyLocker`].
pub struct ConsistentKeyLockerBuilder {
    store: Arc<dyn KeyColumnValueStore>,
    manager: Arc<dyn StoreManager>,
    owner: Option<OwnerId>,
    times: Option<Arc<dyn TimestampProvider>>,
    resolution: Resolution,
    mediator: Option<Arc<LocalLockMediator>>,
    mediators: Option<Arc<LocalLockMediators>>,
    metrics: Option<Arc<LockMetrics>>,
    lock_wait: Duration,
    lock_expire: Duration,
    retry_count: u32,
    cleaner: CleanerChoice,
}

impl ConsistentKeyLockerBuilder {
    pub fn new(store: Arc<dyn KeyColumnValueStore>, manager: Arc<dyn StoreManager>) -> Self {
        Self {
            store,
            manager,
            owner: None,
            times: None,
            resolution: Resolution::default(),
            mediator: None,
            mediators: None,
            metrics: None,
            lock_wait: DEFAULT_LOCK_WAIT,
            lock_expire: DEFAULT_LOCK_EXPIRE,
            retry_count: DEFAULT_RETRY_COUNT,
            cleaner: CleanerChoice::None,
        }
    }

    /// Applies every locker setting found in `config`.
    pub fn from_config(self, config: &LockConfig) -> Self {
        let mut builder = self
            .owner(config.owner_id.clone())
            .lock_wait(config.lock_wait())
            .lock_expire(config.lock_expire())
            .lock_retry_count(config.lock_retry_count);
        builder.resolution = config.timestamp_resolution;
        if config.clean_expired {
            builder = builder.standard_cleaner(config.cleaner_cooldown(), config.cleaner_max_workers);
        }
        builder
    }

    pub fn owner(mut self, owner: OwnerId) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn times(mut self, times: Arc<dyn TimestampProvider>) -> Self {
        self.times = Some(times);
        self
    }

    /// Uses `mediator` as is. Takes precedence over [`Self::mediators`].
    pub fn mediator(mut self, mediator: Arc<LocalLockMediator>) -> Self {
        self.mediator = Some(mediator);
        self
    }

    /// Takes the mediator for the lock store's name from the process registry.
    pub fn mediators(mut self, mediators: Arc<LocalLockMediators>) -> Self {
        self.mediators = Some(mediators);
        self
    }

    pub fn metrics(mut self, metrics: Arc<LockMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn lock_wait(mut self, wait: Duration) -> Self {
        self.lock_wait = wait;
        self
    }

    pub fn lock_expire(mut self, expire: Duration) -> Self {
        self.lock_expire = expire;
        self
    }

    /// Attempts per write, read and delete. Values below one are raised to one.
    pub fn lock_retry_count(mut self, count: u32) -> Self {
        self.retry_count = count.max(1);
        self
    }

    pub fn standard_cleaner(mut self, cooldown: Duration, max_workers: usize) -> Self {
        self.cleaner = CleanerChoice::Standard {
            cooldown,
            max_workers,
        };
        self
    }

    pub fn custom_cleaner(mut self, cleaner: Arc<dyn LockCleanerService>) -> Self {
        self.cleaner = CleanerChoice::Custom(cleaner);
        self
    }

    pub fn no_cleaner(mut self) -> Self {
        self.cleaner = CleanerChoice::None;
        self
    }

    pub fn build(self) -> ConsistentKeyLocker {
        let times = self
            .times
            .unwrap_or_else(|| SystemTimestamps::shared(self.resolution));
        let mediator = match (self.mediator, &self.mediators) {
            (Some(mediator), _) => mediator,
            (None, Some(mediators)) => mediators.get(self.store.name(), times.clone()),
            (None, None) => Arc::new(LocalLockMediator::new(self.store.name(), times.clone())),
        };
        let cleaner: Option<Arc<dyn LockCleanerService>> = match self.cleaner {
            CleanerChoice::None => None,
            CleanerChoice::Standard {
                cooldown,
                max_workers,
            } => Some(Arc::new(StandardLockCleanerService::new(
                self.store.clone(),
                self.manager.clone(),
                times.clone(),
                cooldown,
                max_workers,
            ))),
            CleanerChoice::Custom(cleaner) => Some(cleaner),
        };

        ConsistentKeyLocker {
            lock_wait: times.ticks(self.lock_wait),
            owner: self.owner.unwrap_or_else(OwnerId::random),
            store: self.store,
            manager: self.manager,
            times,
            mediator,
            metrics: self.metrics.unwrap_or_default(),
            lock_expire: self.lock_expire,
            retry_count: self.retry_count,
            cleaner,
        }
    }
}
