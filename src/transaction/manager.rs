use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::LockConfig;
use crate::locking::{ConsistentKeyLocker, LocalLockMediators, LockMetrics};
use crate::storage::{Consistency, StoreError, StoreManager, TransactionConfig};
use crate::time::TimestampProvider;

use super::store::ExpectedValueCheckingStore;
use super::txn::ExpectedValueCheckingTransaction;

/// Appended to a data store name to name its lock store.
pub const LOCK_STORE_SUFFIX: &str = "_lock_";

/// Store manager whose stores support locks with expected values.
///
/// Managers of one process must be built over the same [`LocalLockMediators`]
/// so their lockers arbitrate locally before touching the lock store.
pub struct ExpectedValueCheckingStoreManager {
    manager: Arc<dyn StoreManager>,
    config: LockConfig,
    times: Arc<dyn TimestampProvider>,
    mediators: Arc<LocalLockMediators>,
    metrics: Arc<LockMetrics>,
    stores: DashMap<String, Arc<ExpectedValueCheckingStore>>,
}

impl fmt::Debug for ExpectedValueCheckingStoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedValueCheckingStoreManager")
            .field("owner", &self.config.owner_id)
            .field("stores", &self.stores.len())
            .finish_non_exhaustive()
    }
}

impl ExpectedValueCheckingStoreManager {
    pub fn new(
        manager: Arc<dyn StoreManager>,
        config: LockConfig,
        times: Arc<dyn TimestampProvider>,
        mediators: Arc<LocalLockMediators>,
    ) -> Self {
        Self {
            manager,
            config,
            times,
            mediators,
            metrics: Arc::new(LockMetrics::new()),
            stores: DashMap::new(),
        }
    }

    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    /// Lock call counters shared by every store this manager opened.
    pub fn lock_metrics(&self) -> &Arc<LockMetrics> {
        &self.metrics
    }

    /// Opens `name` together with its lock store. Repeated calls return the
    /// same decorator.
    pub async fn open_store(&self, name: &str) -> Result<Arc<ExpectedValueCheckingStore>, StoreError> {
        if let Some(store) = self.stores.get(name) {
            return Ok(store.value().clone());
        }

        let data = self.manager.open_store(name).await?;
        let lock_store = self
            .manager
            .open_store(&format!("{name}{LOCK_STORE_SUFFIX}"))
            .await?;
        let locker = ConsistentKeyLocker::builder(lock_store, self.manager.clone())
            .from_config(&self.config)
            .times(self.times.clone())
            .mediators(self.mediators.clone())
            .metrics(self.metrics.clone())
            .build();
        debug!(store = name, owner = %self.config.owner_id, "opened expected value checking store");

        let store = Arc::new(ExpectedValueCheckingStore::new(data, Arc::new(locker)));
        Ok(self
            .stores
            .entry(name.to_owned())
            .or_insert(store)
            .value()
            .clone())
    }

    /// Begins a plain transaction and a key-consistent companion for locking.
    pub async fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> Result<ExpectedValueCheckingTransaction, StoreError> {
        let inconsistent = self.manager.begin_transaction(config.clone()).await?;
        let strong_config = config.with_consistency(Consistency::KeyConsistent);
        let strong = match self.manager.begin_transaction(strong_config).await {
            Ok(strong) => strong,
            Err(err) => {
                if let Err(rollback) = inconsistent.rollback().await {
                    warn!(txn = %inconsistent.id(), error = %rollback, "failed to roll back transaction");
                }
                return Err(err);
            }
        };
        Ok(ExpectedValueCheckingTransaction::new(
            inconsistent,
            strong,
            self.config.max_read_time(),
            self.times.clone(),
        ))
    }
}
