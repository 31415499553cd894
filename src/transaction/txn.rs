use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::locking::{LockCoordinate, LockerState, LockingError};
use crate::storage::retry::execute_with_retries;
use crate::storage::{KeySliceQuery, StoreTransaction, TransactionConfig};
use crate::time::TimestampProvider;
use crate::types::{TxnId, Value, display_bytes};

use super::store::LockCapability;

/// Locks and expected values taken on one store.
#[derive(Debug)]
struct StoreLocks {
    capability: Arc<dyn LockCapability>,
    state: LockerState,
    expected: BTreeMap<LockCoordinate, Option<Value>>,
}

impl StoreLocks {
    fn new(capability: Arc<dyn LockCapability>) -> Self {
        Self {
            capability,
            state: LockerState::new(),
            expected: BTreeMap::new(),
        }
    }

    fn store_expected_value(&mut self, coordinate: LockCoordinate, value: Option<Value>) {
        if let Some(kept) = self.expected.get(&coordinate) {
            debug!(
                %coordinate,
                kept = ?kept.as_deref().map(display_bytes),
                discarded = ?value.as_deref().map(display_bytes),
                "multiple expected values; keeping the first"
            );
            return;
        }
        debug!(
            store = self.capability.name(),
            %coordinate,
            value = ?value.as_deref().map(display_bytes),
            "stored expected value"
        );
        self.expected.insert(coordinate, value);
    }
}

/// Transaction handed out by [`super::ExpectedValueCheckingStoreManager`].
///
/// Pairs a plain transaction for ordinary reads and unlocked writes with a
/// key-consistent one used for lock traffic, expected-value reads and writes
/// made under locks. Not meant to be shared between tasks.
pub struct ExpectedValueCheckingTransaction {
    inconsistent: Box<dyn StoreTransaction>,
    strong: Box<dyn StoreTransaction>,
    max_read_time: Duration,
    times: Arc<dyn TimestampProvider>,
    mutation_started: bool,
    stores: BTreeMap<String, StoreLocks>,
}

impl fmt::Debug for ExpectedValueCheckingTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedValueCheckingTransaction")
            .field("inconsistent", &self.inconsistent.id())
            .field("strong", &self.strong.id())
            .field("mutation_started", &self.mutation_started)
            .field("stores", &self.stores.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExpectedValueCheckingTransaction {
    pub fn new(
        inconsistent: Box<dyn StoreTransaction>,
        strong: Box<dyn StoreTransaction>,
        max_read_time: Duration,
        times: Arc<dyn TimestampProvider>,
    ) -> Self {
        Self {
            inconsistent,
            strong,
            max_read_time,
            times,
            mutation_started: false,
            stores: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> &TxnId {
        self.inconsistent.id()
    }

    pub fn config(&self) -> &TransactionConfig {
        self.inconsistent.config()
    }

    pub fn inconsistent(&self) -> &dyn StoreTransaction {
        self.inconsistent.as_ref()
    }

    pub fn strong(&self) -> &dyn StoreTransaction {
        self.strong.as_ref()
    }

    pub fn is_mutation_started(&self) -> bool {
        self.mutation_started
    }

    /// Number of coordinates currently locked across all stores.
    pub fn lock_count(&self) -> usize {
        self.stores.values().map(|locks| locks.state.len()).sum()
    }

    pub(crate) async fn lock_and_expect(
        &mut self,
        capability: Arc<dyn LockCapability>,
        coordinate: LockCoordinate,
        expected: Option<Value>,
    ) -> Result<(), LockingError> {
        let locks = self
            .stores
            .entry(capability.name().to_owned())
            .or_insert_with(|| StoreLocks::new(capability));
        locks
            .capability
            .locker()
            .write_lock(&coordinate, &mut locks.state, self.strong.as_ref())
            .await?;
        locks.store_expected_value(coordinate, expected);
        Ok(())
    }

    /// Verifies locks and expected values once, before the first mutation.
    ///
    /// Returns whether this transaction holds any lock. A failed check leaves
    /// the transaction unprepared.
    pub async fn prepare_for_mutations(&mut self) -> Result<bool, LockingError> {
        if !self.mutation_started {
            self.check_all_locks().await?;
            self.check_all_expected_values().await?;
            self.mutation_started = true;
        }
        Ok(self.stores.values().any(|locks| !locks.expected.is_empty()))
    }

    pub async fn check_all_locks(&mut self) -> Result<(), LockingError> {
        for locks in self.stores.values_mut() {
            locks
                .capability
                .locker()
                .check_locks(&mut locks.state, self.strong.as_ref())
                .await?;
        }
        Ok(())
    }

    pub async fn check_all_expected_values(&self) -> Result<(), LockingError> {
        for locks in self.stores.values() {
            for (coordinate, expected) in &locks.expected {
                self.check_single_expected_value(
                    locks.capability.as_ref(),
                    coordinate,
                    expected.as_deref(),
                )
                .await?;
            }
        }
        Ok(())
    }

    async fn check_single_expected_value(
        &self,
        capability: &dyn LockCapability,
        coordinate: &LockCoordinate,
        expected: Option<&[u8]>,
    ) -> Result<(), LockingError> {
        let mut end = coordinate.column.clone();
        end.push(0x00);
        let query = KeySliceQuery::new(coordinate.key.clone(), coordinate.column.clone(), end);

        let store = capability.backing_store();
        let strong = self.strong.as_ref();
        let query = &query;
        let entries = execute_with_retries(
            "expected value check",
            self.max_read_time,
            self.times.as_ref(),
            move || store.get_slice(query, strong),
        )
        .await?;

        let actual: Vec<Value> = entries
            .into_iter()
            .filter(|entry| entry.column == coordinate.column)
            .map(|entry| entry.value)
            .collect();
        let matches = match expected {
            None => actual.is_empty(),
            Some(value) => actual.len() == 1 && actual[0] == value,
        };
        if matches {
            return Ok(());
        }
        Err(LockingError::ExpectedValueMismatch {
            store: capability.name().to_owned(),
            coordinate: coordinate.clone(),
            expected: expected.map(<[u8]>::to_vec),
            actual,
        })
    }

    /// Commits the data transaction, releases locks, then commits the lock
    /// transaction.
    pub async fn commit(mut self) -> Result<(), LockingError> {
        if let Err(err) = self.inconsistent.commit().await {
            self.delete_all_locks().await;
            if let Err(rollback) = self.strong.rollback().await {
                warn!(txn = %self.strong.id(), error = %rollback, "failed to roll back lock transaction");
            }
            return Err(err.into());
        }
        self.delete_all_locks().await;
        self.strong.commit().await?;
        Ok(())
    }

    /// Releases locks, then rolls back both transactions.
    pub async fn rollback(mut self) -> Result<(), LockingError> {
        self.delete_all_locks().await;
        let inconsistent = self.inconsistent.rollback().await;
        let strong = self.strong.rollback().await;
        inconsistent.and(strong).map_err(LockingError::from)
    }

    async fn delete_all_locks(&mut self) {
        for locks in self.stores.values_mut() {
            locks
                .capability
                .locker()
                .delete_locks(&mut locks.state, self.strong.as_ref())
                .await;
        }
    }
}

impl Drop for ExpectedValueCheckingTransaction {
    fn drop(&mut self) {
        let held = self.lock_count();
        if held > 0 {
            warn!(txn = %self.id(), held, "transaction dropped while holding locks; they stay until expiry");
        }
    }
}
