use std::fmt;
use std::sync::Arc;

use crate::locking::{LockCoordinate, Locker, LockingError};
use crate::storage::{Entry, KeyColumnValueStore, KeySliceQuery, StoreError};
use crate::types::{Column, Value};

use super::txn::ExpectedValueCheckingTransaction;

/// What a transaction needs from a store it took locks on.
pub trait LockCapability: Send + Sync + fmt::Debug {
    fn name(&self) -> &str;

    fn locker(&self) -> &dyn Locker;

    /// The undecorated data store expected values are read from.
    fn backing_store(&self) -> &Arc<dyn KeyColumnValueStore>;
}

/// Data store decorator that takes locks before allowing mutations.
pub struct ExpectedValueCheckingStore {
    store: Arc<dyn KeyColumnValueStore>,
    locker: Arc<dyn Locker>,
}

impl fmt::Debug for ExpectedValueCheckingStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpectedValueCheckingStore")
            .field("store", &self.store.name())
            .field("locker", &self.locker)
            .finish()
    }
}

impl ExpectedValueCheckingStore {
    pub fn new(store: Arc<dyn KeyColumnValueStore>, locker: Arc<dyn Locker>) -> Self {
        Self { store, locker }
    }

    pub fn name(&self) -> &str {
        self.store.name()
    }

    /// Locks `coordinate` and remembers `expected` as its current value.
    ///
    /// `None` asserts that the column is absent. Must precede every mutation
    /// of the transaction.
    pub async fn acquire_lock(
        self: &Arc<Self>,
        coordinate: LockCoordinate,
        expected: Option<Value>,
        txn: &mut ExpectedValueCheckingTransaction,
    ) -> Result<(), LockingError> {
        if txn.is_mutation_started() {
            return Err(LockingError::MutationStarted);
        }
        let capability: Arc<dyn LockCapability> = self.clone();
        txn.lock_and_expect(capability, coordinate, expected).await
    }

    /// Applies a mutation after the transaction's locks and expected values
    /// have been verified. Locked transactions write with strong consistency.
    pub async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Column>,
        txn: &mut ExpectedValueCheckingTransaction,
    ) -> Result<(), LockingError> {
        let holds_locks = txn.prepare_for_mutations().await?;
        let target = if holds_locks {
            txn.strong()
        } else {
            txn.inconsistent()
        };
        self.store.mutate(key, additions, deletions, target).await?;
        Ok(())
    }

    pub async fn get_slice(
        &self,
        query: &KeySliceQuery,
        txn: &ExpectedValueCheckingTransaction,
    ) -> Result<Vec<Entry>, StoreError> {
        self.store.get_slice(query, txn.inconsistent()).await
    }
}

impl LockCapability for ExpectedValueCheckingStore {
    fn name(&self) -> &str {
        self.store.name()
    }

    fn locker(&self) -> &dyn Locker {
        self.locker.as_ref()
    }

    fn backing_store(&self) -> &Arc<dyn KeyColumnValueStore> {
        &self.store
    }
}
