use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::types::{Column, Key, Timestamp, TxnId, Value};

use super::engine::{
    Entry, KeyColumnValueStore, KeySliceQuery, StoreError, StoreManager, StoreTransaction,
    TransactionConfig,
};

/// In-memory manager handing out named ordered column stores.
///
/// Every store opened under the same name shares one backing map, so several
/// lockers (simulated processes) can contend over a single manager.
#[derive(Debug, Default)]
pub struct InMemoryStoreManager {
    stores: RwLock<HashMap<String, Arc<InMemoryStore>>>,
}

impl InMemoryStoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle to a store, creating it if needed.
    pub async fn store(&self, name: &str) -> Arc<InMemoryStore> {
        if let Some(store) = self.stores.read().await.get(name) {
            return store.clone();
        }
        let mut stores = self.stores.write().await;
        stores
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InMemoryStore::new(name)))
            .clone()
    }
}

#[async_trait]
impl StoreManager for InMemoryStoreManager {
    async fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>, StoreError> {
        let store: Arc<dyn KeyColumnValueStore> = self.store(name).await;
        Ok(store)
    }

    async fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> Result<Box<dyn StoreTransaction>, StoreError> {
        Ok(Box::new(InMemoryTransaction::new(config)))
    }
}

/// Transaction handle for [`InMemoryStore`].
///
/// Mutations are visible as soon as `mutate` returns; commit and rollback only
/// exist to satisfy the transaction contract.
#[derive(Debug, Clone)]
pub struct InMemoryTransaction {
    id: TxnId,
    config: TransactionConfig,
}

impl InMemoryTransaction {
    pub fn new(config: TransactionConfig) -> Self {
        Self {
            id: TxnId::new(),
            config,
        }
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    fn id(&self) -> &TxnId {
        &self.id
    }

    fn config(&self) -> &TransactionConfig {
        &self.config
    }

    async fn commit(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn rollback(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct Cell {
    value: Value,
    written_at: Timestamp,
}

/// Ordered column store kept entirely in memory.
///
/// Cells remember the commit timestamp they were written with. A timestamped
/// write or delete only takes effect over cells written at or before it, which
/// mirrors last-write-wins resolution in the column stores this models.
/// Mutations without a commit timestamp apply unconditionally.
#[derive(Debug)]
pub struct InMemoryStore {
    name: String,
    rows: RwLock<HashMap<Key, BTreeMap<Column, Cell>>>,
}

impl InMemoryStore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rows: RwLock::new(HashMap::new()),
        }
    }

    /// Every column currently stored under `key`, in byte order.
    pub async fn columns(&self, key: &[u8]) -> Vec<Column> {
        let rows = self.rows.read().await;
        rows.get(key)
            .map(|row| row.keys().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KeyColumnValueStore for InMemoryStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        _txn: &dyn StoreTransaction,
    ) -> Result<Vec<Entry>, StoreError> {
        if query.start >= query.end {
            return Ok(Vec::new());
        }
        let rows = self.rows.read().await;
        let Some(row) = rows.get(&query.key) else {
            return Ok(Vec::new());
        };
        let range = (
            Bound::Included(query.start.clone()),
            Bound::Excluded(query.end.clone()),
        );
        Ok(row
            .range::<Column, _>(range)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|(column, cell)| Entry::new(column.clone(), cell.value.clone()))
            .collect())
    }

    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Column>,
        txn: &dyn StoreTransaction,
    ) -> Result<(), StoreError> {
        let commit_time = txn.config().commit_time;
        let supersedes = |cell: &Cell| commit_time.is_none_or(|ts| cell.written_at <= ts);

        let mut rows = self.rows.write().await;
        let row = rows.entry(key.to_vec()).or_default();

        // Deletions land first so a column both deleted and added ends up present.
        for column in deletions {
            if row.get(&column).is_some_and(supersedes) {
                row.remove(&column);
            }
        }
        for Entry { column, value } in additions {
            if row.get(&column).is_none_or(supersedes) {
                row.insert(
                    column,
                    Cell {
                        value,
                        written_at: commit_time.unwrap_or_default(),
                    },
                );
            }
        }

        if row.is_empty() {
            rows.remove(key);
        }
        Ok(())
    }
}
