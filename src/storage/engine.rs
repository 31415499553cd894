use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Column, Key, Timestamp, TxnId, Value};

/// Errors surfaced by column store implementations.
///
/// The split matters to every caller: temporary failures may be retried within
/// a bounded budget, permanent ones never are.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("temporary store failure: {0}")]
    Temporary(String),
    #[error("permanent store failure: {0}")]
    Permanent(String),
}

impl StoreError {
    pub fn temporary(message: impl Into<String>) -> Self {
        Self::Temporary(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent(message.into())
    }

    pub fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }
}

/// A single column/value cell returned by a slice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub column: Column,
    pub value: Value,
}

impl Entry {
    pub fn new(column: impl Into<Column>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Columns of one key in `[start, end)` by byte order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySliceQuery {
    pub key: Key,
    pub start: Column,
    pub end: Column,
    pub limit: Option<usize>,
}

impl KeySliceQuery {
    pub fn new(key: impl Into<Key>, start: impl Into<Column>, end: impl Into<Column>) -> Self {
        Self {
            key: key.into(),
            start: start.into(),
            end: end.into(),
            limit: None,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Read/write consistency requested from the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consistency {
    #[default]
    Default,
    /// Strongest per-key consistency the store offers (e.g. quorum).
    KeyConsistent,
}

/// Options a transaction is opened with.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionConfig {
    /// Overrides the timestamp the store stamps on this transaction's writes.
    pub commit_time: Option<Timestamp>,
    pub consistency: Consistency,
    pub group_name: Option<String>,
}

impl TransactionConfig {
    pub fn with_commit_time(mut self, commit_time: Timestamp) -> Self {
        self.commit_time = Some(commit_time);
        self
    }

    pub fn with_consistency(mut self, consistency: Consistency) -> Self {
        self.consistency = consistency;
        self
    }

    pub fn with_group_name(mut self, group_name: impl Into<String>) -> Self {
        self.group_name = Some(group_name.into());
        self
    }
}

/// Handle for a unit of work against a store.
#[async_trait]
pub trait StoreTransaction: Send + Sync + std::fmt::Debug {
    fn id(&self) -> &TxnId;

    fn config(&self) -> &TransactionConfig;

    async fn commit(&self) -> Result<(), StoreError>;

    async fn rollback(&self) -> Result<(), StoreError>;
}

/// Abstract contract for an ordered key-column-value store.
#[async_trait]
pub trait KeyColumnValueStore: Send + Sync {
    fn name(&self) -> &str;

    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        txn: &dyn StoreTransaction,
    ) -> Result<Vec<Entry>, StoreError>;

    /// Applies additions and deletions to one key atomically.
    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Column>,
        txn: &dyn StoreTransaction,
    ) -> Result<(), StoreError>;
}

/// Opens stores and begins transactions against them.
#[async_trait]
pub trait StoreManager: Send + Sync {
    async fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>, StoreError>;

    async fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> Result<Box<dyn StoreTransaction>, StoreError>;
}
