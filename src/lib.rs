//! Advisory distributed locking over an ordered key-column-value store.
//!
//! Processes claim a `(row key, column)` coordinate by writing a timestamped
//! claim into a lock store, wait out the store's visibility window, and read
//! the claims back to decide seniority. The [`transaction`] layer turns those
//! locks into compare-and-mutate by verifying expected values before the
//! first write of a transaction.

pub mod config;
pub mod locking;
pub mod storage;
pub mod time;
pub mod transaction;
pub mod types;

pub use config::{ConfigError, LockConfig};
pub use locking::{
    ConsistentKeyLocker, ConsistentKeyLockerBuilder, LocalLockMediator, LocalLockMediators,
    LockCleanerService, LockCoordinate, LockMetrics, LockMetricsSnapshot, LockStatus, Locker,
    LockerState, LockingError, StandardLockCleanerService,
};
pub use storage::{
    InMemoryStoreManager, KeyColumnValueStore, StoreError, StoreManager, StoreTransaction,
    TransactionConfig,
};
pub use time::{ManualTimestamps, Resolution, SystemTimestamps, TimestampProvider};
pub use transaction::{
    ExpectedValueCheckingStore, ExpectedValueCheckingStoreManager,
    ExpectedValueCheckingTransaction,
};
pub use types::{Column, Key, OwnerId, Timestamp, TxnId, Value};
