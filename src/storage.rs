pub mod engine;
pub mod memory;
pub mod retry;

pub use engine::{
    Consistency, Entry, KeyColumnValueStore, KeySliceQuery, StoreError, StoreManager,
    StoreTransaction, TransactionConfig,
};
pub use memory::{InMemoryStore, InMemoryStoreManager, InMemoryTransaction};
