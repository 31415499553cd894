//! Optimistic compare-and-mutate on top of the locker.
//!
//! A caller opens stores through [`ExpectedValueCheckingStoreManager`], takes
//! locks with an expected current value, and mutates. The first mutation of a
//! transaction verifies every lock and every expected value before anything
//! is written.

mod manager;
mod store;
mod txn;

pub use manager::{ExpectedValueCheckingStoreManager, LOCK_STORE_SUFFIX};
pub use store::{ExpectedValueCheckingStore, LockCapability};
pub use txn::ExpectedValueCheckingTransaction;
