use std::collections::BTreeMap;
use std::collections::btree_map;

use crate::types::Timestamp;

use super::codec::LockCoordinate;

/// A claim this process believes it holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockStatus {
    write_timestamp: Timestamp,
    expiration_timestamp: Timestamp,
    checked: bool,
}

impl LockStatus {
    pub fn new(write_timestamp: Timestamp, expiration_timestamp: Timestamp) -> Self {
        Self {
            write_timestamp,
            expiration_timestamp,
            checked: false,
        }
    }

    pub fn write_timestamp(&self) -> Timestamp {
        self.write_timestamp
    }

    pub fn expiration_timestamp(&self) -> Timestamp {
        self.expiration_timestamp
    }

    pub fn is_checked(&self) -> bool {
        self.checked
    }

    pub(crate) fn set_checked(&mut self) {
        self.checked = true;
    }
}

/// Locks taken by one transaction on one locker.
///
/// Owned by the transaction and dropped with it; not meant to be shared
/// between tasks. Iteration follows coordinate order so checks and releases
/// run in a stable sequence.
#[derive(Debug, Default, Clone)]
pub struct LockerState {
    locks: BTreeMap<LockCoordinate, LockStatus>,
}

impl LockerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has(&self, coordinate: &LockCoordinate) -> bool {
        self.locks.contains_key(coordinate)
    }

    pub fn get(&self, coordinate: &LockCoordinate) -> Option<&LockStatus> {
        self.locks.get(coordinate)
    }

    pub fn take(&mut self, coordinate: LockCoordinate, status: LockStatus) {
        self.locks.insert(coordinate, status);
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, LockCoordinate, LockStatus> {
        self.locks.iter_mut()
    }

    /// Removes every lock, yielding them in coordinate order.
    pub fn drain(&mut self) -> btree_map::IntoIter<LockCoordinate, LockStatus> {
        std::mem::take(&mut self.locks).into_iter()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
