use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{error, trace, warn};

use crate::time::TimestampProvider;
use crate::types::{Timestamp, TxnId};

use super::codec::LockCoordinate;

#[derive(Debug, Clone, Copy)]
struct AuditRecord {
    holder: TxnId,
    expires: Timestamp,
}

/// Arbitrates lock contention between transactions of one process.
///
/// Claims in the lock store are tagged with the process owner id only, so two
/// transactions of the same process could not tell their claims apart. The
/// mediator makes sure at most one of them ever writes a claim per coordinate.
#[derive(Debug)]
pub struct LocalLockMediator {
    name: String,
    times: Arc<dyn TimestampProvider>,
    locks: DashMap<LockCoordinate, AuditRecord>,
}

impl LocalLockMediator {
    pub fn new(name: impl Into<String>, times: Arc<dyn TimestampProvider>) -> Self {
        Self {
            name: name.into(),
            times,
            locks: DashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Claims `coordinate` for `holder` until `expires`.
    ///
    /// Succeeds when the coordinate is free, already held by `holder` (the
    /// expiry is refreshed), or held by a record that has expired.
    pub fn lock(&self, coordinate: &LockCoordinate, holder: TxnId, expires: Timestamp) -> bool {
        let record = AuditRecord { holder, expires };
        match self.locks.entry(coordinate.clone()) {
            Entry::Vacant(vacant) => {
                vacant.insert(record);
                trace!(mediator = %self.name, %coordinate, txn = %holder, "new local lock");
                true
            }
            Entry::Occupied(mut occupied) => {
                let current = *occupied.get();
                if current.holder == holder {
                    occupied.insert(record);
                    trace!(mediator = %self.name, %coordinate, txn = %holder, expires, "refreshed local lock");
                    true
                } else if current.expires < self.times.now() {
                    occupied.insert(record);
                    trace!(
                        mediator = %self.name,
                        %coordinate,
                        previous = %current.holder,
                        "discarded expired local lock"
                    );
                    true
                } else {
                    trace!(
                        mediator = %self.name,
                        %coordinate,
                        txn = %holder,
                        owner = %current.holder,
                        "local lock contention"
                    );
                    false
                }
            }
        }
    }

    /// Releases `coordinate` if `holder` owns it.
    pub fn unlock(&self, coordinate: &LockCoordinate, holder: TxnId) -> bool {
        let Some(current) = self.locks.get(coordinate).map(|r| *r) else {
            error!(mediator = %self.name, %coordinate, "local unlock failed: no lock found");
            return false;
        };
        if current.holder != holder {
            error!(
                mediator = %self.name,
                %coordinate,
                txn = %holder,
                owner = %current.holder,
                "local unlock failed: held by another transaction"
            );
            return false;
        }
        if self
            .locks
            .remove_if(coordinate, |_, record| record.holder == holder)
            .is_none()
        {
            warn!(
                mediator = %self.name,
                %coordinate,
                "local lock record disappeared during removal"
            );
        }
        true
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Mediators of one process, one per lock store name.
///
/// Every locker of a process must share one registry, or two lockers over the
/// same lock store would never arbitrate against each other. Hand the same
/// `Arc` to each store manager built for the process.
#[derive(Debug, Default)]
pub struct LocalLockMediators {
    mediators: DashMap<String, Arc<LocalLockMediator>>,
}

impl LocalLockMediators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mediator for `name`, creating it with `times` on first use.
    pub fn get(&self, name: &str, times: Arc<dyn TimestampProvider>) -> Arc<LocalLockMediator> {
        if let Some(mediator) = self.mediators.get(name) {
            return mediator.value().clone();
        }
        self.mediators
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(LocalLockMediator::new(name, times)))
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.mediators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mediators.is_empty()
    }
}
