use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Locker entry points that are counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOperation {
    Write,
    Check,
    Delete,
}

#[derive(Debug, Default)]
struct Counter {
    calls: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Default)]
struct GroupCounters {
    write: Counter,
    check: Counter,
    delete: Counter,
}

impl GroupCounters {
    fn counter(&self, operation: LockOperation) -> &Counter {
        match operation {
            LockOperation::Write => &self.write,
            LockOperation::Check => &self.check,
            LockOperation::Delete => &self.delete,
        }
    }
}

/// Point-in-time copy of one group's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LockMetricsSnapshot {
    pub write_calls: u64,
    pub write_failures: u64,
    pub check_calls: u64,
    pub check_failures: u64,
    pub delete_calls: u64,
    /// Counted per claim whose deletion was abandoned.
    pub delete_failures: u64,
}

/// Call and failure counters for locker operations, keyed by the transaction
/// group name. Transactions without a group name are not counted.
#[derive(Debug, Default)]
pub struct LockMetrics {
    groups: DashMap<String, GroupCounters>,
}

impl LockMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_call(&self, group: Option<&str>, operation: LockOperation) {
        self.bump(group, operation, |counter| &counter.calls);
    }

    pub fn record_failure(&self, group: Option<&str>, operation: LockOperation) {
        self.bump(group, operation, |counter| &counter.failures);
    }

    fn bump(
        &self,
        group: Option<&str>,
        operation: LockOperation,
        field: impl Fn(&Counter) -> &AtomicU64,
    ) {
        let Some(group) = group else {
            return;
        };
        if let Some(counters) = self.groups.get(group) {
            field(counters.counter(operation)).fetch_add(1, Ordering::Relaxed);
            return;
        }
        let counters = self.groups.entry(group.to_owned()).or_default();
        field(counters.counter(operation)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, group: &str) -> Option<LockMetricsSnapshot> {
        let counters = self.groups.get(group)?;
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        Some(LockMetricsSnapshot {
            write_calls: load(&counters.write.calls),
            write_failures: load(&counters.write.failures),
            check_calls: load(&counters.check.calls),
            check_failures: load(&counters.check.failures),
            delete_calls: load(&counters.delete.calls),
            delete_failures: load(&counters.delete.failures),
        })
    }

    pub fn groups(&self) -> Vec<String> {
        let mut names: Vec<String> = self.groups.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }
}
