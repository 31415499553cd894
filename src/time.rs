use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Timestamp;

/// Unit of store-native timestamps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Nano,
    #[default]
    Micro,
    Milli,
}

impl Resolution {
    /// Converts a duration into ticks of this resolution, saturating at `u64::MAX`.
    pub fn ticks(self, duration: Duration) -> u64 {
        let ticks = match self {
            Resolution::Nano => duration.as_nanos(),
            Resolution::Micro => duration.as_micros(),
            Resolution::Milli => duration.as_millis(),
        };
        u64::try_from(ticks).unwrap_or(u64::MAX)
    }

    pub fn duration(self, ticks: u64) -> Duration {
        match self {
            Resolution::Nano => Duration::from_nanos(ticks),
            Resolution::Micro => Duration::from_micros(ticks),
            Resolution::Milli => Duration::from_millis(ticks),
        }
    }
}

/// Sole source of time for the locking protocol.
///
/// Every timestamp written to or compared against the lock store comes from
/// here, so tests can swap in [`ManualTimestamps`] and control the clock.
#[async_trait]
pub trait TimestampProvider: Send + Sync + std::fmt::Debug {
    fn resolution(&self) -> Resolution;

    fn now(&self) -> Timestamp;

    /// Waits until `now() >= deadline` and returns the observed time.
    async fn sleep_past(&self, deadline: Timestamp) -> Timestamp;

    async fn sleep_for(&self, duration: Duration);

    fn ticks(&self, duration: Duration) -> u64 {
        self.resolution().ticks(duration)
    }
}

/// Wall-clock provider backed by `SystemTime` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimestamps {
    resolution: Resolution,
}

impl SystemTimestamps {
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }

    pub fn shared(resolution: Resolution) -> Arc<dyn TimestampProvider> {
        Arc::new(Self::new(resolution))
    }
}

#[async_trait]
impl TimestampProvider for SystemTimestamps {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn now(&self) -> Timestamp {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        self.resolution.ticks(since_epoch)
    }

    async fn sleep_past(&self, deadline: Timestamp) -> Timestamp {
        loop {
            let now = self.now();
            if now >= deadline {
                return now;
            }
            tokio::time::sleep(self.resolution.duration(deadline - now)).await;
        }
    }

    async fn sleep_for(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Deterministic clock for tests and simulations. Sleeping advances the clock.
#[derive(Debug, Default)]
pub struct ManualTimestamps {
    now: AtomicU64,
    resolution: Resolution,
}

impl ManualTimestamps {
    pub fn new(start: Timestamp, resolution: Resolution) -> Self {
        Self {
            now: AtomicU64::new(start),
            resolution,
        }
    }

    pub fn set(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    /// Moves the clock forward by `ticks` and returns the new time.
    pub fn advance(&self, ticks: u64) -> Timestamp {
        self.now.fetch_add(ticks, Ordering::SeqCst) + ticks
    }
}

#[async_trait]
impl TimestampProvider for ManualTimestamps {
    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    async fn sleep_past(&self, deadline: Timestamp) -> Timestamp {
        self.now.fetch_max(deadline, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.now()
    }

    async fn sleep_for(&self, duration: Duration) {
        self.advance(self.resolution.ticks(duration));
        tokio::task::yield_now().await;
    }
}
