pub mod cleaner;
pub mod codec;
pub mod error;
pub mod locker;
pub mod mediator;
pub mod metrics;
pub mod state;

pub use cleaner::{CooldownCache, LockCleanerService, StandardLockCleanerService};
pub use codec::{CodecError, LockCoordinate, TimestampRid};
pub use error::LockingError;
pub use locker::{ConsistentKeyLocker, ConsistentKeyLockerBuilder, Locker};
pub use mediator::{LocalLockMediator, LocalLockMediators};
pub use metrics::{LockMetrics, LockMetricsSnapshot, LockOperation};
pub use state::{LockStatus, LockerState};
