use std::time::Duration;

use thiserror::Error;

use crate::storage::StoreError;
use crate::types::Timestamp;

use super::codec::{CodecError, LockCoordinate};

/// Failures of the locking protocol and of the expected-value transaction layer.
///
/// Any of these means the surrounding transaction must be retried or abandoned;
/// [`LockingError::is_temporary`] tells the caller whether a retry can succeed.
#[derive(Debug, Error)]
pub enum LockingError {
    /// Contention or an exhausted retry budget.
    #[error("temporary locking failure: {0}")]
    Temporary(String),
    /// Our own claim lapsed before it was verified.
    #[error(
        "expired lock on {coordinate}: lock timestamp {timestamp} is older than lock expiry {expire:?}"
    )]
    Expired {
        coordinate: LockCoordinate,
        timestamp: Timestamp,
        expire: Duration,
    },
    /// A protocol invariant did not hold; usually a lost write in the backend.
    #[error("permanent locking failure: {0}")]
    Permanent(String),
    #[error(
        "expected value mismatch for {coordinate} in store {store}: expected {expected:?} vs actual {actual:?}"
    )]
    ExpectedValueMismatch {
        store: String,
        coordinate: LockCoordinate,
        expected: Option<Vec<u8>>,
        actual: Vec<Vec<u8>>,
    },
    #[error("attempted to obtain a lock after mutations had been persisted")]
    MutationStarted,
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LockingError {
    pub fn is_temporary(&self) -> bool {
        match self {
            Self::Temporary(_) | Self::Expired { .. } => true,
            Self::Store(err) => err.is_temporary(),
            _ => false,
        }
    }

    pub fn is_expired(&self) -> bool {
        matches!(self, Self::Expired { .. })
    }
}
