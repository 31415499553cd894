//! Byte layout of lock records in the lock store.
//!
//! ```text
//! key    = u32 big-endian length of row key | row key | column qualifier
//! column = u64 big-endian timestamp | owner id (UTF-8, at least one byte)
//! value  = 0x00
//! ```
//!
//! Because the fixed-width timestamp leads the column, claims on one
//! coordinate sort by timestamp first and owner second under byte order.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Column, Key, OwnerId, Timestamp, display_bytes};

const TIMESTAMP_LEN: usize = 8;

/// Sorts before every lock column: one byte is shorter than any 8-byte timestamp.
pub const LOCK_COL_START: [u8; 1] = [0x00];

/// Sorts after every lock column.
///
/// Nine bytes reach one byte past the timestamp into the owner id, and a UTF-8
/// string never contains a byte with all bits set.
pub const LOCK_COL_END: [u8; 9] = [0xFF; 9];

/// Reserved value stored with every claim.
pub const LOCK_VALUE: [u8; 1] = [0x00];

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("lock column holds {0} bytes, fewer than the 8-byte timestamp")]
    Truncated(usize),
    #[error("row key of {0} bytes does not fit a 32-bit length prefix")]
    KeyTooLong(usize),
}

/// The row-key/column-qualifier pair a lock protects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockCoordinate {
    pub key: Key,
    pub column: Column,
}

impl LockCoordinate {
    pub fn new(key: impl Into<Key>, column: impl Into<Column>) -> Self {
        Self {
            key: key.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for LockCoordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            display_bytes(&self.key),
            display_bytes(&self.column)
        )
    }
}

/// A claim read back from the lock store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampRid {
    pub timestamp: Timestamp,
    pub rid: Vec<u8>,
}

impl TimestampRid {
    pub fn rid_display(&self) -> String {
        display_bytes(&self.rid)
    }
}

/// Row key in the lock store for `coordinate`.
pub fn lock_key(coordinate: &LockCoordinate) -> Result<Key, CodecError> {
    let key_len = u32::try_from(coordinate.key.len())
        .map_err(|_| CodecError::KeyTooLong(coordinate.key.len()))?;
    let mut out = Vec::with_capacity(4 + coordinate.key.len() + coordinate.column.len());
    out.extend_from_slice(&key_len.to_be_bytes());
    out.extend_from_slice(&coordinate.key);
    out.extend_from_slice(&coordinate.column);
    Ok(out)
}

/// Lock column for a claim by `owner` written at `timestamp`.
pub fn lock_column(timestamp: Timestamp, owner: &OwnerId) -> Column {
    let mut out = Vec::with_capacity(TIMESTAMP_LEN + owner.as_bytes().len());
    out.extend_from_slice(&timestamp.to_be_bytes());
    out.extend_from_slice(owner.as_bytes());
    out
}

pub fn decode_lock_column(column: &[u8]) -> Result<TimestampRid, CodecError> {
    let Some((ts, rid)) = column.split_first_chunk::<TIMESTAMP_LEN>() else {
        return Err(CodecError::Truncated(column.len()));
    };
    Ok(TimestampRid {
        timestamp: Timestamp::from_be_bytes(*ts),
        rid: rid.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_key_prefixes_row_length() {
        let key = lock_key(&LockCoordinate::new(b"ab".to_vec(), b"xyz".to_vec())).unwrap();
        assert_eq!(key, vec![0, 0, 0, 2, b'a', b'b', b'x', b'y', b'z']);
    }

    #[test]
    fn length_prefix_separates_ambiguous_splits() {
        let left = lock_key(&LockCoordinate::new(b"ab".to_vec(), b"c".to_vec())).unwrap();
        let right = lock_key(&LockCoordinate::new(b"a".to_vec(), b"bc".to_vec())).unwrap();
        assert_ne!(left, right);
    }

    #[test]
    fn lock_column_layout() {
        let column = lock_column(0x0102_0304_0506_0708, &OwnerId::new("rid"));
        assert_eq!(&column[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&column[8..], b"rid");

        let decoded = decode_lock_column(&column).unwrap();
        assert_eq!(decoded.timestamp, 0x0102_0304_0506_0708);
        assert_eq!(decoded.rid, b"rid");
    }

    #[test]
    fn columns_sort_by_timestamp_then_owner() {
        let owner_z = OwnerId::new("z");
        let owner_a = OwnerId::new("a");
        let mut columns = vec![
            lock_column(300, &owner_a),
            lock_column(100, &owner_z),
            lock_column(256, &owner_a),
            lock_column(100, &owner_a),
        ];
        columns.sort();
        let decoded: Vec<(Timestamp, Vec<u8>)> = columns
            .iter()
            .map(|c| {
                let tr = decode_lock_column(c).unwrap();
                (tr.timestamp, tr.rid)
            })
            .collect();
        assert_eq!(
            decoded,
            vec![
                (100, b"a".to_vec()),
                (100, b"z".to_vec()),
                (256, b"a".to_vec()),
                (300, b"a".to_vec()),
            ]
        );
    }

    #[test]
    fn slice_bounds_enclose_extreme_claims() {
        let smallest = lock_column(0, &OwnerId::new("\u{0}"));
        let largest = lock_column(u64::MAX, &OwnerId::new("\u{10FFFF}"));
        assert!(LOCK_COL_START.as_slice() < smallest.as_slice());
        assert!(largest.as_slice() < LOCK_COL_END.as_slice());
    }

    #[test]
    fn truncated_column_rejected() {
        assert_eq!(
            decode_lock_column(&[1, 2, 3]),
            Err(CodecError::Truncated(3))
        );
    }
}
