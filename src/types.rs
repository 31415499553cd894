use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Row key within a column store.
pub type Key = Vec<u8>;
/// Column qualifier within a row. Columns sort by raw byte order.
pub type Column = Vec<u8>;
/// Raw cell payload.
pub type Value = Vec<u8>;
/// Store-native time, counted in ticks of the configured resolution since the UNIX epoch.
pub type Timestamp = u64;

/// Unique identifier assigned to every store transaction.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnId(Uuid);

impl Default for TxnId {
    fn default() -> Self {
        Self::new()
    }
}

impl TxnId {
    /// Creates a new transaction identifier using a random UUID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque identifier of the writing process, the "rid" stamped on every claim.
///
/// Always valid UTF-8, which guarantees the first owner byte of a lock column
/// is never `0xFF`. The lock slice end bound depends on that.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random owner id for a process that was not given one explicitly.
    pub fn random() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub(crate) fn matches(&self, rid: &[u8]) -> bool {
        self.as_bytes() == rid
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Writes bytes as lowercase hex; used by `Display` impls of byte-keyed types.
pub(crate) fn write_hex(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for byte in bytes {
        write!(f, "{byte:02x}")?;
    }
    Ok(())
}

/// Renders a byte string for log and error messages: UTF-8 as-is, anything else as hex.
pub(crate) fn display_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => text.to_string(),
        Err(_) => {
            struct Hex<'a>(&'a [u8]);
            impl fmt::Display for Hex<'_> {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write_hex(f, self.0)
                }
            }
            format!("0x{}", Hex(bytes))
        }
    }
}
