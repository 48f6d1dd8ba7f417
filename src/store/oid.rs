use std::fmt;

use crate::error::{StoreError, StoreResult};

/// Length of a SHA-1 object name in bytes.
pub const OID_LEN: usize = 20;

/// A git object name (SHA-1).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; OID_LEN]);

impl ObjectId {
    pub fn from_bytes(bytes: [u8; OID_LEN]) -> Self {
        ObjectId(bytes)
    }

    /// Build from a raw 20-byte slice, as found in tree entries and pack indexes.
    pub fn from_slice(raw: &[u8]) -> StoreResult<Self> {
        let bytes: [u8; OID_LEN] = raw
            .try_into()
            .map_err(|_| StoreError::InvalidObjectId(hex::encode(raw)))?;
        Ok(ObjectId(bytes))
    }

    /// Parse a 40 character hexadecimal name. Surrounding whitespace is ignored.
    pub fn from_hex(text: &str) -> StoreResult<Self> {
        let text = text.trim();
        let mut bytes = [0u8; OID_LEN];
        hex::decode_to_slice(text, &mut bytes)
            .map_err(|_| StoreError::InvalidObjectId(text.to_string()))?;
        Ok(ObjectId(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; OID_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Abbreviated form for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({})", self.short_hex())
    }
}
