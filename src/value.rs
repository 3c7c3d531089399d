//! The cell value space: a byte string, with a distinguished byte pattern
//! reserved to denote a tombstone (deletion marker).

use serde::{Deserialize, Serialize};

/// A cell value. Carries no type tag of its own; whether a given `Value`
/// is a tombstone is decided by comparing its bytes against
/// [`Value::TOMBSTONE`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Value(pub Vec<u8>);

impl Value {
    /// The reserved byte pattern marking a cell as deleted. Chosen so it
    /// can never be produced by a caller's payload: a lone `0xFF` byte,
    /// which is not valid UTF-8 and not a payload this engine ever writes
    /// on behalf of a `put`.
    pub const TOMBSTONE_MARKER: [u8; 1] = [0xFF];

    pub fn put(bytes: Vec<u8>) -> Self {
        Value(bytes)
    }

    pub fn tombstone() -> Self {
        Value(Self::TOMBSTONE_MARKER.to_vec())
    }

    pub fn is_tombstone(&self) -> bool {
        self.0 == Self::TOMBSTONE_MARKER
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Value {
    fn from(bytes: Vec<u8>) -> Self {
        Value(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tombstone_is_recognized() {
        assert!(Value::tombstone().is_tombstone());
        assert!(!Value::put(b"hello".to_vec()).is_tombstone());
    }

    #[test]
    fn ordinary_payload_is_not_mistaken_for_a_tombstone() {
        let v = Value::put(vec![0xFFu8, 0x00]);
        assert!(!v.is_tombstone(), "tombstone marker must match exactly");
    }
}
