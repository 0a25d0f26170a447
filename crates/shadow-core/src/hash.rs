//! Content hashes for configurations, diffs and audit entries
//!
//! Configurations and diffs are identified by BLAKE3 over their canonical
//! JSON encoding, so key order never changes identity. The golden trace
//! stores its SHA-256 links in the same type.

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value as JsonValue;

use crate::config::canonical_json;

const LEN: usize = 32;

/// 32-byte digest, printed and serialized as lowercase hex
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentHash([u8; LEN]);

impl ContentHash {
    /// Link value before the first entry of a chain
    pub const ZERO: Self = Self([0; LEN]);

    /// Wrap a digest computed elsewhere
    #[inline]
    #[must_use]
    pub const fn from_digest(bytes: [u8; LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; LEN] {
        &self.0
    }

    /// BLAKE3 of raw bytes
    #[inline]
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    /// BLAKE3 of the canonical (sorted-key) encoding of `value`
    #[must_use]
    pub fn of_json(value: &JsonValue) -> Self {
        Self::compute(canonical_json(value).as_bytes())
    }

    /// # Errors
    /// Returns error if `value` cannot be represented as JSON
    pub fn of_serializable<T: Serialize>(value: &T) -> Result<Self, HashError> {
        Ok(Self::of_json(&serde_json::to_value(value)?))
    }

    /// First eight bytes in hex, for log lines
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }

    #[inline]
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl FromStr for ContentHash {
    type Err = HashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != LEN * 2 {
            return Err(HashError::InvalidLength {
                expected: LEN * 2,
                actual: s.len(),
            });
        }
        let mut bytes = [0u8; LEN];
        hex::decode_to_slice(s, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HashError {
    /// Hex text of the wrong length
    #[error("hash must be {expected} hex characters, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("value is not representable as JSON: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_change_identity() {
        let a = json!({"retrieval": {"top_k": 8, "threshold": 0.4}, "mode": "m1"});
        let b = json!({"mode": "m1", "retrieval": {"threshold": 0.4, "top_k": 8}});
        assert_eq!(ContentHash::of_json(&a), ContentHash::of_json(&b));
        assert_ne!(ContentHash::of_json(&a), ContentHash::of_json(&json!({"mode": "m2"})));
    }

    #[test]
    fn parses_its_own_display() {
        let hash = ContentHash::compute(b"routing table");
        let parsed: ContentHash = hash.to_string().parse().unwrap();
        assert_eq!(hash, parsed);
        assert!(hash.to_string().starts_with(&hash.short()));
    }

    #[test]
    fn rejects_short_or_non_hex_text() {
        assert!(matches!(
            "abcd".parse::<ContentHash>(),
            Err(HashError::InvalidLength { expected: 64, actual: 4 })
        ));
        assert!(matches!("zz".repeat(32).parse::<ContentHash>(), Err(HashError::Hex(_))));
    }

    #[test]
    fn travels_as_hex_string() {
        let hash = ContentHash::compute(b"weights");
        let encoded = serde_json::to_string(&hash).unwrap();
        assert_eq!(encoded, format!("\"{hash}\""));
        assert_eq!(serde_json::from_str::<ContentHash>(&encoded).unwrap(), hash);
    }

    #[test]
    fn zero_marks_chain_start() {
        assert!(ContentHash::ZERO.is_zero());
        assert!(!ContentHash::compute(b"").is_zero());
    }
}
