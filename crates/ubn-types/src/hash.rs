use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// Content address of a node's serialized bytes.
///
/// A `ContentHash` is the first 20 bytes of the BLAKE3 hash of the data.
/// Identical bytes always produce the same hash, which is what lets the
/// writer deduplicate nodes and lets readers refer to a node before they
/// know where it lives.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContentHash([u8; ContentHash::LEN]);

impl ContentHash {
    /// Encoded size of a hash in bytes.
    pub const LEN: usize = 20;

    /// The zero hash. Used for references whose target hash is unknown.
    pub const ZERO: Self = Self([0u8; Self::LEN]);

    /// Hash raw bytes.
    pub fn compute(data: &[u8]) -> Self {
        let digest = blake3::hash(data);
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&digest.as_bytes()[..Self::LEN]);
        Self(bytes)
    }

    /// Wrap a pre-computed hash.
    pub const fn from_raw(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Read a hash from the first 20 bytes of a slice.
    pub fn from_slice(data: &[u8]) -> Result<Self, TypeError> {
        if data.len() < Self::LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut bytes = [0u8; Self::LEN];
        bytes.copy_from_slice(&data[..Self::LEN]);
        Ok(Self(bytes))
    }

    /// Returns `true` if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; Self::LEN]
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// Hex-encoded string representation.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        if bytes.len() != Self::LEN {
            return Err(TypeError::InvalidLength {
                expected: Self::LEN,
                actual: bytes.len(),
            });
        }
        Self::from_slice(&bytes)
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; ContentHash::LEN]> for ContentHash {
    fn from(bytes: [u8; ContentHash::LEN]) -> Self {
        Self(bytes)
    }
}

impl From<ContentHash> for [u8; ContentHash::LEN] {
    fn from(hash: ContentHash) -> Self {
        hash.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_is_deterministic() {
        let h1 = ContentHash::compute(b"hello world");
        let h2 = ContentHash::compute(b"hello world");
        assert_eq!(h1, h2);
    }

    #[test]
    fn different_data_produces_different_hashes() {
        assert_ne!(ContentHash::compute(b"hello"), ContentHash::compute(b"world"));
    }

    #[test]
    fn compute_truncates_blake3() {
        let full = blake3::hash(b"truncate me");
        let hash = ContentHash::compute(b"truncate me");
        assert_eq!(hash.as_bytes(), &full.as_bytes()[..20]);
    }

    #[test]
    fn zero_hash() {
        assert!(ContentHash::ZERO.is_zero());
        assert!(!ContentHash::compute(b"").is_zero());
    }

    #[test]
    fn hex_roundtrip() {
        let hash = ContentHash::compute(b"test");
        let parsed = ContentHash::from_hex(&hash.to_hex()).unwrap();
        assert_eq!(hash, parsed);
        assert_eq!(hash.to_hex().len(), 40);
    }

    #[test]
    fn from_hex_wrong_length() {
        let err = ContentHash::from_hex("abcd").unwrap_err();
        assert_eq!(
            err,
            TypeError::InvalidLength {
                expected: 20,
                actual: 2
            }
        );
    }

    #[test]
    fn from_slice_too_short() {
        assert!(ContentHash::from_slice(&[1, 2, 3]).is_err());
    }

    #[test]
    fn serde_roundtrip() {
        let hash = ContentHash::compute(b"serde test");
        let json = serde_json::to_string(&hash).unwrap();
        let parsed: ContentHash = serde_json::from_str(&json).unwrap();
        assert_eq!(hash, parsed);
    }
}
