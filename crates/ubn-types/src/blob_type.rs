use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identity of a node payload schema.
///
/// The GUID names the node type and never changes; the version is bumped
/// whenever the serializer for that type changes shape. Readers branch on
/// the version to decode older payloads.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlobType {
    pub guid: Uuid,
    pub version: u32,
}

impl BlobType {
    /// Encoded size in a bundle's type table.
    pub const ENCODED_LEN: usize = 20;

    pub const fn new(guid: Uuid, version: u32) -> Self {
        Self { guid, version }
    }

    /// Convenience constructor for types declared as `u128` constants.
    pub const fn from_u128(guid: u128, version: u32) -> Self {
        Self {
            guid: Uuid::from_u128(guid),
            version,
        }
    }
}

impl fmt::Debug for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobType({self})")
    }
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.guid, self.version)
    }
}
