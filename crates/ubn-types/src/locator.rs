use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;
use crate::hash::ContentHash;

/// Opaque path of a persisted blob in a storage backend.
///
/// Locators are handed out by the backend on write and are unique per
/// write. A locator may carry an in-blob fragment after a `#`
/// (`bundles/abc#part-2`); backends address the blob by [`path`] and
/// ignore the fragment.
///
/// [`path`]: BlobLocator::path
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlobLocator(String);

impl BlobLocator {
    const FRAGMENT_SEPARATOR: char = '#';

    /// Create a locator, rejecting empty strings and embedded NULs
    /// (import tables store locators NUL-terminated).
    pub fn new(value: impl Into<String>) -> Result<Self, TypeError> {
        let value = value.into();
        if value.is_empty() {
            return Err(TypeError::InvalidLocator(value, "empty"));
        }
        if value.contains('\0') {
            return Err(TypeError::InvalidLocator(value, "contains NUL"));
        }
        Ok(Self(value))
    }

    /// The full locator string, fragment included.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The blob path without any fragment.
    pub fn path(&self) -> &str {
        match self.0.split_once(Self::FRAGMENT_SEPARATOR) {
            Some((path, _)) => path,
            None => &self.0,
        }
    }

    /// The in-blob fragment, if present.
    pub fn fragment(&self) -> Option<&str> {
        self.0
            .split_once(Self::FRAGMENT_SEPARATOR)
            .map(|(_, fragment)| fragment)
    }

    /// A copy of this locator with the fragment replaced.
    pub fn with_fragment(&self, fragment: &str) -> Result<Self, TypeError> {
        Self::new(format!(
            "{}{}{}",
            self.path(),
            Self::FRAGMENT_SEPARATOR,
            fragment
        ))
    }

    /// A copy of this locator without its fragment.
    pub fn base(&self) -> Self {
        Self(self.path().to_string())
    }
}

impl fmt::Debug for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlobLocator({})", self.0)
    }
}

impl fmt::Display for BlobLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BlobLocator {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for BlobLocator {
    type Error = TypeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BlobLocator> for String {
    fn from(locator: BlobLocator) -> Self {
        locator.0
    }
}

/// Address of one exported node inside a specific bundle blob.
///
/// The export index is only meaningful once the owning bundle has been
/// sealed and written; before that a node is reachable only through a
/// pending handle.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeLocator {
    pub hash: ContentHash,
    pub blob: BlobLocator,
    pub export_index: usize,
}

impl NodeLocator {
    pub fn new(hash: ContentHash, blob: BlobLocator, export_index: usize) -> Self {
        Self {
            hash,
            blob,
            export_index,
        }
    }
}

impl fmt::Debug for NodeLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeLocator({} @ {}[{}])",
            self.hash.short_hex(),
            self.blob,
            self.export_index
        )
    }
}

impl fmt::Display for NodeLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.blob, self.export_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_nul() {
        assert!(BlobLocator::new("").is_err());
        assert!(BlobLocator::new("a\0b").is_err());
        assert!(BlobLocator::new("bundles/a").is_ok());
    }

    #[test]
    fn fragment_split() {
        let loc = BlobLocator::new("bundles/abc#part-2").unwrap();
        assert_eq!(loc.path(), "bundles/abc");
        assert_eq!(loc.fragment(), Some("part-2"));
        assert_eq!(loc.base().as_str(), "bundles/abc");
    }

    #[test]
    fn no_fragment() {
        let loc = BlobLocator::new("bundles/abc").unwrap();
        assert_eq!(loc.path(), "bundles/abc");
        assert!(loc.fragment().is_none());
    }

    #[test]
    fn with_fragment_replaces_existing() {
        let loc = BlobLocator::new("bundles/abc#old").unwrap();
        let moved = loc.with_fragment("new").unwrap();
        assert_eq!(moved.as_str(), "bundles/abc#new");
    }

    #[test]
    fn serde_rejects_invalid() {
        let err = serde_json::from_str::<BlobLocator>("\"\"");
        assert!(err.is_err());
        let ok: BlobLocator = serde_json::from_str("\"x/y\"").unwrap();
        assert_eq!(ok.as_str(), "x/y");
    }

    #[test]
    fn node_locator_display() {
        let loc = NodeLocator::new(
            ContentHash::compute(b"n"),
            BlobLocator::new("bundles/abc").unwrap(),
            3,
        );
        assert_eq!(loc.to_string(), "bundles/abc[3]");
    }
}
