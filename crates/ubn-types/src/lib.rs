//! Foundation types for UBN bundle storage.
//!
//! Every other UBN crate depends on `ubn-types`. The types here are plain
//! values: they carry no I/O and can be freely cloned, hashed, and
//! serialized.
//!
//! # Key Types
//!
//! - [`ContentHash`]: 20-byte content address of a node's serialized bytes
//! - [`BlobType`]: type GUID plus serializer version for a node payload
//! - [`BlobLocator`]: opaque backend path of a persisted blob
//! - [`NodeLocator`]: one exported node inside a specific bundle blob

pub mod blob_type;
pub mod error;
pub mod hash;
pub mod locator;

pub use blob_type::BlobType;
pub use error::TypeError;
pub use hash::ContentHash;
pub use locator::{BlobLocator, NodeLocator};
