//! Blob storage backends for UBN bundle storage.
//!
//! The bundle engine never talks to disks or object stores directly. It
//! issues exactly two kinds of request through [`StorageBackend`]: a ranged
//! read of an existing blob, and a write of a new blob under a prefix. Any
//! retry policy lives in the backend, not in the engine.
//!
//! # Backends
//!
//! - [`InMemoryStorageBackend`] -- `HashMap`-based store for tests and embedding
//! - [`FileStorageBackend`] -- one file per blob below a root directory
//!
//! # Design Rules
//!
//! 1. Blobs are immutable once written.
//! 2. Every write gets a fresh, never-reused locator.
//! 3. Short reads are allowed only at the end of a blob.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod error;
pub mod file;
pub mod memory;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use file::FileStorageBackend;
pub use memory::InMemoryStorageBackend;
pub use traits::StorageBackend;
