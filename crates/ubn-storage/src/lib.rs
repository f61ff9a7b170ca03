//! Bundle storage engine for UBN.
//!
//! Persists Merkle DAGs of typed, content-addressed nodes. Nodes are packed
//! into immutable bundles which are stored as opaque blobs through a
//! [`StorageBackend`](ubn_store::StorageBackend).
//!
//! # Architecture
//!
//! - **BundleWriter**: stages nodes into pending bundles, deduplicates them,
//!   seals full bundles and persists them in the background in dependency
//!   order, bounded by a shared memory budget
//! - **BundleReader**: resolves node locators through a background fetch
//!   dispatcher with header prefetch, packet coalescing and caching
//! - **BlobHandle**: one reference type for pending and persisted nodes,
//!   with flush and completion callbacks
//! - **Node / NodeRegistry / NodeRef**: typed nodes, a start-up type table
//!   and explicitly cached references
//!
//! # Design Rules
//!
//! 1. A bundle is written only after every bundle it imports from.
//! 2. Export indices follow the order in which `write_node` accepted nodes.
//! 3. A started persist runs to completion or failure; it is never cancelled.
//! 4. Every failure reaches every waiter. Nothing is retried here.

pub mod cache;
pub mod config;
pub mod error;
pub mod handle;
pub mod node;
mod pending;
pub mod reader;
pub mod writer;

pub use cache::{ContentIndex, NodeCache};
pub use config::{ReaderCacheConfig, ReaderConfig, StorageConfig, WriterConfig};
pub use error::{StorageError, StorageResult};
pub use handle::{BlobHandle, FlushCallback, NodeData};
pub use node::{AnyNode, Node, NodeRef, NodeRefState, NodeRegistry};
pub use reader::{BundleInfo, BundleReader};
pub use writer::BundleWriter;
