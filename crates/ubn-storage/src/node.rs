//! Typed nodes, the start-up type registry, and cached node references.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use ubn_types::BlobType;
use uuid::Uuid;

use crate::error::{StorageError, StorageResult};
use crate::handle::{BlobHandle, NodeData};

/// A node type with a stable wire identity.
///
/// `serialize` returns the payload and the handles it references, in the
/// order `deserialize` will find them in [`NodeData::refs`].
pub trait Node: Send + Sync + Sized + 'static {
    const BLOB_TYPE: BlobType;

    fn serialize(&self) -> (Vec<u8>, Vec<BlobHandle>);

    fn deserialize(data: &NodeData) -> StorageResult<Self>;
}

/// A deserialized node of a type known only at run time.
pub type AnyNode = Arc<dyn Any + Send + Sync>;

type Factory = fn(&NodeData) -> StorageResult<AnyNode>;

fn factory<T: Node>(data: &NodeData) -> StorageResult<AnyNode> {
    Ok(Arc::new(T::deserialize(data)?))
}

/// Maps type GUIDs to deserializers. Filled once at start-up.
#[derive(Default)]
pub struct NodeRegistry {
    factories: HashMap<Uuid, (BlobType, Factory)>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under its type GUID, replacing any earlier entry.
    pub fn register<T: Node>(&mut self) -> &mut Self {
        let make: Factory = factory::<T>;
        self.factories.insert(T::BLOB_TYPE.guid, (T::BLOB_TYPE, make));
        self
    }

    pub fn contains(&self, guid: &Uuid) -> bool {
        self.factories.contains_key(guid)
    }

    /// The registered type for a GUID, with its current version.
    pub fn blob_type(&self, guid: &Uuid) -> Option<BlobType> {
        self.factories.get(guid).map(|(blob_type, _)| *blob_type)
    }

    /// Deserialize with whatever type is registered for the data's GUID.
    pub fn deserialize_any(&self, data: &NodeData) -> StorageResult<AnyNode> {
        let (_, make) = self
            .factories
            .get(&data.blob_type.guid)
            .ok_or(StorageError::UnknownBlobType(data.blob_type))?;
        make(data)
    }

    /// Deserialize through the registry and downcast to `T`.
    pub fn deserialize<T: Node>(&self, data: &NodeData) -> StorageResult<Arc<T>> {
        self.deserialize_any(data)?
            .downcast::<T>()
            .map_err(|_| StorageError::TypeMismatch {
                expected: T::BLOB_TYPE,
                actual: data.blob_type,
            })
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.factories.values().map(|(blob_type, _)| blob_type))
            .finish()
    }
}

/// Residency of the node behind a [`NodeRef`].
#[derive(Debug)]
pub enum NodeRefState<T> {
    /// Never loaded.
    Unresolved,
    Resident(Arc<T>),
    /// Dropped from memory; the next load re-reads it.
    Evicted,
}

impl<T> Clone for NodeRefState<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Unresolved => Self::Unresolved,
            Self::Resident(node) => Self::Resident(Arc::clone(node)),
            Self::Evicted => Self::Evicted,
        }
    }
}

/// Typed reference that caches the deserialized node.
///
/// State changes are explicit: [`load`](NodeRef::load) makes the node
/// resident and [`evict`](NodeRef::evict) drops it again, which is only
/// allowed once the node is persisted and can be re-read.
pub struct NodeRef<T: Node> {
    handle: BlobHandle,
    state: Mutex<NodeRefState<T>>,
}

impl<T: Node> NodeRef<T> {
    pub fn new(handle: BlobHandle) -> Self {
        Self {
            handle,
            state: Mutex::new(NodeRefState::Unresolved),
        }
    }

    /// A reference whose node is already in memory.
    pub fn with_node(handle: BlobHandle, node: T) -> Self {
        Self {
            handle,
            state: Mutex::new(NodeRefState::Resident(Arc::new(node))),
        }
    }

    pub fn handle(&self) -> &BlobHandle {
        &self.handle
    }

    pub fn state(&self) -> NodeRefState<T> {
        self.state.lock().expect("node ref lock poisoned").clone()
    }

    pub fn is_resident(&self) -> bool {
        self.resident().is_some()
    }

    /// The node, if it is in memory.
    pub fn resident(&self) -> Option<Arc<T>> {
        match &*self.state.lock().expect("node ref lock poisoned") {
            NodeRefState::Resident(node) => Some(Arc::clone(node)),
            _ => None,
        }
    }

    /// The resident node, reading and deserializing it if needed.
    pub async fn load(&self) -> StorageResult<Arc<T>> {
        if let Some(node) = self.resident() {
            return Ok(node);
        }
        let node = Arc::new(self.handle.read_node::<T>().await?);
        let mut state = self.state.lock().expect("node ref lock poisoned");
        match &*state {
            // Another load won the race; keep its copy.
            NodeRefState::Resident(existing) => Ok(Arc::clone(existing)),
            _ => {
                *state = NodeRefState::Resident(Arc::clone(&node));
                Ok(node)
            }
        }
    }

    /// Drop the resident node. Returns `false` when nothing was evicted,
    /// either because it is not resident or not yet persisted.
    pub fn evict(&self) -> bool {
        if !self.handle.is_flushed() {
            return false;
        }
        let mut state = self.state.lock().expect("node ref lock poisoned");
        if matches!(*state, NodeRefState::Resident(_)) {
            *state = NodeRefState::Evicted;
            true
        } else {
            false
        }
    }
}

impl<T: Node> fmt::Debug for NodeRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &*self.state.lock().expect("node ref lock poisoned") {
            NodeRefState::Unresolved => "unresolved",
            NodeRefState::Resident(_) => "resident",
            NodeRefState::Evicted => "evicted",
        };
        f.debug_struct("NodeRef")
            .field("handle", &self.handle)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ubn_store::InMemoryStorageBackend;
    use ubn_types::ContentHash;

    use crate::config::{ReaderConfig, WriterConfig};
    use crate::reader::BundleReader;
    use crate::writer::BundleWriter;

    struct TextNode {
        text: String,
        children: Vec<BlobHandle>,
    }

    impl Node for TextNode {
        const BLOB_TYPE: BlobType = BlobType::from_u128(0x7e47, 2);

        fn serialize(&self) -> (Vec<u8>, Vec<BlobHandle>) {
            (self.text.as_bytes().to_vec(), self.children.clone())
        }

        fn deserialize(data: &NodeData) -> StorageResult<Self> {
            let text = String::from_utf8(data.data.to_vec())
                .map_err(|e| StorageError::Decode(e.to_string()))?;
            Ok(Self {
                text,
                children: data.refs.clone(),
            })
        }
    }

    fn text(text: &str, children: Vec<BlobHandle>) -> TextNode {
        TextNode {
            text: text.into(),
            children,
        }
    }

    fn node_data(blob_type: BlobType, payload: &'static [u8]) -> NodeData {
        NodeData {
            hash: ContentHash::compute(payload),
            blob_type,
            data: Bytes::from_static(payload),
            refs: vec![],
            locator: None,
        }
    }

    fn writer() -> BundleWriter {
        let backend = Arc::new(InMemoryStorageBackend::new());
        let reader = BundleReader::new(backend, ReaderConfig::default());
        BundleWriter::new(reader, WriterConfig::default())
    }

    #[test]
    fn registry_dispatches_on_guid() {
        let data = node_data(TextNode::BLOB_TYPE, b"registered");
        let mut registry = NodeRegistry::new();
        assert!(matches!(
            registry.deserialize_any(&data),
            Err(StorageError::UnknownBlobType(_))
        ));

        registry.register::<TextNode>();
        assert!(registry.contains(&TextNode::BLOB_TYPE.guid));
        assert_eq!(
            registry.blob_type(&TextNode::BLOB_TYPE.guid),
            Some(TextNode::BLOB_TYPE)
        );
        assert_eq!(registry.deserialize::<TextNode>(&data).unwrap().text, "registered");
        assert!(registry.deserialize_any(&data).unwrap().downcast::<TextNode>().is_ok());

        // Older serializer versions resolve to the same factory.
        let old = node_data(BlobType::new(TextNode::BLOB_TYPE.guid, 1), b"old");
        assert_eq!(registry.deserialize::<TextNode>(&old).unwrap().text, "old");
    }

    #[tokio::test]
    async fn pending_refs_load_but_never_evict() {
        let mut writer = writer();
        let handle = writer.write(&text("pending", vec![])).await.unwrap();

        let node_ref = NodeRef::<TextNode>::with_node(handle.clone(), text("pending", vec![]));
        assert!(node_ref.is_resident());
        assert!(!node_ref.evict());
        assert!(node_ref.is_resident());

        let fresh = NodeRef::<TextNode>::new(handle);
        assert!(matches!(fresh.state(), NodeRefState::Unresolved));
        assert_eq!(fresh.load().await.unwrap().text, "pending");
        assert!(!fresh.evict());
        writer.flush().await.unwrap();
    }

    #[tokio::test]
    async fn flushed_refs_cycle_through_states() {
        let mut writer = writer();
        let leaf = writer.write(&text("leaf", vec![])).await.unwrap();
        let root = writer.write(&text("root", vec![leaf.clone()])).await.unwrap();
        writer.flush().await.unwrap();

        let node_ref = NodeRef::<TextNode>::new(root);
        assert!(!node_ref.evict());
        let loaded = node_ref.load().await.unwrap();
        assert_eq!(loaded.text, "root");
        assert_eq!(loaded.children[0].hash(), leaf.hash());
        assert!(Arc::ptr_eq(&loaded, &node_ref.load().await.unwrap()));

        assert!(node_ref.evict());
        assert!(matches!(node_ref.state(), NodeRefState::Evicted));
        assert!(node_ref.resident().is_none());
        let reloaded = node_ref.load().await.unwrap();
        assert_eq!(reloaded.text, "root");
        assert!(!Arc::ptr_eq(&loaded, &reloaded));
    }

    #[tokio::test]
    async fn load_rejects_other_types() {
        let mut writer = writer();
        let raw = writer
            .write_node(b"raw", vec![], BlobType::from_u128(0x7e57, 1))
            .await
            .unwrap();
        let node_ref = NodeRef::<TextNode>::new(raw);
        assert!(matches!(
            node_ref.load().await,
            Err(StorageError::TypeMismatch { .. })
        ));
        assert!(matches!(node_ref.state(), NodeRefState::Unresolved));
        writer.flush().await.unwrap();
    }
}
