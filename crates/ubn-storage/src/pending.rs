//! Bundles under construction and the nodes staged in them.
//!
//! A [`PendingBundle`] moves through `Building -> Sealed -> Complete` or ends
//! in `Failed`. Sealing spawns the persist task, which waits for every
//! bundle this one imports from, compresses the packets, writes the blob
//! and then assigns a [`NodeLocator`] to each staged node. Once started the
//! persist task always runs to completion or failure.
//!
//! A bundle dropped before it completes reports
//! [`StorageError::DisposedBeforeComplete`] to every callback and waiter.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, Weak};

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, error, info};
use ubn_bundle::{
    Bundle, BundleExport, BundleExportRef, BundleHeader, BundlePacket, MAX_SECTION_LENGTH,
};
use ubn_types::{BlobLocator, BlobType, ContentHash, NodeLocator};

use crate::error::{StorageError, StorageResult};
use crate::handle::{BlobHandle, FlushCallback, NodeData};
use crate::reader::BundleReader;
use crate::writer::WriterShared;

/// Lifecycle of a pending bundle, published on a watch channel.
#[derive(Clone, Debug)]
pub(crate) enum BundleState {
    Building,
    Sealed,
    Complete(BlobLocator),
    Failed(StorageError),
}

impl BundleState {
    pub(crate) fn is_finished(&self) -> bool {
        matches!(self, Self::Complete(_) | Self::Failed(_))
    }
}

/// Wait for a bundle to finish. A closed channel means the bundle was
/// dropped before it got there.
pub(crate) async fn wait_for_completion(
    mut status: watch::Receiver<BundleState>,
) -> StorageResult<BlobLocator> {
    let state = status
        .wait_for(BundleState::is_finished)
        .await
        .map(|state| state.clone());
    match state {
        Ok(BundleState::Complete(locator)) => Ok(locator),
        Ok(BundleState::Failed(err)) => Err(err),
        Ok(_) | Err(_) => Err(StorageError::DisposedBeforeComplete),
    }
}

/// A node staged in a pending bundle.
pub(crate) struct PendingNode {
    hash: ContentHash,
    blob_type: BlobType,
    export_index: usize,
    packet_index: usize,
    offset: usize,
    length: usize,
    refs: Mutex<Vec<BlobHandle>>,
    bundle: Weak<PendingBundle>,
    bundle_id: u64,
    locator: OnceLock<NodeLocator>,
    status: watch::Receiver<BundleState>,
    reader: BundleReader,
}

impl PendingNode {
    pub(crate) fn hash(&self) -> ContentHash {
        self.hash
    }

    pub(crate) fn bundle_id(&self) -> u64 {
        self.bundle_id
    }

    pub(crate) fn bundle(&self) -> Option<Arc<PendingBundle>> {
        self.bundle.upgrade()
    }

    pub(crate) fn locator(&self) -> Option<NodeLocator> {
        self.locator.get().cloned()
    }

    /// Persisted, or still owned by a bundle that has not failed.
    pub(crate) fn is_live(&self) -> bool {
        if self.locator.get().is_some() {
            return true;
        }
        Weak::strong_count(&self.bundle) > 0
            && !matches!(*self.status.borrow(), BundleState::Failed(_))
    }

    pub(crate) fn status(&self) -> watch::Receiver<BundleState> {
        self.status.clone()
    }

    pub(crate) async fn read(&self) -> StorageResult<NodeData> {
        if let Some(locator) = self.locator() {
            return self.reader.read_node(&locator).await;
        }
        let buffered = self
            .bundle
            .upgrade()
            .and_then(|bundle| bundle.staged_bytes(self.packet_index, self.offset, self.length));
        match buffered {
            Some(data) => Ok(NodeData {
                hash: self.hash,
                blob_type: self.blob_type,
                data,
                refs: self.refs.lock().expect("node refs lock poisoned").clone(),
                locator: None,
            }),
            // The buffers are released only after locators are assigned.
            None => match self.locator() {
                Some(locator) => self.reader.read_node(&locator).await,
                None => Err(self.terminal_error()),
            },
        }
    }

    pub(crate) async fn flush(&self) -> StorageResult<NodeLocator> {
        if let Some(locator) = self.locator() {
            return Ok(locator);
        }
        if let Some(bundle) = self.bundle.upgrade() {
            bundle.seal();
        }
        wait_for_completion(self.status.clone()).await?;
        self.locator()
            .ok_or(StorageError::UnresolvedReference(self.hash))
    }

    pub(crate) fn on_flushed(node: &Arc<Self>, callback: FlushCallback) {
        if let Some(locator) = node.locator() {
            callback(Ok(locator));
            return;
        }
        let Some(bundle) = node.bundle.upgrade() else {
            callback(Err(node.terminal_error()));
            return;
        };
        let target = Arc::clone(node);
        bundle.add_callback(Box::new(move |outcome: &StorageResult<BlobLocator>| {
            let result = match outcome {
                Ok(_) => target
                    .locator()
                    .ok_or(StorageError::UnresolvedReference(target.hash)),
                Err(e) => Err(e.clone()),
            };
            callback(result);
        }));
    }

    fn terminal_error(&self) -> StorageError {
        match &*self.status.borrow() {
            BundleState::Failed(e) => e.clone(),
            _ => StorageError::DisposedBeforeComplete,
        }
    }
}

type BundleCallback = Box<dyn FnOnce(&StorageResult<BlobLocator>) + Send + 'static>;

#[derive(Default)]
struct CallbackChain {
    waiting: Vec<BundleCallback>,
    outcome: Option<StorageResult<BlobLocator>>,
}

struct BundleBuffers {
    /// Closed packets, uncompressed.
    packets: Vec<Bytes>,
    /// The packet still being filled.
    current: Vec<u8>,
    nodes: Vec<Arc<PendingNode>>,
    dependencies: Vec<(u64, watch::Receiver<BundleState>)>,
    /// Staged bytes across all packets.
    length: usize,
    /// Export refs across all nodes.
    ref_count: usize,
    /// Blobs the header will import from, as far as known while staging.
    imports: HashSet<ImportTarget>,
    /// Import section string bytes, NULs included.
    import_bytes: usize,
    sealed: bool,
    released: bool,
}

/// What a caller learns from staging a node.
pub(crate) enum Staged {
    /// A handle already existed; nothing new was buffered.
    Existing(BlobHandle),
    /// A new node was buffered. `full` means the bundle should be sealed.
    Added { handle: BlobHandle, full: bool },
    /// The node's refs would overflow a header section; nothing was
    /// buffered. The bundle should be sealed and the node retried.
    Rejected,
}

/// Upper bound assumed for the locator of a bundle that is not yet written.
const PENDING_IMPORT_LENGTH: usize = 1024;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum ImportTarget {
    Blob(BlobLocator),
    /// A pending bundle; its locator is not known yet.
    Bundle(u64),
}

impl ImportTarget {
    fn encoded_len(&self) -> usize {
        match self {
            Self::Blob(blob) => blob.as_str().len() + 1,
            Self::Bundle(_) => PENDING_IMPORT_LENGTH + 1,
        }
    }
}

/// What staging one more node adds to the header.
struct HeaderGrowth {
    refs: usize,
    imports: Vec<ImportTarget>,
    import_bytes: usize,
}

impl HeaderGrowth {
    fn measure(bundle_id: u64, buffers: &BundleBuffers, refs: &[BlobHandle]) -> Self {
        let mut growth = Self {
            refs: refs.len(),
            imports: Vec::new(),
            import_bytes: 0,
        };
        for r in refs {
            let target = match (r.as_pending(), r.locator()) {
                (Some(node), _) if node.bundle_id() == bundle_id => continue,
                (_, Some(locator)) => ImportTarget::Blob(locator.blob.base()),
                (Some(node), None) => ImportTarget::Bundle(node.bundle_id()),
                (None, None) => continue,
            };
            if buffers.imports.contains(&target) || growth.imports.contains(&target) {
                continue;
            }
            growth.import_bytes += target.encoded_len();
            growth.imports.push(target);
        }
        growth
    }

    /// Whether every header section stays encodable with the node added.
    fn fits(&self, buffers: &BundleBuffers) -> bool {
        let exports = buffers.nodes.len() + 1;
        let export_refs = (exports + 1) * 4
            + (buffers.ref_count + self.refs) * BundleExportRef::ENCODED_LEN;
        let import_count = buffers.imports.len() + self.imports.len();
        let imports = (import_count + 1) * 4 + buffers.import_bytes + self.import_bytes;
        export_refs <= MAX_SECTION_LENGTH
            && imports <= MAX_SECTION_LENGTH
            && import_count <= i16::MAX as usize
    }

    fn apply(self, buffers: &mut BundleBuffers) {
        buffers.ref_count += self.refs;
        buffers.import_bytes += self.import_bytes;
        buffers.imports.extend(self.imports);
    }
}

/// A bundle that is still accepting nodes or is being persisted.
pub(crate) struct PendingBundle {
    id: u64,
    shared: Arc<WriterShared>,
    this: Weak<PendingBundle>,
    buffers: Mutex<BundleBuffers>,
    status: watch::Sender<BundleState>,
    callbacks: Mutex<CallbackChain>,
}

impl PendingBundle {
    pub(crate) fn new(shared: Arc<WriterShared>) -> Arc<Self> {
        let id = shared.next_bundle_id.fetch_add(1, Ordering::Relaxed);
        let (status, _) = watch::channel(BundleState::Building);
        Arc::new_cyclic(|this| Self {
            id,
            shared,
            this: this.clone(),
            buffers: Mutex::new(BundleBuffers {
                packets: Vec::new(),
                current: Vec::new(),
                nodes: Vec::new(),
                dependencies: Vec::new(),
                length: 0,
                ref_count: 0,
                imports: HashSet::new(),
                import_bytes: 0,
                sealed: false,
                released: false,
            }),
            status,
            callbacks: Mutex::new(CallbackChain::default()),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn status(&self) -> watch::Receiver<BundleState> {
        self.status.subscribe()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.status.borrow().is_finished()
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.buffers.lock().expect("bundle lock poisoned").sealed
    }

    pub(crate) fn has_nodes(&self) -> bool {
        !self.buffers.lock().expect("bundle lock poisoned").nodes.is_empty()
    }

    /// Copy of a staged node's bytes, or `None` once the buffers are gone.
    fn staged_bytes(&self, packet_index: usize, offset: usize, length: usize) -> Option<Bytes> {
        let buffers = self.buffers.lock().expect("bundle lock poisoned");
        if buffers.released {
            return None;
        }
        match packet_index.cmp(&buffers.packets.len()) {
            std::cmp::Ordering::Less => {
                Some(buffers.packets[packet_index].slice(offset..offset + length))
            }
            std::cmp::Ordering::Equal => Some(Bytes::copy_from_slice(
                &buffers.current[offset..offset + length],
            )),
            std::cmp::Ordering::Greater => None,
        }
    }

    /// Stage one node. Returns `None` if the bundle was sealed meanwhile and
    /// the caller has to retry on a fresh bundle.
    ///
    /// Every pending reference outside this bundle must already belong to a
    /// sealed bundle.
    pub(crate) fn stage(
        &self,
        data: &[u8],
        refs: &[BlobHandle],
        blob_type: BlobType,
    ) -> StorageResult<Option<Staged>> {
        let config = &self.shared.config;
        let mut buffers = self.buffers.lock().expect("bundle lock poisoned");
        if buffers.sealed {
            return Ok(None);
        }

        let offset = buffers.current.len();
        buffers.current.extend_from_slice(data);
        let hash = ContentHash::compute(&buffers.current[offset..]);

        if let Some((indexed_type, locator)) = self.shared.content_index.get(&hash) {
            if indexed_type == blob_type {
                buffers.current.truncate(offset);
                debug!(hash = %hash.short_hex(), locator = %locator, "content index hit");
                let handle = BlobHandle::from_locator(locator, self.shared.reader.clone());
                return Ok(Some(Staged::Existing(handle)));
            }
        }

        let growth = HeaderGrowth::measure(self.id, &buffers, refs);
        if !growth.fits(&buffers) {
            buffers.current.truncate(offset);
            let cached = self
                .shared
                .node_cache
                .get(&hash, &blob_type)
                .filter(BlobHandle::is_live);
            return Ok(Some(match cached {
                Some(handle) => Staged::Existing(handle),
                None => Staged::Rejected,
            }));
        }

        let export_index = buffers.nodes.len();
        let packet_index = buffers.packets.len();
        let (handle, inserted) = self.shared.node_cache.get_or_insert_with(hash, blob_type, || {
            BlobHandle::pending(Arc::new(PendingNode {
                hash,
                blob_type,
                export_index,
                packet_index,
                offset,
                length: data.len(),
                refs: Mutex::new(refs.to_vec()),
                bundle: self.this.clone(),
                bundle_id: self.id,
                locator: OnceLock::new(),
                status: self.status.subscribe(),
                reader: self.shared.reader.clone(),
            }))
        });
        if !inserted {
            buffers.current.truncate(offset);
            debug!(hash = %hash.short_hex(), "dedup cache hit");
            return Ok(Some(Staged::Existing(handle)));
        }

        let Some(node) = handle.as_pending().cloned() else {
            return Err(StorageError::UnresolvedReference(hash));
        };
        buffers.nodes.push(node);
        buffers.length += data.len();
        growth.apply(&mut buffers);
        self.shared.track_buffered(data.len());

        for r in refs {
            let Some(target) = r.as_pending() else {
                continue;
            };
            if target.bundle_id() == self.id
                || target.locator().is_some()
                || buffers.dependencies.iter().any(|(id, _)| *id == target.bundle_id())
            {
                continue;
            }
            buffers.dependencies.push((target.bundle_id(), target.status()));
        }

        if buffers.current.len() >= config.min_compression_packet_size {
            let packet = std::mem::take(&mut buffers.current);
            buffers.packets.push(Bytes::from(packet));
        }

        let full = buffers.length >= config.max_blob_size
            || buffers.nodes.len() > u16::MAX as usize
            || buffers.packets.len() >= u16::MAX as usize;
        Ok(Some(Staged::Added { handle, full }))
    }

    /// Stop accepting nodes and start persisting. Idempotent.
    pub(crate) fn seal(&self) {
        {
            let mut buffers = self.buffers.lock().expect("bundle lock poisoned");
            if buffers.sealed || buffers.nodes.is_empty() {
                return;
            }
            buffers.sealed = true;
            if !buffers.current.is_empty() {
                let packet = std::mem::take(&mut buffers.current);
                buffers.packets.push(Bytes::from(packet));
            }
            debug!(
                bundle = self.id,
                nodes = buffers.nodes.len(),
                packets = buffers.packets.len(),
                bytes = buffers.length,
                dependencies = buffers.dependencies.len(),
                "bundle sealed"
            );
        }
        self.status.send_replace(BundleState::Sealed);
        self.shared.track_outstanding(self.id, self.status());

        let Some(this) = self.this.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            match this.persist().await {
                Ok((locator, encoded)) => this.complete(locator, encoded),
                Err(e) => this.fail(e),
            }
        });
    }

    async fn persist(&self) -> StorageResult<(BlobLocator, usize)> {
        let dependencies = {
            let buffers = self.buffers.lock().expect("bundle lock poisoned");
            buffers.dependencies.clone()
        };
        for (id, status) in dependencies {
            wait_for_completion(status)
                .await
                .map_err(|e| StorageError::DependencyFailed {
                    bundle: id,
                    source: Box::new(e),
                })?;
        }

        let (nodes, packets) = {
            let buffers = self.buffers.lock().expect("bundle lock poisoned");
            (buffers.nodes.clone(), buffers.packets.clone())
        };
        let bundle = self.encode(&nodes, &packets)?;
        let data = bundle.to_bytes()?;
        let encoded = data.len();
        let locator = self
            .shared
            .backend
            .write_stream(data, &self.shared.config.blob_prefix)
            .await?;
        Ok((locator, encoded))
    }

    fn encode(&self, nodes: &[Arc<PendingNode>], packets: &[Bytes]) -> StorageResult<Bundle> {
        let format = self.shared.config.compression;
        let mut encoded_packets = Vec::with_capacity(packets.len());
        let mut packet_records = Vec::with_capacity(packets.len());
        let mut offset = 0usize;
        for packet in packets {
            let encoded_offset = u32::try_from(offset)
                .map_err(|_| StorageError::LimitExceeded(format!("bundle data exceeds u32 at {offset}")))?;
            let (record, encoded) = BundlePacket::encode(format, encoded_offset, packet)?;
            offset += encoded.len();
            packet_records.push(record);
            encoded_packets.push(Bytes::from(encoded));
        }

        let mut types: Vec<BlobType> = Vec::new();
        let mut imports: Vec<BlobLocator> = Vec::new();
        let mut import_lookup: HashMap<BlobLocator, usize> = HashMap::new();
        let mut exports = Vec::with_capacity(nodes.len());
        for node in nodes {
            let type_index = match types.iter().position(|t| *t == node.blob_type) {
                Some(index) => index,
                None => {
                    types.push(node.blob_type);
                    types.len() - 1
                }
            };

            let refs = node.refs.lock().expect("node refs lock poisoned").clone();
            let mut export_refs = Vec::with_capacity(refs.len());
            for r in &refs {
                if let Some(target) = r.as_pending() {
                    if target.bundle_id() == self.id {
                        export_refs.push(BundleExportRef::local(
                            to_u16(target.export_index, "export index")?,
                            target.hash,
                        ));
                        continue;
                    }
                }
                let locator = r
                    .locator()
                    .ok_or_else(|| StorageError::UnresolvedReference(r.hash()))?;
                // Fragments address inside a blob; one import per blob.
                let blob = locator.blob.base();
                let next = import_lookup.len();
                let import_index = *import_lookup.entry(blob.clone()).or_insert_with(|| {
                    imports.push(blob);
                    next
                });
                export_refs.push(BundleExportRef::imported(
                    i16::try_from(import_index).map_err(|_| {
                        StorageError::LimitExceeded(format!("import index {import_index}"))
                    })?,
                    to_u16(locator.export_index, "imported export index")?,
                    locator.hash,
                ));
            }

            exports.push(BundleExport {
                type_index: to_u16(type_index, "type index")?,
                hash: node.hash,
                packet_index: to_u16(node.packet_index, "packet index")?,
                offset: to_u32(node.offset, "export offset")?,
                length: to_u32(node.length, "export length")?,
                refs: export_refs,
            });
        }

        let header = BundleHeader::create(types, imports, exports, packet_records);
        Ok(Bundle::new(header, encoded_packets)?)
    }

    fn complete(&self, locator: BlobLocator, encoded: usize) {
        let nodes = {
            let buffers = self.buffers.lock().expect("bundle lock poisoned");
            buffers.nodes.clone()
        };
        for node in &nodes {
            let node_locator = NodeLocator::new(node.hash, locator.clone(), node.export_index);
            let _ = node.locator.set(node_locator.clone());
            node.refs.lock().expect("node refs lock poisoned").clear();
            self.shared.content_index.insert(node.blob_type, node_locator);
        }
        self.release();
        self.status
            .send_replace(BundleState::Complete(locator.clone()));
        self.shared.prune_outstanding();
        info!(
            bundle = self.id,
            locator = %locator,
            exports = nodes.len(),
            bytes = encoded,
            "bundle persisted"
        );
        self.fire_callbacks(Ok(locator));
    }

    fn fail(&self, err: StorageError) {
        error!(bundle = self.id, error = %err, "bundle persist failed");
        self.release();
        self.status.send_replace(BundleState::Failed(err.clone()));
        self.shared.prune_outstanding();
        self.fire_callbacks(Err(err));
    }

    /// Drop the buffers and return their bytes to the writer budget.
    fn release(&self) {
        let released = {
            let mut buffers = self.buffers.lock().expect("bundle lock poisoned");
            release_buffers(&mut buffers)
        };
        self.shared.release_buffered(released);
    }

    pub(crate) fn add_callback(&self, callback: BundleCallback) {
        let mut chain = self.callbacks.lock().expect("callback lock poisoned");
        match &chain.outcome {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(chain);
                callback(&outcome);
            }
            None => chain.waiting.push(callback),
        }
    }

    fn fire_callbacks(&self, outcome: StorageResult<BlobLocator>) {
        let waiting = {
            let mut chain = self.callbacks.lock().expect("callback lock poisoned");
            if chain.outcome.is_some() {
                return;
            }
            chain.outcome = Some(outcome.clone());
            std::mem::take(&mut chain.waiting)
        };
        for callback in waiting {
            callback(&outcome);
        }
    }
}

impl Drop for PendingBundle {
    fn drop(&mut self) {
        if self.status.borrow().is_finished() {
            return;
        }
        let buffers = self.buffers.get_mut().unwrap_or_else(PoisonError::into_inner);
        if buffers.nodes.is_empty() {
            return;
        }
        error!(
            bundle = self.id,
            nodes = buffers.nodes.len(),
            "pending bundle disposed before it was persisted"
        );
        let released = release_buffers(buffers);
        self.shared.release_buffered(released);
        self.fire_callbacks(Err(StorageError::DisposedBeforeComplete));
    }
}

fn release_buffers(buffers: &mut BundleBuffers) -> usize {
    if buffers.released {
        return 0;
    }
    buffers.released = true;
    buffers.packets = Vec::new();
    buffers.current = Vec::new();
    buffers.nodes = Vec::new();
    buffers.dependencies = Vec::new();
    buffers.imports = HashSet::new();
    buffers.length
}

fn to_u16(value: usize, what: &str) -> StorageResult<u16> {
    u16::try_from(value).map_err(|_| StorageError::LimitExceeded(format!("{what} {value}")))
}

fn to_u32(value: usize, what: &str) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| StorageError::LimitExceeded(format!("{what} {value}")))
}
