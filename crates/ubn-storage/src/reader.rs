//! Bundle reader with a background fetch dispatcher.
//!
//! Header and packet reads are queued and served by a single dispatcher
//! task that keeps at most `max_concurrent_reads` backend reads in flight.
//! Header requests go first. A packet read is widened to cover following
//! packets up to `max_packet_fetch_size`, and every queued request that
//! falls into the widened range is answered from the same backend call.
//!
//! Three caches sit in front of the backend: headers, encoded packets and
//! decoded packets. Concurrent decodes of one packet share a single task.
//! The queue and cache locks are never held across I/O.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use sieve_cache::SieveCache;
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use ubn_bundle::BundleHeader;
use ubn_store::StorageBackend;
use ubn_types::{BlobLocator, NodeLocator};

use crate::config::ReaderConfig;
use crate::error::{StorageError, StorageResult};
use crate::handle::{BlobHandle, NodeData};

/// A parsed header and where its data region starts.
#[derive(Debug)]
pub struct BundleInfo {
    pub header: BundleHeader,
    /// Offset of the first packet byte within the blob.
    pub data_offset: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct PacketKey {
    blob: BlobLocator,
    index: usize,
}

type DecodeFuture = BoxFuture<'static, StorageResult<Bytes>>;
type DecodeTask = Shared<DecodeFuture>;

struct HeaderRequest {
    blob: BlobLocator,
    reply: oneshot::Sender<StorageResult<Arc<BundleInfo>>>,
}

struct PacketRequest {
    blob: BlobLocator,
    info: Arc<BundleInfo>,
    index: usize,
    reply: oneshot::Sender<StorageResult<Bytes>>,
}

#[derive(Default)]
struct RequestQueue {
    headers: VecDeque<HeaderRequest>,
    packets: VecDeque<PacketRequest>,
}

enum Job {
    Header {
        blob: BlobLocator,
        replies: Vec<oneshot::Sender<StorageResult<Arc<BundleInfo>>>>,
    },
    Packets {
        blob: BlobLocator,
        info: Arc<BundleInfo>,
        indices: Vec<usize>,
        requests: Vec<(usize, oneshot::Sender<StorageResult<Bytes>>)>,
    },
}

/// Entry-bounded cache that may be disabled.
struct Tier<K: Eq + Hash + Clone, V> {
    cache: Option<Mutex<SieveCache<K, V>>>,
}

impl<K, V> Tier<K, V>
where
    K: Eq + Hash + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn new(capacity: Option<usize>) -> Self {
        let cache = capacity
            .and_then(|capacity| SieveCache::new(capacity).ok())
            .map(Mutex::new);
        Self { cache }
    }

    fn get(&self, key: &K) -> Option<V> {
        let cache = self.cache.as_ref()?;
        cache.lock().expect("reader cache lock poisoned").get(key).cloned()
    }

    fn insert(&self, key: K, value: V) {
        if let Some(cache) = &self.cache {
            cache.lock().expect("reader cache lock poisoned").insert(key, value);
        }
    }
}

struct ReaderShared {
    backend: Arc<dyn StorageBackend>,
    config: ReaderConfig,
    queue: Mutex<RequestQueue>,
    wakeup: Notify,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
    headers: Tier<BlobLocator, Arc<BundleInfo>>,
    encoded: Tier<PacketKey, Bytes>,
    decoded: Tier<PacketKey, Bytes>,
    /// In-flight decodes. Only awaiting callers keep a decode alive.
    decodes: Mutex<HashMap<PacketKey, WeakShared<DecodeFuture>>>,
}

/// Cancels the dispatcher when the last reader clone goes away.
struct ReaderHandle {
    shared: Arc<ReaderShared>,
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

/// Reads nodes, headers and packets from persisted bundles.
///
/// Cloning is cheap; all clones share the dispatcher and caches. Must be
/// created inside a Tokio runtime.
#[derive(Clone)]
pub struct BundleReader {
    inner: Arc<ReaderHandle>,
}

impl BundleReader {
    pub fn new(backend: Arc<dyn StorageBackend>, config: ReaderConfig) -> Self {
        let cache = config.cache.clone();
        let shared = Arc::new(ReaderShared {
            permits: Arc::new(Semaphore::new(config.max_concurrent_reads.max(1))),
            headers: Tier::new(cache.as_ref().map(|c| c.header_count)),
            encoded: Tier::new(cache.as_ref().map(|c| c.encoded_packet_count)),
            decoded: Tier::new(cache.as_ref().map(|c| c.decoded_packet_count)),
            backend,
            config,
            queue: Mutex::new(RequestQueue::default()),
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
            decodes: Mutex::new(HashMap::new()),
        });
        tokio::spawn(run_dispatcher(Arc::clone(&shared)));
        Self {
            inner: Arc::new(ReaderHandle { shared }),
        }
    }

    fn shared(&self) -> &Arc<ReaderShared> {
        &self.inner.shared
    }

    pub fn config(&self) -> &ReaderConfig {
        &self.shared().config
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        Arc::clone(&self.shared().backend)
    }

    /// Stop the dispatcher. Queued and later requests fail with
    /// [`StorageError::ReaderClosed`].
    pub fn shutdown(&self) {
        self.shared().shutdown.cancel();
    }

    /// Fetch and parse a bundle header.
    pub async fn read_header(&self, blob: &BlobLocator) -> StorageResult<Arc<BundleInfo>> {
        self.shared().read_header(&blob.base()).await
    }

    /// Fetch one decoded packet.
    pub async fn read_packet(&self, blob: &BlobLocator, index: usize) -> StorageResult<Bytes> {
        let blob = blob.base();
        let info = self.shared().read_header(&blob).await?;
        ReaderShared::read_packet(self.shared(), blob, info, index).await
    }

    /// Resolve a node: its bytes, type and handles to its references.
    pub async fn read_node(&self, locator: &NodeLocator) -> StorageResult<NodeData> {
        let blob = locator.blob.base();
        let info = self.shared().read_header(&blob).await?;
        let header = &info.header;

        let export = header.exports.get(locator.export_index).ok_or_else(|| {
            StorageError::ExportOutOfRange {
                locator: blob.clone(),
                index: locator.export_index,
                count: header.exports.len(),
            }
        })?;
        let blob_type = *header.types.get(export.type_index as usize).ok_or_else(|| {
            StorageError::Decode(format!(
                "export {} of {blob} names type {}, header has {}",
                locator.export_index,
                export.type_index,
                header.types.len()
            ))
        })?;

        let mut refs = Vec::with_capacity(export.refs.len());
        for r in &export.refs {
            let target = match r.import() {
                None => blob.clone(),
                Some(index) => header.imports.get(index).cloned().ok_or_else(|| {
                    StorageError::ImportOutOfRange {
                        locator: blob.clone(),
                        index,
                        count: header.imports.len(),
                    }
                })?,
            };
            let node = NodeLocator::new(r.hash, target, r.node_index as usize);
            refs.push(BlobHandle::from_locator(node, self.clone()));
        }

        let packet = ReaderShared::read_packet(
            self.shared(),
            blob.clone(),
            Arc::clone(&info),
            export.packet_index as usize,
        )
        .await?;
        let start = export.offset as usize;
        let end = start + export.length as usize;
        if end > packet.len() {
            return Err(StorageError::ExportOutsidePacket {
                locator: blob,
                index: locator.export_index,
            });
        }

        Ok(NodeData {
            hash: export.hash,
            blob_type,
            data: packet.slice(start..end),
            refs,
            locator: Some(locator.clone()),
        })
    }
}

impl ReaderShared {
    async fn read_header(&self, blob: &BlobLocator) -> StorageResult<Arc<BundleInfo>> {
        if let Some(info) = self.headers.get(blob) {
            return Ok(info);
        }
        let (reply, response) = oneshot::channel();
        self.enqueue(|queue| {
            queue.headers.push_back(HeaderRequest {
                blob: blob.clone(),
                reply,
            })
        });
        response.await.unwrap_or(Err(StorageError::ReaderClosed))
    }

    async fn read_packet(
        shared: &Arc<Self>,
        blob: BlobLocator,
        info: Arc<BundleInfo>,
        index: usize,
    ) -> StorageResult<Bytes> {
        if index >= info.header.packets.len() {
            return Err(StorageError::PacketOutOfRange {
                locator: blob,
                index,
                count: info.header.packets.len(),
            });
        }
        let key = PacketKey { blob, index };
        if let Some(decoded) = shared.decoded.get(&key) {
            return Ok(decoded);
        }

        let task = {
            let mut decodes = shared.decodes.lock().expect("decode map lock poisoned");
            match decodes.get(&key).and_then(WeakShared::upgrade) {
                Some(task) => task,
                None => {
                    // Drop decodes every caller walked away from.
                    decodes.retain(|_, task| task.upgrade().is_some());
                    let task = Self::decode_task(Arc::clone(shared), key.clone(), info);
                    if let Some(weak) = task.downgrade() {
                        decodes.insert(key, weak);
                    }
                    task
                }
            }
        };
        task.await
    }

    /// A shareable fetch-and-decode of one packet. The task removes itself
    /// from the decode map after publishing a successful result to the
    /// decoded cache; failures are not cached. Dropping every clone drops
    /// the queued request with it, and the dispatcher skips it.
    fn decode_task(shared: Arc<Self>, key: PacketKey, info: Arc<BundleInfo>) -> DecodeTask {
        async move {
            let result = shared.fetch_and_decode(&key, info).await;
            if let Ok(decoded) = &result {
                shared.decoded.insert(key.clone(), decoded.clone());
            }
            shared
                .decodes
                .lock()
                .expect("decode map lock poisoned")
                .remove(&key);
            result
        }
        .boxed()
        .shared()
    }

    async fn fetch_and_decode(&self, key: &PacketKey, info: Arc<BundleInfo>) -> StorageResult<Bytes> {
        let packet = info.header.packets[key.index];
        let encoded = match self.encoded.get(key) {
            Some(encoded) => encoded,
            None => {
                let (reply, response) = oneshot::channel();
                self.enqueue(|queue| {
                    queue.packets.push_back(PacketRequest {
                        blob: key.blob.clone(),
                        info,
                        index: key.index,
                        reply,
                    })
                });
                response.await.unwrap_or(Err(StorageError::ReaderClosed))?
            }
        };
        let decoded = tokio::task::spawn_blocking(move || packet.decode(&encoded))
            .await
            .map_err(|e| StorageError::Decode(e.to_string()))??;
        Ok(Bytes::from(decoded))
    }

    fn enqueue(&self, push: impl FnOnce(&mut RequestQueue)) {
        push(&mut self.queue.lock().expect("reader queue lock poisoned"));
        if self.shutdown.is_cancelled() {
            self.fail_queued();
        } else {
            self.wakeup.notify_one();
        }
    }

    fn fail_queued(&self) {
        let queue = std::mem::take(&mut *self.queue.lock().expect("reader queue lock poisoned"));
        for request in queue.headers {
            let _ = request.reply.send(Err(StorageError::ReaderClosed));
        }
        for request in queue.packets {
            let _ = request.reply.send(Err(StorageError::ReaderClosed));
        }
    }

    /// Take the next unit of work. Requests whose caller went away are
    /// dropped here.
    fn next_job(&self) -> Option<Job> {
        let mut queue = self.queue.lock().expect("reader queue lock poisoned");

        while let Some(request) = queue.headers.pop_front() {
            if request.reply.is_closed() {
                continue;
            }
            let blob = request.blob;
            let mut replies = vec![request.reply];
            let mut rest = VecDeque::with_capacity(queue.headers.len());
            for other in queue.headers.drain(..) {
                if other.blob == blob {
                    replies.push(other.reply);
                } else {
                    rest.push_back(other);
                }
            }
            queue.headers = rest;
            return Some(Job::Header { blob, replies });
        }

        while let Some(request) = queue.packets.pop_front() {
            if request.reply.is_closed() {
                continue;
            }
            let indices = self.coalesce_range(&request.info, request.index);
            let first = indices[0];
            let last = indices[indices.len() - 1];
            let blob = request.blob;
            let info = request.info;
            let mut requests = vec![(request.index, request.reply)];
            let mut rest = VecDeque::with_capacity(queue.packets.len());
            for other in queue.packets.drain(..) {
                if other.blob == blob && (first..=last).contains(&other.index) {
                    if !other.reply.is_closed() {
                        requests.push((other.index, other.reply));
                    }
                } else {
                    rest.push_back(other);
                }
            }
            queue.packets = rest;
            return Some(Job::Packets {
                blob,
                info,
                indices,
                requests,
            });
        }
        None
    }

    /// Packet `index` plus as many following packets as fit in one read.
    fn coalesce_range(&self, info: &BundleInfo, index: usize) -> Vec<usize> {
        let packets = &info.header.packets;
        let mut start = packets[index].encoded_offset as u64;
        let mut end = packets[index].encoded_end();
        let mut indices = vec![index];
        for next in index + 1..packets.len() {
            let candidate_start = start.min(packets[next].encoded_offset as u64);
            let candidate_end = end.max(packets[next].encoded_end());
            if candidate_end - candidate_start > self.config.max_packet_fetch_size as u64 {
                break;
            }
            start = candidate_start;
            end = candidate_end;
            indices.push(next);
        }
        indices
    }

    async fn run_job(&self, job: Job) {
        match job {
            Job::Header { blob, replies } => {
                let result = self.fetch_header(&blob).await;
                if let Err(e) = &result {
                    warn!(locator = %blob, error = %e, "bundle header read failed");
                }
                for reply in replies {
                    let _ = reply.send(result.clone());
                }
            }
            Job::Packets {
                blob,
                info,
                indices,
                requests,
            } => match self.fetch_packets(&blob, &info, &indices).await {
                Ok(fetched) => {
                    if requests.len() > 1 || indices.len() > 1 {
                        debug!(
                            locator = %blob,
                            packets = indices.len(),
                            requests = requests.len(),
                            "coalesced packet read"
                        );
                    }
                    for (index, reply) in requests {
                        let result = fetched
                            .iter()
                            .find(|(i, _)| *i == index)
                            .map(|(_, data)| data.clone())
                            .ok_or(StorageError::PacketOutOfRange {
                                locator: blob.clone(),
                                index,
                                count: info.header.packets.len(),
                            });
                        let _ = reply.send(result);
                    }
                }
                Err(e) => {
                    warn!(locator = %blob, error = %e, "bundle packet read failed");
                    for (_, reply) in requests {
                        let _ = reply.send(Err(e.clone()));
                    }
                }
            },
        }
    }

    async fn fetch_header(&self, blob: &BlobLocator) -> StorageResult<Arc<BundleInfo>> {
        let prefetch = self.config.header_prefetch_size();
        let mut data = self.backend.read_range(blob, 0, prefetch).await?;
        let length = BundleHeader::header_length(&data)?;
        if data.len() < length {
            debug!(
                locator = %blob,
                prefetched = data.len(),
                header = length,
                "header larger than prefetch window, re-reading"
            );
            data = self.backend.read_range(blob, 0, length).await?;
        }
        let header = BundleHeader::read(&data)?;
        let info = Arc::new(BundleInfo {
            header,
            data_offset: length as u64,
        });

        // Keep packets the prefetch happened to cover.
        for (index, packet) in info.header.packets.iter().enumerate() {
            let start = length + packet.encoded_offset as usize;
            let end = length + packet.encoded_end() as usize;
            if end <= data.len() {
                let key = PacketKey {
                    blob: blob.clone(),
                    index,
                };
                self.encoded.insert(key, data.slice(start..end));
            }
        }
        self.headers.insert(blob.clone(), Arc::clone(&info));
        Ok(info)
    }

    async fn fetch_packets(
        &self,
        blob: &BlobLocator,
        info: &BundleInfo,
        indices: &[usize],
    ) -> StorageResult<Vec<(usize, Bytes)>> {
        let packets = &info.header.packets;
        let start = indices
            .iter()
            .map(|&i| packets[i].encoded_offset as u64)
            .min()
            .unwrap_or(0);
        let end = indices
            .iter()
            .map(|&i| packets[i].encoded_end())
            .max()
            .unwrap_or(start);
        let length = (end - start) as usize;
        let data = self
            .backend
            .read_range(blob, info.data_offset + start, length)
            .await?;
        if data.len() < length {
            return Err(ubn_bundle::BundleError::Truncated {
                needed: length,
                actual: data.len(),
            }
            .into());
        }

        let mut fetched = Vec::with_capacity(indices.len());
        for &index in indices {
            let from = (packets[index].encoded_offset as u64 - start) as usize;
            let slice = data.slice(from..from + packets[index].encoded_length as usize);
            self.encoded.insert(
                PacketKey {
                    blob: blob.clone(),
                    index,
                },
                slice.clone(),
            );
            fetched.push((index, slice));
        }
        Ok(fetched)
    }
}

async fn run_dispatcher(shared: Arc<ReaderShared>) {
    loop {
        let permit = tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            permit = Arc::clone(&shared.permits).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let job = loop {
            if let Some(job) = shared.next_job() {
                break Some(job);
            }
            tokio::select! {
                _ = shared.shutdown.cancelled() => break None,
                _ = shared.wakeup.notified() => {}
            }
        };
        let Some(job) = job else {
            break;
        };
        let worker = Arc::clone(&shared);
        tokio::spawn(async move {
            worker.run_job(job).await;
            drop(permit);
        });
    }
    shared.fail_queued();
    debug!("bundle reader dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;
    use ubn_bundle::{Bundle, BundleCompressionFormat, BundleExport, BundlePacket};
    use ubn_store::{InMemoryStorageBackend, StoreResult};
    use ubn_types::{BlobType, ContentHash};

    use crate::config::ReaderCacheConfig;

    /// Counts reads per blob and can hold reads of one blob.
    struct CountingBackend {
        inner: InMemoryStorageBackend,
        reads: Mutex<HashMap<BlobLocator, usize>>,
        held: Mutex<Option<BlobLocator>>,
        gate: Semaphore,
    }

    impl CountingBackend {
        fn new() -> Self {
            Self {
                inner: InMemoryStorageBackend::new(),
                reads: Mutex::new(HashMap::new()),
                held: Mutex::new(None),
                gate: Semaphore::new(0),
            }
        }

        /// Store a one-node bundle.
        fn put(&self, path: &str, payload: &[u8]) -> BlobLocator {
            let (packet, encoded) =
                BundlePacket::encode(BundleCompressionFormat::None, 0, payload).unwrap();
            let header = BundleHeader::create(
                vec![BlobType::from_u128(0x7e57, 1)],
                vec![],
                vec![BundleExport {
                    type_index: 0,
                    hash: ContentHash::compute(payload),
                    packet_index: 0,
                    offset: 0,
                    length: payload.len() as u32,
                    refs: vec![],
                }],
                vec![packet],
            );
            let bundle = Bundle::new(header, vec![Bytes::from(encoded)]).unwrap();
            let locator = BlobLocator::new(path).unwrap();
            self.inner.insert(&locator, bundle.to_bytes().unwrap());
            locator
        }

        fn reads(&self, locator: &BlobLocator) -> usize {
            self.reads.lock().unwrap().get(locator).copied().unwrap_or(0)
        }

        fn hold(&self, locator: &BlobLocator) {
            *self.held.lock().unwrap() = Some(locator.clone());
        }

        fn release(&self) {
            self.held.lock().unwrap().take();
            self.gate.add_permits(64);
        }
    }

    #[async_trait]
    impl StorageBackend for CountingBackend {
        async fn read_range(
            &self,
            locator: &BlobLocator,
            offset: u64,
            length: usize,
        ) -> StoreResult<Bytes> {
            *self.reads.lock().unwrap().entry(locator.clone()).or_default() += 1;
            let held = self.held.lock().unwrap().as_ref() == Some(locator);
            if held {
                self.gate.acquire().await.unwrap().forget();
            }
            self.inner.read_range(locator, offset, length).await
        }

        async fn write_stream(&self, data: Bytes, prefix: &str) -> StoreResult<BlobLocator> {
            self.inner.write_stream(data, prefix).await
        }
    }

    fn without_packet_caches() -> ReaderConfig {
        ReaderConfig {
            max_concurrent_reads: 1,
            cache: Some(ReaderCacheConfig {
                header_count: 16,
                encoded_packet_count: 0,
                decoded_packet_count: 0,
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn queued_header_requests_share_one_read() {
        let backend = Arc::new(CountingBackend::new());
        let blob = backend.put("bundles/a.ubn", b"packet a");
        let reader = BundleReader::new(backend.clone(), ReaderConfig::uncached());

        let reads = (0..8).map(|_| reader.read_header(&blob));
        for info in futures::future::join_all(reads).await {
            assert_eq!(info.unwrap().header.exports.len(), 1);
        }
        assert_eq!(backend.reads(&blob), 1);
    }

    #[tokio::test]
    async fn concurrent_reads_of_one_packet_share_one_fetch() {
        let backend = Arc::new(CountingBackend::new());
        let blob = backend.put("bundles/a.ubn", b"packet a");
        let reader = BundleReader::new(backend.clone(), ReaderConfig::uncached());

        let reads = (0..8).map(|_| reader.read_packet(&blob, 0));
        for packet in futures::future::join_all(reads).await {
            assert_eq!(&packet.unwrap()[..], b"packet a");
        }
        // One header read, one packet read.
        assert_eq!(backend.reads(&blob), 2);
        assert!(reader.shared().decodes.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn abandoned_packet_read_is_never_fetched() {
        let backend = Arc::new(CountingBackend::new());
        let a = backend.put("bundles/a.ubn", b"packet a");
        let b = backend.put("bundles/b.ubn", b"packet b");
        let reader = BundleReader::new(backend.clone(), without_packet_caches());
        reader.read_header(&a).await.unwrap();
        assert_eq!(backend.reads(&a), 1);

        // Occupy the only read slot.
        backend.hold(&b);
        let header_b = tokio::spawn({
            let reader = reader.clone();
            let b = b.clone();
            async move { reader.read_header(&b).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let packet_a = tokio::spawn({
            let reader = reader.clone();
            let a = a.clone();
            async move { reader.read_packet(&a, 0).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        packet_a.abort();
        assert!(packet_a.await.unwrap_err().is_cancelled());

        backend.release();
        header_b.await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(backend.reads(&a), 1);
        assert!(reader
            .shared()
            .decodes
            .lock()
            .unwrap()
            .values()
            .all(|task| task.upgrade().is_none()));

        assert_eq!(&reader.read_packet(&a, 0).await.unwrap()[..], b"packet a");
        assert_eq!(backend.reads(&a), 2);
        assert!(reader.shared().decodes.lock().unwrap().is_empty());
    }

    #[test]
    fn disabled_tiers_store_nothing() {
        let tier: Tier<u32, u32> = Tier::new(Some(0));
        tier.insert(1, 1);
        assert_eq!(tier.get(&1), None);

        let tier: Tier<u32, u32> = Tier::new(Some(2));
        tier.insert(1, 10);
        assert_eq!(tier.get(&1), Some(10));
    }
}
