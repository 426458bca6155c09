//! Block store: the SLRU cache of uncompressed blocks in front of the
//! chunk bodies.
//!
//! Cache misses with caching enabled go through an insertion cookie so
//! that concurrent readers of the same block trigger a single disk read.
//! Because cached blocks of removed chunks are not evicted eagerly, a
//! block may be put again later; the payloads must then be bitwise
//! identical or the node is serving corrupt data and must die.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use anyhow::Error;
use bytes::Bytes;

use dn_api_types::{BlockCacheConfig, BlockId, ChunkId, NodeDescriptor, WorkloadCategory};
use dn_tools::slru_cache::{AsyncSlruCache, InsertOutcome};

use crate::chunk::ChunkReadGuard;
use crate::chunk_store::ChunkRegistry;

/// One cached block: payload plus the node it was fetched from, when it
/// arrived through peer replication rather than local disk.
#[derive(Clone)]
pub struct CachedBlock {
    pub data: Bytes,
    pub source: Option<NodeDescriptor>,
}

fn block_weight(block: &CachedBlock) -> u64 {
    block.data.len() as u64
}

/// Node-wide pending disk-read byte accounting, shared between the block
/// store and the chunk read paths.
pub struct PendingReadTracker {
    size: AtomicI64,
}

impl PendingReadTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            size: AtomicI64::new(0),
        })
    }

    pub fn pending_read_size(&self) -> i64 {
        self.size.load(Ordering::SeqCst)
    }

    pub fn increase(self: &Arc<Self>, delta: i64) -> PendingReadSizeGuard {
        debug_assert!(delta >= 0);
        let result = self.size.fetch_add(delta, Ordering::SeqCst) + delta;
        log::trace!("pending read size updated (pending: {result}, delta: {delta})");
        PendingReadSizeGuard {
            tracker: Some(Arc::clone(self)),
            size: delta,
        }
    }
}

pub struct PendingReadSizeGuard {
    tracker: Option<Arc<PendingReadTracker>>,
    size: i64,
}

impl PendingReadSizeGuard {
    pub fn size(&self) -> i64 {
        self.size
    }
}

impl Drop for PendingReadSizeGuard {
    fn drop(&mut self) {
        if let Some(tracker) = self.tracker.take() {
            let result = tracker.size.fetch_sub(self.size, Ordering::SeqCst) - self.size;
            log::trace!(
                "pending read size updated (pending: {result}, delta: -{})",
                self.size
            );
        }
    }
}

pub struct BlockStore {
    cache: AsyncSlruCache<BlockId, CachedBlock>,
    registry: Arc<ChunkRegistry>,
    pending_read_tracker: Arc<PendingReadTracker>,
}

impl BlockStore {
    pub fn new(
        config: &BlockCacheConfig,
        registry: Arc<ChunkRegistry>,
        pending_read_tracker: Arc<PendingReadTracker>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache: AsyncSlruCache::new(config.capacity, config.younger_size_fraction),
            registry,
            pending_read_tracker,
        })
    }

    pub fn pending_read_tracker(&self) -> &Arc<PendingReadTracker> {
        &self.pending_read_tracker
    }

    pub fn pending_read_size(&self) -> i64 {
        self.pending_read_tracker.pending_read_size()
    }

    pub fn cache_hit_count(&self) -> u64 {
        self.cache.hit_count()
    }

    pub fn cached_block_weight(&self) -> u64 {
        self.cache.weight()
    }

    /// Find one block: cache first, then (with caching enabled, through an
    /// insertion cookie) a prioritized disk read. Returns `None` when
    /// neither the cache nor the registry knows the block. Peer-received
    /// blocks may be cached without their chunk being present, which is
    /// why the cache is probed before the registry.
    pub async fn find_block(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        block_index: u32,
        priority: i64,
        enable_caching: bool,
    ) -> Result<Option<Bytes>, Error> {
        let block_id = BlockId::new(chunk_id, block_index);

        if let Some(cached) = self.cache.find(&block_id) {
            log::debug!("block cache hit (block: {block_id})");
            return Ok(Some(cached.data));
        }

        if enable_caching {
            match self.cache.begin_insert(block_id, block_weight) {
                InsertOutcome::Waiter(waiter) => {
                    let cached = waiter.await?;
                    log::debug!("block cache hit (block: {block_id})");
                    return Ok(Some(cached.data));
                }
                InsertOutcome::Inserter(cookie) => {
                    return match self.read_block_from_chunk(chunk_id, block_index, priority).await
                    {
                        Ok(Some(data)) => {
                            cookie.complete(CachedBlock {
                                data: data.clone(),
                                source: None,
                            });
                            Ok(Some(data))
                        }
                        Ok(None) => {
                            // nothing to cache; waiters retry and see the
                            // same absence
                            cookie.fail(anyhow::format_err!(
                                "block {block_id} is not on this node"
                            ));
                            Ok(None)
                        }
                        Err(err) => {
                            cookie.fail(anyhow::format_err!("{err:#}"));
                            Err(err)
                        }
                    };
                }
            }
        }

        self.read_block_from_chunk(chunk_id, block_index, priority)
            .await
    }

    async fn read_block_from_chunk(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        block_index: u32,
        priority: i64,
    ) -> Result<Option<Bytes>, Error> {
        let Some(chunk) = self.registry.find_chunk(chunk_id) else {
            return Ok(None);
        };

        let Some(guard) = ChunkReadGuard::try_acquire(&chunk) else {
            return Ok(None);
        };

        let blocks = chunk
            .read_blocks(block_index, 1, priority, WorkloadCategory::Batch)
            .await?;
        drop(guard);

        Ok(blocks.into_iter().next())
    }

    /// Bulk fetch for replication and repair; bypasses the cache.
    pub async fn find_blocks(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        first_block_index: u32,
        block_count: u32,
        priority: i64,
        workload: WorkloadCategory,
    ) -> Result<Vec<Bytes>, Error> {
        let Some(chunk) = self.registry.find_chunk(chunk_id) else {
            return Ok(Vec::new());
        };

        let Some(guard) = ChunkReadGuard::try_acquire(&chunk) else {
            return Err(anyhow::Error::new(dn_api_types::ErrorKind::NoSuchChunk(
                chunk_id,
            ))
            .context(format!(
                "cannot read chunk {chunk_id} since it is scheduled for removal"
            )));
        };

        let blocks = chunk
            .read_blocks(first_block_index, block_count, priority, workload)
            .await?;
        drop(guard);
        Ok(blocks)
    }

    /// Cache a block received from elsewhere (peer push, session write).
    ///
    /// Putting a different payload under an existing key is a fatal logic
    /// error: the node would be serving inconsistent data.
    pub fn put_block(&self, block_id: BlockId, data: Bytes, source: Option<NodeDescriptor>) {
        if let Some(existing) = self.cache.peek(&block_id) {
            if existing.data != data {
                panic!(
                    "trying to cache block {block_id} for which a different cached copy already exists"
                );
            }
            log::debug!("block is resurrected in cache (block: {block_id})");
            return;
        }

        let weight = data.len() as u64;
        log::debug!(
            "block is put into cache (block: {block_id}, size: {weight}, source: {})",
            source
                .as_ref()
                .map(|s| s.address.as_str())
                .unwrap_or("<local>"),
        );
        self.cache.insert(block_id, CachedBlock { data, source }, weight);
    }

    /// Cache probe without any disk fallback.
    pub fn find_cached_block(&self, block_id: BlockId) -> Option<Bytes> {
        self.cache.find(&block_id).map(|cached| cached.data)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::chunk::{Chunk, ChunkContext};
    use crate::format::BlobWriter;
    use crate::location::test_util::{panic_on_disable_hook, test_store_config};
    use crate::location::Location;
    use crate::reader_cache::BlobReaderCache;
    use dn_api_types::{ChunkDescriptor, ChunkMeta, ObjectType};
    use dn_tools::memory_tracker::MemoryTracker;

    struct Fixture {
        store: Arc<BlockStore>,
        registry: Arc<ChunkRegistry>,
        location: Arc<Location>,
        ctx: Arc<ChunkContext>,
        dir: std::path::PathBuf,
    }

    async fn make_fixture(tag: &str) -> Fixture {
        let dir = std::env::temp_dir().join(format!(
            "dn-block-store-test-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();

        let config = test_store_config(&dir);
        let location = Location::new_store(&format!("bs-{tag}"), &config, panic_on_disable_hook());
        location.scan().await;

        let pending = PendingReadTracker::new();
        let ctx = Arc::new(ChunkContext {
            memory_tracker: MemoryTracker::new(64 * 1024 * 1024),
            reader_cache: BlobReaderCache::new(16),
            pending_read_tracker: Arc::clone(&pending),
            max_blocks_per_read: 1000,
            max_bytes_per_read: 64 * 1024 * 1024,
        });
        let registry = Arc::new(ChunkRegistry::new());
        let store = BlockStore::new(&BlockCacheConfig::default(), Arc::clone(&registry), pending);

        Fixture {
            store,
            registry,
            location,
            ctx,
            dir,
        }
    }

    fn seed_chunk(fixture: &Fixture, chunk_id: ChunkId, blocks: &[&[u8]]) -> Arc<Chunk> {
        let data_path = fixture.location.chunk_path(chunk_id);
        let mut writer = BlobWriter::create(&data_path).unwrap();
        for block in blocks {
            writer.append_block(block).unwrap();
        }
        let meta = writer.finish(ChunkMeta::default()).unwrap();

        let chunk = Chunk::new_blob(
            Arc::clone(&fixture.ctx),
            Arc::clone(&fixture.location),
            &ChunkDescriptor {
                id: chunk_id,
                disk_space: meta.total_block_size(),
                row_count: None,
                sealed: None,
            },
            None,
        );
        fixture.registry.register_chunk(Arc::clone(&chunk)).unwrap();
        chunk
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_seeded_block_serves_from_cache() {
        let fixture = make_fixture("seeded").await;
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0xab01);
        let block_id = BlockId::new(chunk_id, 3);

        fixture
            .store
            .put_block(block_id, Bytes::from_static(b"payload"), None);

        let hits_before = fixture.store.cache_hit_count();
        let (a, b) = tokio::join!(
            fixture.store.find_block(chunk_id, 3, 0, true),
            fixture.store.find_block(chunk_id, 3, 0, true),
        );
        assert_eq!(a.unwrap().unwrap(), Bytes::from_static(b"payload"));
        assert_eq!(b.unwrap().unwrap(), Bytes::from_static(b"payload"));
        // both calls were cache hits
        assert_eq!(fixture.store.cache_hit_count(), hits_before + 2);

        std::fs::remove_dir_all(&fixture.dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_miss_reads_from_disk_and_caches() {
        let fixture = make_fixture("miss").await;
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0xab02);
        seed_chunk(&fixture, chunk_id, &[b"b0", b"b1", b"b2"]);

        let found = fixture
            .store
            .find_block(chunk_id, 1, 0, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&found[..], b"b1");

        // second read is served from cache
        let hits_before = fixture.store.cache_hit_count();
        let again = fixture
            .store
            .find_block(chunk_id, 1, 0, true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again, found);
        assert_eq!(fixture.store.cache_hit_count(), hits_before + 1);

        // unknown chunk yields empty
        let absent_chunk = ChunkId::new(ObjectType::Blob, 1, 0xffff);
        assert!(fixture
            .store
            .find_block(absent_chunk, 0, 0, true)
            .await
            .unwrap()
            .is_none());

        std::fs::remove_dir_all(&fixture.dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_find_blocks_bypasses_cache() {
        let fixture = make_fixture("range").await;
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0xab03);
        let chunk = seed_chunk(&fixture, chunk_id, &[b"r0", b"r1", b"r2", b"r3"]);

        let blocks = fixture
            .store
            .find_blocks(chunk_id, 1, 2, 0, WorkloadCategory::Replication)
            .await
            .unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(&blocks[0][..], b"r1");
        assert_eq!(fixture.store.cached_block_weight(), 0);

        // a chunk scheduled for removal refuses bulk reads
        let _removal = chunk.schedule_remove();
        let err = fixture
            .store
            .find_blocks(chunk_id, 0, 1, 0, WorkloadCategory::Replication)
            .await
            .unwrap_err();
        assert!(matches!(
            dn_api_types::error_kind(&err),
            Some(dn_api_types::ErrorKind::NoSuchChunk(_))
        ));

        std::fs::remove_dir_all(&fixture.dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    #[should_panic(expected = "different cached copy")]
    async fn test_put_block_mismatch_is_fatal() {
        let fixture = make_fixture("mismatch").await;
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0xab04);
        let block_id = BlockId::new(chunk_id, 0);

        fixture
            .store
            .put_block(block_id, Bytes::from_static(b"original"), None);
        // identical duplicate is fine
        fixture
            .store
            .put_block(block_id, Bytes::from_static(b"original"), None);
        // a different payload is not
        fixture
            .store
            .put_block(block_id, Bytes::from_static(b"DIFFERENT"), None);
    }
}
