//! Adapters binding the versioned reader core to the local chunk
//! storage: block caches, prioritized chunk block readers and a chunk
//! fragment reader over the block store.

use std::sync::Arc;

use anyhow::{bail, Error};
use async_trait::async_trait;
use bytes::Bytes;

use dn_api_types::{BlockId, ChunkId, WorkloadCategory};
use dn_datastore::block_store::BlockStore;
use dn_datastore::chunk_store::ChunkStore;
use dn_table::block_fetcher::ChunkBlockReader;
use dn_table::chunk_meta::CachedChunkMeta;
use dn_table::hunks::{ChunkFragmentReader, FragmentRequest};
use dn_table::lookup_table::build_lookup_hash_table;
use dn_table::reader::{BlockCache, ChunkState, PerformanceCounters};

/// Cache-only block view of one chunk; the contract of the cache-based
/// readers is that every reachable block is already resident.
pub struct BlockStoreBlockCache {
    block_store: Arc<BlockStore>,
    chunk_id: ChunkId,
}

impl BlockStoreBlockCache {
    pub fn new(block_store: Arc<BlockStore>, chunk_id: ChunkId) -> Arc<Self> {
        Arc::new(Self {
            block_store,
            chunk_id,
        })
    }
}

impl BlockCache for BlockStoreBlockCache {
    fn find_block(&self, block_index: u32) -> Option<Bytes> {
        self.block_store
            .find_cached_block(BlockId::new(self.chunk_id, block_index))
    }
}

/// Priority-tagged disk access to one chunk's blocks, for the streaming
/// readers.
pub struct BlockStoreChunkReader {
    block_store: Arc<BlockStore>,
    chunk_id: ChunkId,
    workload: WorkloadCategory,
}

impl BlockStoreChunkReader {
    pub fn new(
        block_store: Arc<BlockStore>,
        chunk_id: ChunkId,
        workload: WorkloadCategory,
    ) -> Arc<Self> {
        Arc::new(Self {
            block_store,
            chunk_id,
            workload,
        })
    }
}

#[async_trait]
impl ChunkBlockReader for BlockStoreChunkReader {
    async fn read_blocks(
        &self,
        first_block_index: u32,
        block_count: u32,
        priority: i64,
    ) -> Result<Vec<Bytes>, Error> {
        let blocks = self
            .block_store
            .find_blocks(
                self.chunk_id,
                first_block_index,
                block_count,
                priority,
                self.workload,
            )
            .await?;
        if blocks.len() != block_count as usize {
            bail!(
                "chunk {} is missing blocks {}..{}",
                self.chunk_id,
                first_block_index,
                first_block_index + block_count,
            );
        }
        Ok(blocks)
    }
}

/// Reads hunk fragments out of locally stored hunk chunks by fetching the
/// covering block and slicing the requested range.
pub struct BlockStoreFragmentReader {
    block_store: Arc<BlockStore>,
}

impl BlockStoreFragmentReader {
    pub fn new(block_store: Arc<BlockStore>) -> Arc<Self> {
        Arc::new(Self { block_store })
    }
}

#[async_trait]
impl ChunkFragmentReader for BlockStoreFragmentReader {
    async fn read_fragments(&self, requests: Vec<FragmentRequest>) -> Result<Vec<Bytes>, Error> {
        let mut fragments = Vec::with_capacity(requests.len());
        for request in requests {
            let Some(block) = self
                .block_store
                .find_block(request.chunk_id, request.block_index, 0, true)
                .await?
            else {
                bail!(
                    "hunk chunk {} block {} is not on this node",
                    request.chunk_id,
                    request.block_index,
                );
            };
            let start = request.block_offset as usize;
            let end = start + request.length as usize;
            if end > block.len() {
                bail!(
                    "hunk fragment {}..{end} is out of bounds for block {}:{} ({} bytes)",
                    start,
                    request.chunk_id,
                    request.block_index,
                    block.len(),
                );
            }
            fragments.push(block.slice(start..end));
        }
        Ok(fragments)
    }
}

/// Assemble the shared read state of a table chunk: cached meta, a block
/// cache view and optionally the lookup hash table (which requires every
/// block to be pulled into the cache first).
pub async fn load_chunk_state(
    store: &Arc<ChunkStore>,
    block_store: &Arc<BlockStore>,
    chunk_id: ChunkId,
    build_lookup: bool,
) -> Result<Arc<ChunkState>, Error> {
    let chunk = store.get_chunk(chunk_id)?;
    let meta = chunk.get_meta(0, None).await?;
    let table_meta = Arc::new(CachedChunkMeta::parse(chunk_id, &meta)?);

    let block_cache = BlockStoreBlockCache::new(Arc::clone(block_store), chunk_id);

    if !build_lookup {
        return Ok(ChunkState::new(table_meta, block_cache));
    }

    // pull every block into the cache so the table build and subsequent
    // lookups never touch the disk path
    for block_index in 0..table_meta.block_count() {
        if block_store
            .find_block(chunk_id, block_index, 0, true)
            .await?
            .is_none()
        {
            bail!("chunk {chunk_id} block {block_index} is not on this node");
        }
    }

    let lookup_table = build_lookup_hash_table(&table_meta, |block_index| {
        block_store.find_cached_block(BlockId::new(chunk_id, block_index))
    });

    Ok(match lookup_table {
        Some(table) => ChunkState::with_lookup_table(table_meta, block_cache, Arc::new(table)),
        None => Arc::new(ChunkState {
            meta: table_meta,
            block_cache,
            lookup_table: None,
            counters: Arc::new(PerformanceCounters::default()),
        }),
    })
}
