//! Reader traits and shared per-chunk read state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use bytes::Bytes;

use crate::chunk_meta::CachedChunkMeta;
use crate::lookup_table::LookupHashTable;
use crate::row::VersionedRow;

/// A batch-oriented reader of versioned rows in key order. `Ok(None)`
/// marks the end of the stream.
#[async_trait]
pub trait VersionedReader: Send {
    async fn read(&mut self, max_rows: usize) -> Result<Option<Vec<VersionedRow>>, Error>;
}

/// Per-chunk view of an uncompressed block cache.
///
/// Cache-based readers never go to disk: a missing block is a contract
/// violation, not a recoverable miss.
pub trait BlockCache: Send + Sync {
    fn find_block(&self, block_index: u32) -> Option<Bytes>;
}

/// Trivial block cache over a preloaded block list, used when the caller
/// already holds every block of the chunk.
pub struct PresetBlockCache {
    start_block_index: u32,
    blocks: Vec<Bytes>,
}

impl PresetBlockCache {
    pub fn new(start_block_index: u32, blocks: Vec<Bytes>) -> Self {
        Self {
            start_block_index,
            blocks,
        }
    }
}

impl BlockCache for PresetBlockCache {
    fn find_block(&self, block_index: u32) -> Option<Bytes> {
        block_index
            .checked_sub(self.start_block_index)
            .and_then(|index| self.blocks.get(index as usize))
            .cloned()
    }
}

/// Performance counters shared by the readers of one store.
#[derive(Default)]
pub struct PerformanceCounters {
    pub static_chunk_row_lookup_count: AtomicU64,
    pub static_chunk_row_lookup_false_positive_count: AtomicU64,
    pub static_chunk_row_read_count: AtomicU64,
    pub static_chunk_row_read_data_weight: AtomicU64,
}

impl PerformanceCounters {
    pub fn lookups(&self) -> u64 {
        self.static_chunk_row_lookup_count.load(Ordering::Relaxed)
    }

    pub fn lookup_false_positives(&self) -> u64 {
        self.static_chunk_row_lookup_false_positive_count
            .load(Ordering::Relaxed)
    }

    pub fn rows_read(&self) -> u64 {
        self.static_chunk_row_read_count.load(Ordering::Relaxed)
    }
}

/// Everything a cache-based reader needs to know about one chunk.
pub struct ChunkState {
    pub meta: Arc<CachedChunkMeta>,
    pub block_cache: Arc<dyn BlockCache>,
    pub lookup_table: Option<Arc<LookupHashTable>>,
    pub counters: Arc<PerformanceCounters>,
}

impl ChunkState {
    pub fn new(meta: Arc<CachedChunkMeta>, block_cache: Arc<dyn BlockCache>) -> Arc<Self> {
        Arc::new(Self {
            meta,
            block_cache,
            lookup_table: None,
            counters: Arc::new(PerformanceCounters::default()),
        })
    }

    pub fn with_lookup_table(
        meta: Arc<CachedChunkMeta>,
        block_cache: Arc<dyn BlockCache>,
        lookup_table: Arc<LookupHashTable>,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            block_cache,
            lookup_table: Some(lookup_table),
            counters: Arc::new(PerformanceCounters::default()),
        })
    }
}

/// Common read parameters.
#[derive(Clone)]
pub struct ReadOptions {
    pub timestamp: crate::row::Timestamp,
    pub produce_all_versions: bool,
    pub column_filter: crate::schema::ColumnFilter,
}

impl Default for ReadOptions {
    fn default() -> Self {
        Self {
            timestamp: crate::row::MAX_TIMESTAMP,
            produce_all_versions: false,
            column_filter: crate::schema::ColumnFilter::Universal,
        }
    }
}
