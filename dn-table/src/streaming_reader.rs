//! Streaming range reader with block prefetch.
//!
//! Unlike the cache-based readers this one does not assume block
//! residency: it walks exactly the block set reachable from the range,
//! pulling blocks through a [`BlockFetcher`] bounded by a memory window.
//! Row-index bounds are precomputed: everything below
//! `safe_upper_row_index` is inside the range, everything at or above
//! `hard_upper_row_index` is outside, and only the rows in between need a
//! per-row key comparison against the upper bound.

use std::hash::Hasher;
use std::sync::Arc;

use anyhow::Error;
use async_trait::async_trait;
use siphasher::sip::SipHasher13;

use dn_api_types::ChunkId;

use crate::block_fetcher::{BlockFetcher, BlockInfo, ChunkBlockReader};
use crate::block_format::BlockReader;
use crate::chunk_meta::CachedChunkMeta;
use crate::reader::{ReadOptions, VersionedReader};
use crate::row::{Key, VersionedRow};

/// Deterministic Bernoulli sampler: whether a block participates depends
/// only on `(chunk id, sampling seed, block index)`.
pub struct BernoulliSampler {
    rate: f64,
    seed: u64,
}

impl BernoulliSampler {
    pub fn new(rate: f64, chunk_id: ChunkId, sampling_seed: u64) -> Self {
        let mut hasher = SipHasher13::new_with_keys(sampling_seed, 0x73616d70);
        hasher.write(&chunk_id.to_bytes());
        Self {
            rate: rate.clamp(0.0, 1.0),
            seed: hasher.finish(),
        }
    }

    pub fn sample(&self, index: u64) -> bool {
        let mut hasher = SipHasher13::new_with_keys(self.seed, index);
        hasher.write_u64(index);
        let draw = hasher.finish() as f64 / u64::MAX as f64;
        draw < self.rate
    }
}

/// Configuration of one streaming read.
pub struct StreamingReadConfig {
    /// Target bytes of fetched-but-unconsumed blocks.
    pub window_size: u64,
    /// Optional Bernoulli block sampling rate.
    pub sampling_rate: Option<f64>,
    pub sampling_seed: u64,
}

impl Default for StreamingReadConfig {
    fn default() -> Self {
        Self {
            window_size: 16 * 1024 * 1024,
            sampling_rate: None,
            sampling_seed: 0,
        }
    }
}

pub struct StreamingRangeReader {
    meta: Arc<CachedChunkMeta>,
    options: ReadOptions,
    lower_bound: Key,
    upper_bound: Key,

    fetcher: BlockFetcher,
    current_block: Option<(BlockReader, u64 /* start row index */)>,
    first_block: bool,

    safe_upper_row_index: u64,
    hard_upper_row_index: u64,
    finished: bool,
}

impl StreamingRangeReader {
    pub fn new(
        chunk_reader: Arc<dyn ChunkBlockReader>,
        meta: Arc<CachedChunkMeta>,
        range: (Key, Key),
        options: ReadOptions,
        config: StreamingReadConfig,
        priority: i64,
    ) -> Self {
        let (lower_bound, upper_bound) = range;

        let block_count = meta.block_count();
        let lower_block = meta.block_index_for_key(&lower_bound);
        let upper_block = meta.block_index_for_key(&upper_bound);

        let (safe_upper_row_index, hard_upper_row_index) = if upper_block >= block_count {
            (meta.total_row_count(), meta.total_row_count())
        } else {
            (
                meta.block_start_row_index(upper_block),
                meta.data_blocks[upper_block as usize].chunk_row_count,
            )
        };

        let sampler = config
            .sampling_rate
            .map(|rate| BernoulliSampler::new(rate, meta.chunk_id, config.sampling_seed));

        // exactly the block set reachable from the range, thinned out by
        // the sampler when sampling is on
        let mut block_infos = Vec::new();
        if lower_block < block_count {
            let last_block = upper_block.min(block_count - 1);
            for block_index in lower_block..=last_block {
                if let Some(sampler) = &sampler {
                    if !sampler.sample(block_index as u64) {
                        continue;
                    }
                }
                block_infos.push(BlockInfo {
                    block_index,
                    size: meta.block_sizes[block_index as usize] as u64,
                });
            }
        }

        let finished = block_infos.is_empty();
        let fetcher = BlockFetcher::new(chunk_reader, block_infos, config.window_size, priority);

        Self {
            meta,
            options,
            lower_bound,
            upper_bound,
            fetcher,
            current_block: None,
            first_block: true,
            safe_upper_row_index,
            hard_upper_row_index,
            finished,
        }
    }

    async fn advance_block(&mut self) -> Result<bool, Error> {
        let Some(fetched) = self.fetcher.next_block().await? else {
            self.finished = true;
            return Ok(false);
        };

        let start_row = self.meta.block_start_row_index(fetched.block_index);
        let mut reader = BlockReader::new(fetched.data)?;

        if self.first_block {
            self.first_block = false;
            if !reader.skip_to_key(&self.lower_bound)? {
                // the lower bound lies past this block; continue with the
                // next one from its first row
                self.current_block = None;
                return Ok(true);
            }
        } else {
            reader.skip_to_row_index(0);
        }

        self.current_block = Some((reader, start_row));
        Ok(true)
    }
}

#[async_trait]
impl VersionedReader for StreamingRangeReader {
    async fn read(&mut self, max_rows: usize) -> Result<Option<Vec<VersionedRow>>, Error> {
        if self.finished {
            return Ok(None);
        }

        let mut rows = Vec::new();

        while rows.len() < max_rows && !self.finished {
            if self.current_block.is_none() {
                if !self.advance_block().await? {
                    break;
                }
                continue;
            }

            let (reader, start_row) = self.current_block.as_mut().unwrap();
            let global_row_index = *start_row + reader.row_index() as u64;

            if global_row_index >= self.hard_upper_row_index {
                self.finished = true;
                break;
            }
            if global_row_index >= self.safe_upper_row_index
                && reader.key()? >= self.upper_bound
            {
                self.finished = true;
                break;
            }

            if let Some(mut row) = reader.read_row(
                self.options.timestamp,
                self.options.produce_all_versions,
                &self.options.column_filter,
            )? {
                if !self.meta.hunk_chunk_refs.is_empty() {
                    crate::hunks::globalize_hunk_values(&mut row, &self.meta.hunk_chunk_refs)?;
                }
                rows.push(row);
            }

            if !reader.next_row() {
                self.current_block = None;
            }
        }

        if rows.is_empty() && self.finished {
            return Ok(None);
        }
        Ok(Some(rows))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_format::test_util::make_row;
    use crate::chunk_meta::test_util::build_table_chunk;
    use crate::row::Value;
    use crate::schema::{ColumnSchema, TableSchema};
    use bytes::Bytes;
    use dn_api_types::ObjectType;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct MemoryChunkReader {
        blocks: Vec<Bytes>,
        reads: AtomicU32,
        blocks_read: AtomicU32,
    }

    #[async_trait]
    impl ChunkBlockReader for MemoryChunkReader {
        async fn read_blocks(
            &self,
            first_block_index: u32,
            block_count: u32,
            _priority: i64,
        ) -> Result<Vec<Bytes>, Error> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.blocks_read.fetch_add(block_count, Ordering::SeqCst);
            Ok(self.blocks
                [first_block_index as usize..(first_block_index + block_count) as usize]
                .to_vec())
        }
    }

    fn int_key(value: i64) -> Key {
        vec![Value::Int64(value)]
    }

    fn make_chunk() -> (Arc<MemoryChunkReader>, Arc<CachedChunkMeta>) {
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0x81);
        let schema = TableSchema::new(vec![ColumnSchema::new("k"), ColumnSchema::new("v")], 1);
        // keys 0..=98 step 2, 10 blocks of 5 rows
        let rows: Vec<_> = (0..50).map(|i| make_row(i * 2, &[(1, 10, i)])).collect();
        let (blocks, meta) = build_table_chunk(chunk_id, &schema, &rows, 5);
        (
            Arc::new(MemoryChunkReader {
                blocks,
                reads: AtomicU32::new(0),
                blocks_read: AtomicU32::new(0),
            }),
            Arc::new(meta),
        )
    }

    async fn read_all_keys(reader: &mut StreamingRangeReader) -> Vec<i64> {
        let mut keys = Vec::new();
        while let Some(batch) = reader.read(7).await.unwrap() {
            for row in batch {
                match row.key[0] {
                    Value::Int64(k) => keys.push(k),
                    _ => unreachable!(),
                }
            }
        }
        keys
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_range_scan() {
        let (chunk_reader, meta) = make_chunk();
        let mut reader = StreamingRangeReader::new(
            Arc::clone(&chunk_reader) as _,
            Arc::clone(&meta),
            (int_key(13), int_key(41)),
            ReadOptions::default(),
            StreamingReadConfig::default(),
            0,
        );

        let keys = read_all_keys(&mut reader).await;
        let expected: Vec<i64> = (7..21).map(|i| i * 2).collect(); // 14..=40
        assert_eq!(keys, expected);

        // only the blocks overlapping the range were fetched:
        // keys 13..41 live in blocks 1..=4 (rows 5..=20)
        assert!(chunk_reader.blocks_read.load(Ordering::SeqCst) <= 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_streaming_full_scan_and_open_upper_bound() {
        let (chunk_reader, meta) = make_chunk();
        let mut reader = StreamingRangeReader::new(
            Arc::clone(&chunk_reader) as _,
            meta,
            (int_key(i64::MIN), int_key(i64::MAX)),
            ReadOptions::default(),
            StreamingReadConfig::default(),
            0,
        );

        let keys = read_all_keys(&mut reader).await;
        assert_eq!(keys.len(), 50);
        assert_eq!(keys[0], 0);
        assert_eq!(keys[49], 98);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sampling_is_deterministic() {
        let (chunk_reader, meta) = make_chunk();
        let run = |seed: u64| {
            let chunk_reader = Arc::clone(&chunk_reader);
            let meta = Arc::clone(&meta);
            async move {
                let mut reader = StreamingRangeReader::new(
                    chunk_reader as _,
                    meta,
                    (int_key(i64::MIN), int_key(i64::MAX)),
                    ReadOptions::default(),
                    StreamingReadConfig {
                        window_size: 1 << 20,
                        sampling_rate: Some(0.5),
                        sampling_seed: seed,
                    },
                    0,
                );
                read_all_keys(&mut reader).await
            }
        };

        let first = run(7).await;
        let again = run(7).await;
        assert_eq!(first, again);

        // sampled output is a key-ordered subset of the full scan
        let full: Vec<i64> = (0..50).map(|i| i * 2).collect();
        let mut full_iter = full.iter();
        assert!(first
            .iter()
            .all(|key| full_iter.any(|full_key| full_key == key)));
    }

    #[test]
    fn test_bernoulli_sampler_rate() {
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0x82);
        let sampler = BernoulliSampler::new(0.5, chunk_id, 7);
        let sampled = (0..1000).filter(|&index| sampler.sample(index)).count();
        assert!((350..=650).contains(&sampled), "sampled {sampled} of 1000");

        // everything and nothing
        let all = BernoulliSampler::new(1.0, chunk_id, 7);
        assert!((0..100).all(|index| all.sample(index)));
        let none = BernoulliSampler::new(0.0, chunk_id, 7);
        assert!((0..100).all(|index| !none.sample(index)));
    }
}
