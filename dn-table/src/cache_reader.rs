//! Cache-based readers: every block they touch must already live in the
//! uncompressed block cache, so reads are pure in-memory work.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Error};
use async_trait::async_trait;
use bytes::Bytes;

use crate::block_format::BlockReader;
use crate::hunks::globalize_hunk_values;
use crate::reader::{ChunkState, ReadOptions, VersionedReader};
use crate::row::{Key, VersionedRow};

/// Local hunk refs are only meaningful inside the chunk; globalize them
/// before a row leaves the reader.
fn finalize_row(state: &ChunkState, row: &mut VersionedRow) -> Result<(), Error> {
    if !state.meta.hunk_chunk_refs.is_empty() {
        globalize_hunk_values(row, &state.meta.hunk_chunk_refs)?;
    }
    Ok(())
}

fn get_cached_block(state: &ChunkState, block_index: u32) -> Result<Bytes, Error> {
    match state.block_cache.find_block(block_index) {
        Some(block) => Ok(block),
        // cache-based readers are constructed only over fully resident
        // chunks; a miss here is a logic error upstream
        None => bail!(
            "cached block is missing (chunk: {}, block: {block_index})",
            state.meta.chunk_id,
        ),
    }
}

/// Point lookups for a sorted list of keys.
///
/// When the chunk state carries a lookup hash table, candidates come from
/// it and only hash collisions cost extra key comparisons; otherwise each
/// key binary-searches the block-last-keys array and then the block.
pub struct CacheBasedLookupReader {
    state: Arc<ChunkState>,
    options: ReadOptions,
    keys: Vec<Key>,
    key_index: usize,
}

impl CacheBasedLookupReader {
    pub fn new(state: Arc<ChunkState>, keys: Vec<Key>, options: ReadOptions) -> Self {
        Self {
            state,
            options,
            keys,
            key_index: 0,
        }
    }

    fn lookup(&self, key: &Key) -> Result<Option<VersionedRow>, Error> {
        if self.state.lookup_table.is_some() {
            self.lookup_with_hash_table(key)
        } else {
            self.lookup_without_hash_table(key)
        }
    }

    fn lookup_with_hash_table(&self, key: &Key) -> Result<Option<VersionedRow>, Error> {
        let table = self.state.lookup_table.as_ref().unwrap();
        for (block_index, row_index) in table.find(key) {
            let block = get_cached_block(&self.state, block_index)?;
            let mut reader = BlockReader::new(block)?;
            if !reader.skip_to_row_index(row_index) {
                bail!(
                    "lookup hash table points past block end (chunk: {}, block: {block_index}, row: {row_index})",
                    self.state.meta.chunk_id,
                );
            }
            if &reader.key()? == key {
                let mut row = reader.read_row(
                    self.options.timestamp,
                    self.options.produce_all_versions,
                    &self.options.column_filter,
                )?;
                if let Some(row) = &mut row {
                    finalize_row(&self.state, row)?;
                }
                return Ok(row);
            }
            // hash collision
            self.state
                .counters
                .static_chunk_row_lookup_false_positive_count
                .fetch_add(1, Ordering::Relaxed);
        }
        Ok(None)
    }

    fn lookup_without_hash_table(&self, key: &Key) -> Result<Option<VersionedRow>, Error> {
        let block_index = self.state.meta.block_index_for_key(key);
        if block_index >= self.state.meta.block_count() {
            return Ok(None);
        }

        let block = get_cached_block(&self.state, block_index)?;
        let mut reader = BlockReader::new(block)?;
        if !reader.skip_to_key(key)? || &reader.key()? != key {
            self.state
                .counters
                .static_chunk_row_lookup_false_positive_count
                .fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let mut row = reader.read_row(
            self.options.timestamp,
            self.options.produce_all_versions,
            &self.options.column_filter,
        )?;
        if let Some(row) = &mut row {
            finalize_row(&self.state, row)?;
        }
        Ok(row)
    }
}

#[async_trait]
impl VersionedReader for CacheBasedLookupReader {
    async fn read(&mut self, max_rows: usize) -> Result<Option<Vec<VersionedRow>>, Error> {
        if self.key_index >= self.keys.len() {
            return Ok(None);
        }

        let mut rows = Vec::new();
        let mut looked_up = 0u64;
        while self.key_index < self.keys.len() && rows.len() < max_rows {
            let key = self.keys[self.key_index].clone();
            self.key_index += 1;
            looked_up += 1;
            if let Some(row) = self.lookup(&key)? {
                rows.push(row);
            }
        }

        self.state
            .counters
            .static_chunk_row_lookup_count
            .fetch_add(looked_up, Ordering::Relaxed);

        Ok(Some(rows))
    }
}

/// Scan over a list of key ranges in input order.
pub struct CacheBasedRangeReader {
    state: Arc<ChunkState>,
    options: ReadOptions,
    ranges: Vec<(Key, Key)>,
    range_index: usize,

    block_index: u32,
    block_reader: Option<BlockReader>,
    upper_bound: Key,
    upper_bound_check_needed: bool,
    need_limit_update: bool,
    finished: bool,
}

impl CacheBasedRangeReader {
    pub fn new(state: Arc<ChunkState>, ranges: Vec<(Key, Key)>, options: ReadOptions) -> Self {
        Self {
            state,
            options,
            ranges,
            range_index: 0,
            block_index: 0,
            block_reader: None,
            upper_bound: Key::new(),
            upper_bound_check_needed: false,
            need_limit_update: true,
            finished: false,
        }
    }

    /// Position at the next range's lower bound. False when the ranges
    /// (or the chunk) are exhausted.
    fn update_limits(&mut self) -> Result<bool, Error> {
        loop {
            if self.range_index >= self.ranges.len() {
                return Ok(false);
            }
            let (lower, upper) = self.ranges[self.range_index].clone();
            self.range_index += 1;
            self.upper_bound = upper;

            let block_index = self.state.meta.block_index_for_key(&lower);
            if block_index >= self.state.meta.block_count() {
                // this range is past the chunk; so is every later one
                return Ok(false);
            }

            if self.block_reader.is_none() || block_index != self.block_index {
                self.block_index = block_index;
                self.open_block_reader()?;
            }

            let reader = self.block_reader.as_mut().unwrap();
            if reader.skip_to_key(&lower)? {
                return Ok(true);
            }
            // lower bound is past the last key of its candidate block:
            // the range may still start in the next block
            if self.block_index + 1 < self.state.meta.block_count() {
                self.block_index += 1;
                self.open_block_reader()?;
                let reader = self.block_reader.as_mut().unwrap();
                if reader.skip_to_row_index(0) {
                    return Ok(true);
                }
            }
        }
    }

    fn open_block_reader(&mut self) -> Result<(), Error> {
        let block = get_cached_block(&self.state, self.block_index)?;
        let mut reader = BlockReader::new(block)?;
        reader.skip_to_row_index(0);
        self.block_reader = Some(reader);

        // the upper-bound check is only needed once the current block may
        // reach past the range's end
        let block_last_key = &self.state.meta.data_blocks[self.block_index as usize].last_key;
        self.upper_bound_check_needed = block_last_key >= &self.upper_bound;
        Ok(())
    }
}

#[async_trait]
impl VersionedReader for CacheBasedRangeReader {
    async fn read(&mut self, max_rows: usize) -> Result<Option<Vec<VersionedRow>>, Error> {
        if self.finished {
            return Ok(None);
        }

        if self.need_limit_update {
            if self.update_limits()? {
                self.need_limit_update = false;
                // the upper bound changed with the range
                let block_last_key =
                    &self.state.meta.data_blocks[self.block_index as usize].last_key;
                self.upper_bound_check_needed = block_last_key >= &self.upper_bound;
            } else {
                self.finished = true;
                return Ok(None);
            }
        }

        let mut rows = Vec::new();
        let mut data_weight = 0u64;

        while rows.len() < max_rows {
            let reader = self.block_reader.as_mut().unwrap();

            if self.upper_bound_check_needed && reader.key()? >= self.upper_bound {
                self.need_limit_update = true;
                break;
            }

            if let Some(mut row) = reader.read_row(
                self.options.timestamp,
                self.options.produce_all_versions,
                &self.options.column_filter,
            )? {
                finalize_row(&self.state, &mut row)?;
                data_weight += row.data_weight();
                rows.push(row);
            }

            if !reader.next_row() {
                // end of block
                self.block_index += 1;
                if self.block_index >= self.state.meta.block_count() {
                    self.need_limit_update = true;
                    break;
                }
                self.open_block_reader()?;
            }
        }

        let counters = &self.state.counters;
        counters
            .static_chunk_row_read_count
            .fetch_add(rows.len() as u64, Ordering::Relaxed);
        counters
            .static_chunk_row_read_data_weight
            .fetch_add(data_weight, Ordering::Relaxed);

        Ok(Some(rows))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_format::test_util::make_row;
    use crate::chunk_meta::test_util::build_table_chunk;
    use crate::lookup_table::build_lookup_hash_table;
    use crate::reader::PresetBlockCache;
    use crate::row::Value;
    use crate::schema::{ColumnSchema, TableSchema};
    use dn_api_types::{ChunkId, ObjectType};

    fn int_key(value: i64) -> Key {
        vec![Value::Int64(value)]
    }

    fn make_state(with_table: bool) -> Arc<ChunkState> {
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0x71);
        let schema = TableSchema::new(vec![ColumnSchema::new("k"), ColumnSchema::new("v")], 1);
        // keys 0, 3, 6, ..., 57
        let rows: Vec<_> = (0..20).map(|i| make_row(i * 3, &[(1, 10, i * 100)])).collect();
        let (blocks, meta) = build_table_chunk(chunk_id, &schema, &rows, 6);

        let meta = Arc::new(meta);
        let cache = Arc::new(PresetBlockCache::new(0, blocks.clone()));
        if with_table {
            let table =
                build_lookup_hash_table(&meta, |index| blocks.get(index as usize).cloned())
                    .unwrap();
            ChunkState::with_lookup_table(meta, cache, Arc::new(table))
        } else {
            ChunkState::new(meta, cache)
        }
    }

    #[tokio::test]
    async fn test_lookup_reader_both_paths() {
        for with_table in [false, true] {
            let state = make_state(with_table);
            let keys = vec![int_key(0), int_key(4), int_key(27), int_key(57), int_key(100)];
            let mut reader =
                CacheBasedLookupReader::new(Arc::clone(&state), keys, ReadOptions::default());

            let rows = reader.read(100).await.unwrap().unwrap();
            // keys 4 and 100 do not exist
            assert_eq!(rows.len(), 3, "with_table={with_table}");
            assert_eq!(rows[0].key, int_key(0));
            assert_eq!(rows[1].key, int_key(27));
            assert_eq!(rows[1].values[0].value, Value::Int64(900));
            assert_eq!(rows[2].key, int_key(57));

            assert!(reader.read(100).await.unwrap().is_none());
            assert_eq!(state.counters.lookups(), 5);
        }
    }

    #[tokio::test]
    async fn test_range_reader_spans_blocks_and_ranges() {
        let state = make_state(false);
        // [6, 30) covers keys 6..=27, [45, 1000) covers 45..=57
        let ranges = vec![
            (int_key(6), int_key(30)),
            (int_key(45), int_key(1000)),
        ];
        let mut reader = CacheBasedRangeReader::new(Arc::clone(&state), ranges, ReadOptions::default());

        let mut all_rows = Vec::new();
        while let Some(batch) = reader.read(3).await.unwrap() {
            all_rows.extend(batch);
        }

        let keys: Vec<i64> = all_rows
            .iter()
            .map(|row| match row.key[0] {
                Value::Int64(k) => k,
                _ => unreachable!(),
            })
            .collect();
        let expected: Vec<i64> = (2..10)
            .map(|i| i * 3)
            .chain((15..20).map(|i| i * 3))
            .collect();
        assert_eq!(keys, expected);
        assert_eq!(state.counters.rows_read(), keys.len() as u64);
    }

    #[tokio::test]
    async fn test_range_reader_empty_range() {
        let state = make_state(false);
        let ranges = vec![(int_key(58), int_key(60))];
        let mut reader = CacheBasedRangeReader::new(state, ranges, ReadOptions::default());
        let batch = reader.read(10).await.unwrap();
        assert!(batch.is_none() || batch.unwrap().is_empty());
    }
}
