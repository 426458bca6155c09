//! Chunk lookup hash table.
//!
//! A linear-probe table mapping key fingerprints to `(block index, row
//! index)` pairs, built once per chunk from its cached blocks at roughly
//! chunk-size memory cost. Collisions surface as extra candidates which
//! the reader filters by comparing actual keys; false positives are
//! counted by the reader's performance counters.

use std::hash::Hasher;

use siphasher::sip::SipHasher13;

use crate::block_format::{encode_key, BlockReader};
use crate::chunk_meta::CachedChunkMeta;
use crate::row::Key;

/// 64-bit fingerprint of a key, stable across the life of a chunk.
pub fn key_fingerprint(key: &Key) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0x7563_6b79, 0x6669_6e67);
    hasher.write(&encode_key(key));
    hasher.finish()
}

const EMPTY_SLOT: u64 = u64::MAX;

// 16-bit block index and 32-bit row index packed into one value entry.
const MAX_BLOCK_INDEX: u32 = u16::MAX as u32;

pub struct LookupHashTable {
    fingerprints: Vec<u64>,
    values: Vec<u64>,
    entry_count: usize,
}

impl LookupHashTable {
    fn with_capacity(entry_count: usize) -> Self {
        // double the entries keeps probe chains short
        let capacity = (entry_count * 2).next_power_of_two().max(16);
        Self {
            fingerprints: vec![0; capacity],
            values: vec![EMPTY_SLOT; capacity],
            entry_count: 0,
        }
    }

    fn insert(&mut self, fingerprint: u64, value: u64) -> bool {
        let mask = self.values.len() - 1;
        let mut slot = (fingerprint as usize) & mask;
        for _ in 0..self.values.len() {
            if self.values[slot] == EMPTY_SLOT {
                self.fingerprints[slot] = fingerprint;
                self.values[slot] = value;
                self.entry_count += 1;
                return true;
            }
            slot = (slot + 1) & mask;
        }
        false
    }

    /// All candidate `(block_index, row_index)` pairs for the key.
    pub fn find(&self, key: &Key) -> Vec<(u32, u32)> {
        let fingerprint = key_fingerprint(key);
        let mask = self.values.len() - 1;
        let mut slot = (fingerprint as usize) & mask;
        let mut result = Vec::new();
        for _ in 0..self.values.len() {
            if self.values[slot] == EMPTY_SLOT {
                break;
            }
            if self.fingerprints[slot] == fingerprint {
                let value = self.values[slot];
                result.push(((value >> 32) as u32, value as u32));
            }
            slot = (slot + 1) & mask;
        }
        result
    }

    pub fn entry_count(&self) -> usize {
        self.entry_count
    }

    pub fn byte_size(&self) -> usize {
        self.values.len() * 16
    }
}

/// Build the lookup table from the chunk's uncompressed blocks.
///
/// Returns `None` when the chunk is unsuitable (too many blocks for the
/// 16-bit packing) or when some block is missing from the provider.
pub fn build_lookup_hash_table<F>(
    meta: &CachedChunkMeta,
    block_provider: F,
) -> Option<LookupHashTable>
where
    F: Fn(u32) -> Option<bytes::Bytes>,
{
    let block_count = meta.block_count();
    if block_count > 0 && block_count - 1 > MAX_BLOCK_INDEX {
        log::info!(
            "cannot create lookup hash table because chunk has too many blocks (chunk: {}, blocks: {block_count})",
            meta.chunk_id,
        );
        return None;
    }

    let mut table = LookupHashTable::with_capacity(meta.total_row_count() as usize);

    for block_index in 0..block_count {
        let Some(block_data) = block_provider(block_index) else {
            log::info!(
                "cannot create lookup hash table because chunk data is missing in the cache (chunk: {}, block: {block_index})",
                meta.chunk_id,
            );
            return None;
        };

        let mut reader = match BlockReader::new(block_data) {
            Ok(reader) => reader,
            Err(err) => {
                log::warn!(
                    "cannot create lookup hash table over a malformed block (chunk: {}, block: {block_index}) - {err:#}",
                    meta.chunk_id,
                );
                return None;
            }
        };

        let mut more = reader.skip_to_row_index(0);
        let mut row_index = 0u32;
        while more {
            let key = reader.key().ok()?;
            let value = ((block_index as u64) << 32) | row_index as u64;
            if !table.insert(key_fingerprint(&key), value) {
                return None;
            }
            row_index += 1;
            more = reader.next_row();
        }
    }

    Some(table)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::block_format::test_util::make_row;
    use crate::chunk_meta::test_util::build_table_chunk;
    use crate::row::Value;
    use crate::schema::{ColumnSchema, TableSchema};
    use dn_api_types::{ChunkId, ObjectType};

    #[test]
    fn test_lookup_table_finds_all_rows() {
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0x62);
        let schema = TableSchema::new(vec![ColumnSchema::new("k"), ColumnSchema::new("v")], 1);
        let rows: Vec<_> = (0..100).map(|i| make_row(i, &[(1, 10, i)])).collect();
        let (blocks, meta) = build_table_chunk(chunk_id, &schema, &rows, 7);

        let table =
            build_lookup_hash_table(&meta, |index| blocks.get(index as usize).cloned()).unwrap();
        assert_eq!(table.entry_count(), 100);
        assert!(table.byte_size() >= 100 * 16);

        for i in 0..100i64 {
            let candidates = table.find(&vec![Value::Int64(i)]);
            let expected_block = (i as usize / 7) as u32;
            let expected_row = (i as usize % 7) as u32;
            assert!(
                candidates.contains(&(expected_block, expected_row)),
                "key {i} missing from candidates {candidates:?}",
            );
        }

        // a key that was never inserted usually has no candidates
        let misses = (1000..1100i64)
            .filter(|&i| table.find(&vec![Value::Int64(i)]).is_empty())
            .count();
        assert!(misses > 90);
    }

    #[test]
    fn test_missing_block_aborts_build() {
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0x63);
        let schema = TableSchema::new(vec![ColumnSchema::new("k"), ColumnSchema::new("v")], 1);
        let rows: Vec<_> = (0..10).map(|i| make_row(i, &[(1, 10, i)])).collect();
        let (blocks, meta) = build_table_chunk(chunk_id, &schema, &rows, 3);

        let result = build_lookup_hash_table(&meta, |index| {
            if index == 2 {
                None
            } else {
                blocks.get(index as usize).cloned()
            }
        });
        assert!(result.is_none());
    }
}
