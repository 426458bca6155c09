//! Cached table-chunk meta.
//!
//! Table chunks attach three extensions to the generic chunk meta: the
//! table schema, the per-block row counts and last keys, and the hunk
//! chunk ref table. [`CachedChunkMeta`] is the parsed, shareable form the
//! readers work against.

use anyhow::{bail, Context, Error};
use serde::{Deserialize, Serialize};

use dn_api_types::{ChunkId, ChunkMeta};

use crate::row::{Key, Timestamp};
use crate::schema::TableSchema;

pub const TABLE_SCHEMA_EXT_TAG: u32 = 50;
pub const DATA_BLOCKS_EXT_TAG: u32 = 51;
pub const HUNK_CHUNK_REFS_EXT_TAG: u32 = 52;

/// Per-block table metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataBlockMeta {
    pub row_count: u32,
    /// Cumulative row count up to and including this block.
    pub chunk_row_count: u64,
    pub last_key: Key,
    /// Partition the block belongs to, for partitioned chunks.
    #[serde(default)]
    pub partition_tag: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct DataBlocksExt {
    pub data_blocks: Vec<DataBlockMeta>,
}

/// One entry of the hunk chunk ref table; local hunk refs index into this
/// list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HunkChunkRef {
    pub chunk_id: ChunkId,
    /// 0 means the hunk chunk is not erasure coded.
    #[serde(default)]
    pub erasure_codec: u32,
    pub hunk_count: u64,
    pub total_hunk_length: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HunkChunkRefsExt {
    pub refs: Vec<HunkChunkRef>,
}

/// Parsed table meta of one chunk, shared between all readers of that
/// chunk.
pub struct CachedChunkMeta {
    pub chunk_id: ChunkId,
    pub schema: TableSchema,
    pub data_blocks: Vec<DataBlockMeta>,
    pub block_sizes: Vec<u32>,
    pub hunk_chunk_refs: Vec<HunkChunkRef>,
    pub min_timestamp: Timestamp,
    pub max_timestamp: Timestamp,
}

impl CachedChunkMeta {
    pub fn parse(chunk_id: ChunkId, meta: &ChunkMeta) -> Result<Self, Error> {
        let schema_ext: TableSchema = meta
            .get_extension(TABLE_SCHEMA_EXT_TAG)
            .context("chunk meta has no table schema extension")?;
        let blocks_ext: DataBlocksExt = meta
            .get_extension(DATA_BLOCKS_EXT_TAG)
            .context("chunk meta has no data blocks extension")?;
        let hunk_refs: HunkChunkRefsExt = meta
            .find_extension(HUNK_CHUNK_REFS_EXT_TAG)?
            .unwrap_or_default();

        if blocks_ext.data_blocks.len() != meta.blocks.len() {
            bail!(
                "data block extension covers {} blocks but the chunk has {}",
                blocks_ext.data_blocks.len(),
                meta.blocks.len(),
            );
        }

        Ok(Self {
            chunk_id,
            schema: schema_ext,
            data_blocks: blocks_ext.data_blocks,
            block_sizes: meta.blocks.iter().map(|b| b.size).collect(),
            hunk_chunk_refs: hunk_refs.refs,
            min_timestamp: meta.misc.min_timestamp,
            max_timestamp: meta.misc.max_timestamp,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.data_blocks.len() as u32
    }

    pub fn total_row_count(&self) -> u64 {
        self.data_blocks
            .last()
            .map(|block| block.chunk_row_count)
            .unwrap_or(0)
    }

    /// Cumulative row count of all blocks before `block_index`.
    pub fn block_start_row_index(&self, block_index: u32) -> u64 {
        if block_index == 0 {
            0
        } else {
            self.data_blocks[block_index as usize - 1].chunk_row_count
        }
    }

    /// Index of the first block whose last key is ≥ `key`, i.e. the block
    /// that may contain `key`. Equals `block_count` when the key is past
    /// the chunk.
    pub fn block_index_for_key(&self, key: &Key) -> u32 {
        self.data_blocks
            .partition_point(|block| &block.last_key < key) as u32
    }

    /// Rough accounting size of this meta.
    pub fn memory_usage(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.data_blocks.len() * 64
            + self.hunk_chunk_refs.len() * std::mem::size_of::<HunkChunkRef>()
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;
    use crate::block_format::BlockWriter;
    use crate::row::VersionedRow;
    use bytes::Bytes;
    use dn_api_types::{BlockMeta, MiscExt};

    /// Build block payloads plus a parsed meta from rows, `rows_per_block`
    /// per block.
    pub fn build_table_chunk(
        chunk_id: ChunkId,
        schema: &TableSchema,
        rows: &[VersionedRow],
        rows_per_block: usize,
    ) -> (Vec<Bytes>, CachedChunkMeta) {
        let mut blocks = Vec::new();
        let mut data_blocks = Vec::new();
        let mut block_metas = Vec::new();
        let mut cumulative = 0u64;

        for chunk_rows in rows.chunks(rows_per_block) {
            let mut writer = BlockWriter::new();
            for row in chunk_rows {
                writer.write_row(row);
            }
            cumulative += chunk_rows.len() as u64;
            data_blocks.push(DataBlockMeta {
                row_count: chunk_rows.len() as u32,
                chunk_row_count: cumulative,
                last_key: chunk_rows.last().unwrap().key.clone(),
                partition_tag: None,
            });
            let payload = writer.finish();
            block_metas.push(BlockMeta {
                size: payload.len() as u32,
                checksum: 0,
            });
            blocks.push(payload);
        }

        let mut meta = ChunkMeta {
            blocks: block_metas,
            misc: MiscExt {
                row_count: rows.len() as u64,
                ..Default::default()
            },
            extensions: Default::default(),
        };
        meta.set_extension(TABLE_SCHEMA_EXT_TAG, schema).unwrap();
        meta.set_extension(
            DATA_BLOCKS_EXT_TAG,
            &DataBlocksExt {
                data_blocks: data_blocks.clone(),
            },
        )
        .unwrap();

        let cached = CachedChunkMeta::parse(chunk_id, &meta).unwrap();
        (blocks, cached)
    }
}

#[cfg(test)]
mod test {
    use super::test_util::build_table_chunk;
    use super::*;
    use crate::block_format::test_util::make_row;
    use crate::schema::ColumnSchema;
    use dn_api_types::ObjectType;
    use crate::row::Value;

    #[test]
    fn test_meta_roundtrip_and_key_search() {
        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0x61);
        let schema = TableSchema::new(
            vec![ColumnSchema::new("k"), ColumnSchema::new("v")],
            1,
        );
        let rows: Vec<_> = (0..10).map(|i| make_row(i * 2, &[(1, 10, i)])).collect();
        let (blocks, meta) = build_table_chunk(chunk_id, &schema, &rows, 3);

        assert_eq!(blocks.len(), 4);
        assert_eq!(meta.block_count(), 4);
        assert_eq!(meta.total_row_count(), 10);
        assert_eq!(meta.block_start_row_index(0), 0);
        assert_eq!(meta.block_start_row_index(2), 6);

        // keys 0,2,4 in block 0 (last key 4); key 5 -> block 1
        assert_eq!(meta.block_index_for_key(&vec![Value::Int64(4)]), 0);
        assert_eq!(meta.block_index_for_key(&vec![Value::Int64(5)]), 1);
        assert_eq!(meta.block_index_for_key(&vec![Value::Int64(18)]), 3);
        assert_eq!(meta.block_index_for_key(&vec![Value::Int64(19)]), 4);
    }
}
