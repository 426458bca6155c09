//! Versioned table reads over actually stored chunks: hash-table
//! lookups and streaming scans against the block store, plus the full
//! hunk write/read cycle with the hunk chunk persisted next to its
//! owner.

use std::sync::Arc;

use anyhow::Error;
use bytes::Bytes;

use chunk_datanode::table_access::{
    load_chunk_state, BlockStoreChunkReader, BlockStoreFragmentReader,
};
use dn_api_types::{
    BlockCacheConfig, CellId, ChunkId, ChunkMeta, ObjectType, StoreLocationConfig,
    WorkloadCategory,
};
use dn_datastore::block_store::{BlockStore, PendingReadTracker};
use dn_datastore::chunk::ChunkContext;
use dn_datastore::chunk_store::ChunkStore;
use dn_datastore::format::BlobWriter;
use dn_datastore::location::{AbortHook, Location};
use dn_datastore::reader_cache::BlobReaderCache;
use dn_table::block_format::BlockWriter;
use dn_table::cache_reader::{CacheBasedLookupReader, CacheBasedRangeReader};
use dn_table::chunk_meta::{
    DataBlockMeta, DataBlocksExt, HunkChunkRefsExt, DATA_BLOCKS_EXT_TAG,
    HUNK_CHUNK_REFS_EXT_TAG, TABLE_SCHEMA_EXT_TAG,
};
use dn_table::hunks::{HunkBlockSink, HunkChunkPayloadWriter, HunkDecodingReader, HunkEncodingWriter};
use dn_table::reader::{ReadOptions, VersionedReader};
use dn_table::row::{Key, Value, VersionedRow, VersionedValue};
use dn_table::schema::{ColumnSchema, TableSchema};
use dn_table::streaming_reader::{StreamingRangeReader, StreamingReadConfig};
use dn_tools::memory_tracker::MemoryTracker;

fn abort_hook() -> AbortHook {
    Arc::new(|err: &Error| panic!("location disabled in test: {err:#}"))
}

struct Storage {
    store: Arc<ChunkStore>,
    block_store: Arc<BlockStore>,
    location: Arc<Location>,
    dir: std::path::PathBuf,
}

fn make_storage(tag: &str) -> Storage {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = std::env::temp_dir().join(format!("dn-table-reads-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();

    let mut config = StoreLocationConfig::new(&dir);
    config.health_check.use_direct_io = false;
    config.health_check.test_size = 4096;
    config.low_watermark = 0;
    config.high_watermark = 0;
    config.trash_cleanup_watermark = 0;

    let location = Location::new_store(&format!("table-{tag}"), &config, abort_hook());
    let pending = PendingReadTracker::new();
    let ctx = Arc::new(ChunkContext {
        memory_tracker: MemoryTracker::new(1 << 30),
        reader_cache: BlobReaderCache::new(16),
        pending_read_tracker: Arc::clone(&pending),
        max_blocks_per_read: 1000,
        max_bytes_per_read: 64 * 1024 * 1024,
    });
    let store = ChunkStore::new(ctx, vec![Arc::clone(&location)], vec![]);
    let block_store = BlockStore::new(
        &BlockCacheConfig::default(),
        Arc::clone(store.registry()),
        pending,
    );

    Storage {
        store,
        block_store,
        location,
        dir,
    }
}

fn int_key(value: i64) -> Key {
    vec![Value::Int64(value)]
}

fn plain_schema() -> TableSchema {
    TableSchema::new(vec![ColumnSchema::new("k"), ColumnSchema::new("v")], 1)
}

fn make_row(key: i64, versions: &[(u16, u64, i64)]) -> VersionedRow {
    let mut row = VersionedRow {
        key: int_key(key),
        values: versions
            .iter()
            .map(|&(id, ts, v)| VersionedValue {
                id,
                timestamp: ts,
                flags: 0,
                value: Value::Int64(v),
            })
            .collect(),
        write_timestamps: versions.iter().map(|&(_, ts, _)| ts).collect(),
        delete_timestamps: vec![],
    };
    row.normalize();
    row
}

/// Write a table chunk to the location: rows packed into blocks of
/// `rows_per_block`, table extensions attached to the chunk meta.
fn write_table_chunk(
    storage: &Storage,
    chunk_id: ChunkId,
    schema: &TableSchema,
    rows: &[VersionedRow],
    rows_per_block: usize,
    hunk_refs: Option<HunkChunkRefsExt>,
) {
    let data_path = storage.location.chunk_path(chunk_id);
    std::fs::create_dir_all(data_path.parent().unwrap()).unwrap();
    let mut blob = BlobWriter::create(&data_path).unwrap();

    let mut data_blocks = Vec::new();
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
        blob.append_block(&writer.finish()).unwrap();
    }

    let mut meta = ChunkMeta::default();
    meta.misc.row_count = rows.len() as u64;
    meta.set_extension(TABLE_SCHEMA_EXT_TAG, schema).unwrap();
    meta.set_extension(DATA_BLOCKS_EXT_TAG, &DataBlocksExt { data_blocks })
        .unwrap();
    if let Some(hunk_refs) = hunk_refs {
        meta.set_extension(HUNK_CHUNK_REFS_EXT_TAG, &hunk_refs).unwrap();
    }

    blob.finish(meta).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lookup_and_streaming_over_block_store() {
    let storage = make_storage("scan");
    let schema = plain_schema();
    let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0x2001);

    let rows: Vec<_> = (0..40).map(|i| make_row(i * 5, &[(1, 10, i)])).collect();
    write_table_chunk(&storage, chunk_id, &schema, &rows, 8, None);
    storage.store.initialize(CellId(0x33)).await.unwrap();

    // hash-table lookups straight out of the (now populated) cache
    let state = load_chunk_state(&storage.store, &storage.block_store, chunk_id, true)
        .await
        .unwrap();
    assert!(state.lookup_table.is_some());

    let mut reader = CacheBasedLookupReader::new(
        Arc::clone(&state),
        vec![int_key(0), int_key(85), int_key(86), int_key(195)],
        ReadOptions::default(),
    );
    let found = reader.read(100).await.unwrap().unwrap();
    assert_eq!(found.len(), 3);
    assert_eq!(found[1].key, int_key(85));
    assert_eq!(found[1].values[0].value, Value::Int64(17));

    // range scan over the cached blocks
    let mut range_reader = CacheBasedRangeReader::new(
        Arc::clone(&state),
        vec![(int_key(50), int_key(100))],
        ReadOptions::default(),
    );
    let mut scanned = 0;
    while let Some(batch) = range_reader.read(16).await.unwrap() {
        scanned += batch.len();
    }
    assert_eq!(scanned, 10); // keys 50..=95 step 5

    // streaming scan goes through the prefetching path instead
    let chunk_reader =
        BlockStoreChunkReader::new(Arc::clone(&storage.block_store), chunk_id, WorkloadCategory::Batch);
    let mut streaming = StreamingRangeReader::new(
        chunk_reader,
        Arc::clone(&state.meta),
        (int_key(50), int_key(100)),
        ReadOptions::default(),
        StreamingReadConfig::default(),
        0,
    );
    let mut streamed = 0;
    while let Some(batch) = streaming.read(16).await.unwrap() {
        streamed += batch.len();
    }
    assert_eq!(streamed, 10);

    std::fs::remove_dir_all(&storage.dir).unwrap();
}

/// Hunk block sink over a shared blob writer; the test takes the writer
/// back after the encoder is closed to seal the chunk with its meta.
struct BlobSink {
    writer: Arc<std::sync::Mutex<Option<BlobWriter>>>,
}

impl HunkBlockSink for BlobSink {
    fn append_block(&mut self, block: Bytes) -> Result<u32, Error> {
        self.writer
            .lock()
            .unwrap()
            .as_mut()
            .expect("hunk blob writer already sealed")
            .append_block(&block)
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hunk_roundtrip_through_stored_chunks() {
    let storage = make_storage("hunks");
    let schema = TableSchema::new(
        vec![
            ColumnSchema::new("k"),
            ColumnSchema::new("a").with_max_inline_hunk_size(16),
            ColumnSchema::new("b").with_max_inline_hunk_size(16),
        ],
        1,
    );

    let owner_id = ChunkId::new(ObjectType::Blob, 1, 0x2002);
    let hunk_id = ChunkId::new(ObjectType::Blob, 1, 0x2003);

    let small_payload = Bytes::from_static(b"8 bytes!");
    let large_payload = Bytes::from(vec![0x42u8; 1024 * 1024]);

    let mut row = VersionedRow {
        key: int_key(1),
        values: vec![
            VersionedValue {
                id: 1,
                timestamp: 100,
                flags: 0,
                value: Value::String(small_payload.clone()),
            },
            VersionedValue {
                id: 2,
                timestamp: 100,
                flags: 0,
                value: Value::String(large_payload.clone()),
            },
        ],
        write_timestamps: vec![100],
        delete_timestamps: vec![],
    };
    row.normalize();

    // hunk-encode the row; the large payload lands in the side-channel
    // hunk chunk, the small one stays inline
    let hunk_path = storage.location.chunk_path(hunk_id);
    std::fs::create_dir_all(hunk_path.parent().unwrap()).unwrap();
    let hunk_blob = Arc::new(std::sync::Mutex::new(Some(
        BlobWriter::create(&hunk_path).unwrap(),
    )));
    let payload_writer = HunkChunkPayloadWriter::new(
        hunk_id,
        Box::new(BlobSink {
            writer: Arc::clone(&hunk_blob),
        }),
        4 * 1024 * 1024,
    );
    let mut encoder = HunkEncodingWriter::new(schema.clone(), payload_writer);

    let mut rows = vec![row];
    encoder.encode_rows(&mut rows).unwrap();
    assert_eq!(encoder.statistics().inline_value_count, 1);
    assert_eq!(encoder.statistics().ref_value_count, 1);

    let refs_ext = encoder.close().unwrap();
    assert_eq!(refs_ext.refs.len(), 1);
    assert_eq!(refs_ext.refs[0].chunk_id, hunk_id);
    assert_eq!(refs_ext.refs[0].hunk_count, 1);

    // seal the hunk chunk file
    let hunk_writer = hunk_blob.lock().unwrap().take().unwrap();
    hunk_writer.finish(ChunkMeta::default()).unwrap();

    // the owning table chunk stores the encoded row plus the ref table
    write_table_chunk(&storage, owner_id, &schema, &rows, 8, Some(refs_ext));
    storage.store.initialize(CellId(0x34)).await.unwrap();
    assert!(storage.store.find_chunk(owner_id).is_some());
    assert!(storage.store.find_chunk(hunk_id).is_some());

    // raw read: both values are hunk-flagged, the large one a global ref
    let state = load_chunk_state(&storage.store, &storage.block_store, owner_id, false)
        .await
        .unwrap();
    // the cache-based contract needs the blocks resident
    storage
        .block_store
        .find_block(owner_id, 0, 0, true)
        .await
        .unwrap()
        .unwrap();

    let raw_reader = CacheBasedLookupReader::new(
        Arc::clone(&state),
        vec![int_key(1)],
        ReadOptions::default(),
    );

    // wrap in the decoding reader backed by the locally stored hunk chunk
    let mut decoding = HunkDecodingReader::new(
        Box::new(raw_reader),
        BlockStoreFragmentReader::new(Arc::clone(&storage.block_store)),
        Default::default(),
    );

    let decoded = decoding.read(10).await.unwrap().unwrap();
    assert_eq!(decoded.len(), 1);
    let values = &decoded[0].values;
    assert!(values.iter().all(|value| !value.is_hunk()));
    assert_eq!(values[0].value.as_bytes().unwrap(), &small_payload);
    assert_eq!(values[1].value.as_bytes().unwrap(), &large_payload);

    std::fs::remove_dir_all(&storage.dir).unwrap();
}
