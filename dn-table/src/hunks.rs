//! Hunks: out-of-line storage for large values.
//!
//! A value of a column with a configured `max_inline_hunk_size` is stored
//! hunk-encoded: small payloads inline behind a one-byte tag, large ones
//! appended to a side-channel hunk chunk and referenced. A local ref
//! indexes the owning chunk's hunk-chunk-ref table and is globalized on
//! read; a global ref names the hunk chunk directly. Each stored hunk is
//! prefixed by a checksum header validated on fetch.

use std::collections::{HashMap, VecDeque};
use std::hash::Hasher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Error};
use async_trait::async_trait;
use bytes::Bytes;
use siphasher::sip::SipHasher13;

use dn_api_types::{BatchHunkReaderConfig, ChunkId};

use crate::chunk_meta::{HunkChunkRef, HunkChunkRefsExt};
use crate::reader::VersionedReader;
use crate::row::{value_flags, Value, VersionedRow};
use crate::schema::TableSchema;
use crate::varint::*;

const TAG_INLINE: u8 = 0;
const TAG_LOCAL_REF: u8 = 1;
const TAG_GLOBAL_REF: u8 = 2;

/// Size of the `{checksum: u64}` header preceding every stored hunk
/// payload.
pub const HUNK_PAYLOAD_HEADER_SIZE: u64 = 8;

pub fn hunk_checksum(payload: &[u8]) -> u64 {
    let mut hasher = SipHasher13::new_with_keys(0x68756e6b, 0x63686b73);
    hasher.write(payload);
    hasher.finish()
}

/// Decoded in-cell hunk value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkValue {
    Inline {
        payload: Bytes,
    },
    LocalRef {
        chunk_index: u32,
        length: u64,
        block_index: u32,
        block_offset: u64,
    },
    GlobalRef {
        chunk_id: ChunkId,
        erasure_codec: u32,
        length: u64,
        block_index: u32,
        block_offset: u64,
    },
}

pub fn write_hunk_value(value: &HunkValue) -> Bytes {
    let mut out = Vec::new();
    match value {
        HunkValue::Inline { payload } => {
            if payload.is_empty() {
                return Bytes::new();
            }
            out.push(TAG_INLINE);
            out.extend_from_slice(payload);
        }
        HunkValue::LocalRef {
            chunk_index,
            length,
            block_index,
            block_offset,
        } => {
            out.push(TAG_LOCAL_REF);
            write_varu32(&mut out, *chunk_index);
            write_varu64(&mut out, *length);
            write_varu32(&mut out, *block_index);
            write_varu64(&mut out, *block_offset);
        }
        HunkValue::GlobalRef {
            chunk_id,
            erasure_codec,
            length,
            block_index,
            block_offset,
        } => {
            out.push(TAG_GLOBAL_REF);
            out.extend_from_slice(&chunk_id.to_bytes());
            if chunk_id.is_erasure() {
                write_vari32(&mut out, *erasure_codec as i32);
            }
            write_varu64(&mut out, *length);
            write_varu32(&mut out, *block_index);
            write_varu64(&mut out, *block_offset);
        }
    }
    Bytes::from(out)
}

pub fn read_hunk_value(input: &[u8]) -> Result<HunkValue, Error> {
    if input.is_empty() {
        return Ok(HunkValue::Inline {
            payload: Bytes::new(),
        });
    }

    let tag = input[0];
    let mut pos = 1usize;
    match tag {
        TAG_INLINE => Ok(HunkValue::Inline {
            payload: Bytes::copy_from_slice(&input[1..]),
        }),
        TAG_LOCAL_REF => {
            let chunk_index = read_varu32(input, &mut pos)?;
            let length = read_varu64(input, &mut pos)?;
            let block_index = read_varu32(input, &mut pos)?;
            let block_offset = read_varu64(input, &mut pos)?;
            if pos > input.len() {
                bail!("malformed local ref hunk value");
            }
            Ok(HunkValue::LocalRef {
                chunk_index,
                length,
                block_index,
                block_offset,
            })
        }
        TAG_GLOBAL_REF => {
            if input.len() < 1 + 16 {
                bail!("malformed global ref hunk value");
            }
            let chunk_id = ChunkId::from_bytes(input[1..17].try_into().unwrap());
            pos = 17;
            let erasure_codec = if chunk_id.is_erasure() {
                read_vari32(input, &mut pos)? as u32
            } else {
                0
            };
            let length = read_varu64(input, &mut pos)?;
            let block_index = read_varu32(input, &mut pos)?;
            let block_offset = read_varu64(input, &mut pos)?;
            if pos > input.len() {
                bail!("malformed global ref hunk value");
            }
            Ok(HunkValue::GlobalRef {
                chunk_id,
                erasure_codec,
                length,
                block_index,
                block_offset,
            })
        }
        _ => bail!("invalid hunk value tag {tag}"),
    }
}

fn hunk_value_payload(value: &Value) -> Result<&Bytes, Error> {
    value
        .as_bytes()
        .ok_or_else(|| anyhow::format_err!("hunk-flagged value is not string-like"))
}

/// Rewrite every local ref in the row into a global one using the owning
/// chunk's ref table. Rows handed to readers must never carry local refs.
pub fn globalize_hunk_values(row: &mut VersionedRow, refs: &[HunkChunkRef]) -> Result<(), Error> {
    for value in &mut row.values {
        if !value.is_hunk() {
            continue;
        }
        let decoded = read_hunk_value(hunk_value_payload(&value.value)?)?;
        if let HunkValue::LocalRef {
            chunk_index,
            length,
            block_index,
            block_offset,
        } = decoded
        {
            let hunk_ref = refs.get(chunk_index as usize).ok_or_else(|| {
                anyhow::format_err!(
                    "local hunk ref chunk index {chunk_index} is out of bounds ({} refs)",
                    refs.len(),
                )
            })?;
            let globalized = write_hunk_value(&HunkValue::GlobalRef {
                chunk_id: hunk_ref.chunk_id,
                erasure_codec: hunk_ref.erasure_codec,
                length,
                block_index,
                block_offset,
            });
            value.value = Value::String(globalized);
        }
    }
    Ok(())
}

// -- writing ----------------------------------------------------------------

/// Destination for finished hunk chunk blocks; blocks are appended
/// sequentially and the sink reports the index assigned to each.
pub trait HunkBlockSink: Send {
    fn append_block(&mut self, block: Bytes) -> Result<u32, Error>;
}

/// Appends checksummed hunk payloads to blocks of a hunk chunk.
pub struct HunkChunkPayloadWriter {
    chunk_id: ChunkId,
    sink: Box<dyn HunkBlockSink>,
    max_block_size: usize,
    current_block: Vec<u8>,
    flushed_block_count: u32,
    hunk_count: u64,
    total_hunk_length: u64,
}

impl HunkChunkPayloadWriter {
    pub fn new(chunk_id: ChunkId, sink: Box<dyn HunkBlockSink>, max_block_size: usize) -> Self {
        Self {
            chunk_id,
            sink,
            max_block_size: max_block_size.max(HUNK_PAYLOAD_HEADER_SIZE as usize + 1),
            current_block: Vec::new(),
            flushed_block_count: 0,
            hunk_count: 0,
            total_hunk_length: 0,
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn has_hunks(&self) -> bool {
        self.hunk_count > 0
    }

    /// Append one payload; returns its `(block index, block offset)`.
    pub fn write_hunk(&mut self, payload: &[u8]) -> Result<(u32, u64), Error> {
        let entry_size = HUNK_PAYLOAD_HEADER_SIZE as usize + payload.len();
        if !self.current_block.is_empty()
            && self.current_block.len() + entry_size > self.max_block_size
        {
            self.flush_block()?;
        }

        let block_index = self.flushed_block_count;
        let block_offset = self.current_block.len() as u64;
        self.current_block
            .extend_from_slice(&hunk_checksum(payload).to_le_bytes());
        self.current_block.extend_from_slice(payload);

        self.hunk_count += 1;
        self.total_hunk_length += payload.len() as u64;
        Ok((block_index, block_offset))
    }

    fn flush_block(&mut self) -> Result<(), Error> {
        let block = Bytes::from(std::mem::take(&mut self.current_block));
        let index = self.sink.append_block(block)?;
        if index != self.flushed_block_count {
            bail!(
                "hunk block sink assigned index {index}, expected {}",
                self.flushed_block_count,
            );
        }
        self.flushed_block_count += 1;
        Ok(())
    }

    /// Flush the tail block and return the ref entry describing this hunk
    /// chunk, or `None` when nothing was written.
    pub fn close(mut self) -> Result<Option<HunkChunkRef>, Error> {
        if !self.current_block.is_empty() {
            self.flush_block()?;
        }
        if self.hunk_count == 0 {
            return Ok(None);
        }
        Ok(Some(HunkChunkRef {
            chunk_id: self.chunk_id,
            erasure_codec: 0,
            hunk_count: self.hunk_count,
            total_hunk_length: self.total_hunk_length,
        }))
    }
}

#[derive(Default)]
pub struct HunkWriterStatistics {
    pub inline_value_count: u64,
    pub ref_value_count: u64,
    pub inline_value_weight: u64,
    pub ref_value_weight: u64,
}

/// Rewrites rows on the write path: values of hunk columns become inline
/// hunk values or local refs into the payload writer's hunk chunk.
pub struct HunkEncodingWriter {
    schema: TableSchema,
    payload_writer: HunkChunkPayloadWriter,
    hunk_chunk_refs: Vec<HunkChunkRef>,
    chunk_id_to_index: HashMap<ChunkId, usize>,
    payload_writer_chunk_index: Option<usize>,
    statistics: HunkWriterStatistics,
}

impl HunkEncodingWriter {
    pub fn new(schema: TableSchema, payload_writer: HunkChunkPayloadWriter) -> Self {
        Self {
            schema,
            payload_writer,
            hunk_chunk_refs: Vec::new(),
            chunk_id_to_index: HashMap::new(),
            payload_writer_chunk_index: None,
            statistics: HunkWriterStatistics::default(),
        }
    }

    pub fn statistics(&self) -> &HunkWriterStatistics {
        &self.statistics
    }

    pub fn encode_rows(&mut self, rows: &mut [VersionedRow]) -> Result<(), Error> {
        for row in rows {
            for value in &mut row.values {
                let Some(max_inline) = self.schema.column(value.id).max_inline_hunk_size else {
                    continue;
                };
                if matches!(value.value, Value::Null) {
                    continue;
                }

                if value.is_hunk() {
                    match read_hunk_value(hunk_value_payload(&value.value)?)? {
                        HunkValue::Inline { payload } => {
                            self.encode_payload(value, payload, max_inline)?;
                        }
                        HunkValue::LocalRef { .. } => {
                            bail!("unexpected local hunk reference on the write path");
                        }
                        HunkValue::GlobalRef {
                            chunk_id,
                            erasure_codec,
                            length,
                            block_index,
                            block_offset,
                        } => {
                            // carry the existing ref over, re-localized
                            let chunk_index =
                                self.register_hunk_ref(chunk_id, erasure_codec, length);
                            self.statistics.ref_value_count += 1;
                            self.statistics.ref_value_weight += length;
                            value.value = Value::String(write_hunk_value(&HunkValue::LocalRef {
                                chunk_index: chunk_index as u32,
                                length,
                                block_index,
                                block_offset,
                            }));
                        }
                    }
                } else {
                    let payload = hunk_value_payload(&value.value)?.clone();
                    self.encode_payload(value, payload, max_inline)?;
                    value.flags |= value_flags::HUNK;
                }
            }
        }
        Ok(())
    }

    fn encode_payload(
        &mut self,
        value: &mut crate::row::VersionedValue,
        payload: Bytes,
        max_inline: u64,
    ) -> Result<(), Error> {
        if (payload.len() as u64) < max_inline {
            self.statistics.inline_value_count += 1;
            self.statistics.inline_value_weight += payload.len() as u64;
            value.value = Value::String(write_hunk_value(&HunkValue::Inline { payload }));
            return Ok(());
        }

        let (block_index, block_offset) = self.payload_writer.write_hunk(&payload)?;
        let chunk_index = self.payload_writer_chunk_index()?;
        self.statistics.ref_value_count += 1;
        self.statistics.ref_value_weight += payload.len() as u64;
        value.value = Value::String(write_hunk_value(&HunkValue::LocalRef {
            chunk_index: chunk_index as u32,
            length: payload.len() as u64,
            block_index,
            block_offset,
        }));
        Ok(())
    }

    fn payload_writer_chunk_index(&mut self) -> Result<usize, Error> {
        if let Some(index) = self.payload_writer_chunk_index {
            return Ok(index);
        }
        let index = self.hunk_chunk_refs.len();
        // placeholder, filled in on close
        self.hunk_chunk_refs.push(HunkChunkRef {
            chunk_id: self.payload_writer.chunk_id(),
            erasure_codec: 0,
            hunk_count: 0,
            total_hunk_length: 0,
        });
        self.payload_writer_chunk_index = Some(index);
        Ok(index)
    }

    fn register_hunk_ref(&mut self, chunk_id: ChunkId, erasure_codec: u32, length: u64) -> usize {
        let index = match self.chunk_id_to_index.get(&chunk_id) {
            Some(&index) => index,
            None => {
                let index = self.hunk_chunk_refs.len();
                self.hunk_chunk_refs.push(HunkChunkRef {
                    chunk_id,
                    erasure_codec,
                    hunk_count: 0,
                    total_hunk_length: 0,
                });
                self.chunk_id_to_index.insert(chunk_id, index);
                index
            }
        };
        let entry = &mut self.hunk_chunk_refs[index];
        entry.hunk_count += 1;
        entry.total_hunk_length += length;
        index
    }

    /// Finalize: close the payload writer and return the ref table to be
    /// stored in the owning chunk's meta.
    pub fn close(mut self) -> Result<HunkChunkRefsExt, Error> {
        let payload_ref = self.payload_writer.close()?;
        if let Some(index) = self.payload_writer_chunk_index {
            let payload_ref =
                payload_ref.ok_or_else(|| anyhow::format_err!("hunk payload writer is empty"))?;
            self.hunk_chunk_refs[index] = payload_ref;
        }
        Ok(HunkChunkRefsExt {
            refs: self.hunk_chunk_refs,
        })
    }
}

// -- reading ----------------------------------------------------------------

/// One out-of-line fragment to fetch; `length` includes the payload
/// header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentRequest {
    pub chunk_id: ChunkId,
    pub erasure_codec: u32,
    pub length: u64,
    pub block_index: u32,
    pub block_offset: u64,
}

/// Batched random reads of byte ranges out of (possibly remote) chunks.
#[async_trait]
pub trait ChunkFragmentReader: Send + Sync {
    async fn read_fragments(&self, requests: Vec<FragmentRequest>) -> Result<Vec<Bytes>, Error>;
}

#[derive(Default)]
pub struct HunkReaderStatistics {
    pub inline_value_count: AtomicU64,
    pub ref_value_count: AtomicU64,
    pub data_weight: AtomicU64,
    pub dropped_data_weight: AtomicU64,
}

impl HunkReaderStatistics {
    pub fn dropped_data_weight(&self) -> u64 {
        self.dropped_data_weight.load(Ordering::Relaxed)
    }
}

fn validate_hunk_payload(fragment: &Bytes, request: &FragmentRequest) -> Result<Bytes, Error> {
    if (fragment.len() as u64) < HUNK_PAYLOAD_HEADER_SIZE {
        bail!(
            "hunk fragment is shorter than its header (chunk: {}, block: {}, offset: {})",
            request.chunk_id,
            request.block_index,
            request.block_offset,
        );
    }
    let expected = u64::from_le_bytes(fragment[0..8].try_into().unwrap());
    let payload = fragment.slice(HUNK_PAYLOAD_HEADER_SIZE as usize..);
    let actual = hunk_checksum(&payload);
    if actual != expected {
        bail!(
            "hunk fragment checksum mismatch (chunk: {}, block: {}, offset: {}, expected: {expected:#018x}, actual: {actual:#018x})",
            request.chunk_id,
            request.block_index,
            request.block_offset,
        );
    }
    Ok(payload)
}

enum HunkAction {
    /// Replace the value with this payload and clear the hunk flag.
    SetPayload(Bytes),
    /// Fetch a fragment; `usize` indexes into the request list.
    Fetch(usize),
    /// Leave the value encoded as is.
    Keep,
}

/// Shared machinery of the decoding and inlining readers: pull rows from
/// the underlying reader, bound each batch's external fetch, patch values.
struct BatchHunkReader {
    underlying: Box<dyn VersionedReader>,
    fragment_reader: Arc<dyn ChunkFragmentReader>,
    config: BatchHunkReaderConfig,
    deferred: VecDeque<VersionedRow>,
    underlying_done: bool,
    statistics: Arc<HunkReaderStatistics>,
}

impl BatchHunkReader {
    fn new(
        underlying: Box<dyn VersionedReader>,
        fragment_reader: Arc<dyn ChunkFragmentReader>,
        config: BatchHunkReaderConfig,
    ) -> Self {
        Self {
            underlying,
            fragment_reader,
            config,
            deferred: VecDeque::new(),
            underlying_done: false,
            statistics: Arc::new(HunkReaderStatistics::default()),
        }
    }

    /// `decide` returns whether a global ref should be fetched; fetched
    /// fragments are substituted into the rows before they are returned,
    /// skipped refs pass through unchanged.
    async fn read_batch<F>(
        &mut self,
        max_rows: usize,
        mut decide: F,
    ) -> Result<Option<Vec<VersionedRow>>, Error>
    where
        F: FnMut(u16, &HunkValue) -> bool,
    {
        if self.deferred.is_empty() {
            if self.underlying_done {
                return Ok(None);
            }
            match self.underlying.read(max_rows).await? {
                Some(batch) => self.deferred.extend(batch),
                None => {
                    self.underlying_done = true;
                    return Ok(None);
                }
            }
        }

        // take rows while the batch's external fetch stays within the
        // hunk count/length budget; a single row may exceed it alone
        let mut rows: Vec<VersionedRow> = Vec::new();
        let mut requests: Vec<FragmentRequest> = Vec::new();
        let mut patches: Vec<(usize, usize, HunkAction)> = Vec::new();
        let mut hunk_count = 0usize;
        let mut total_hunk_length = 0u64;

        while rows.len() < max_rows {
            let Some(row) = self.deferred.front() else { break };

            // pre-compute this row's fetch cost
            let mut row_count = 0usize;
            let mut row_length = 0u64;
            for value in &row.values {
                if !value.is_hunk() {
                    continue;
                }
                let decoded = read_hunk_value(hunk_value_payload(&value.value)?)?;
                if let HunkValue::GlobalRef { length, .. } = &decoded {
                    if decide(value.id, &decoded) {
                        row_count += 1;
                        row_length += length;
                    }
                }
            }

            if !rows.is_empty()
                && (hunk_count + row_count > self.config.max_hunk_count_per_read
                    || total_hunk_length + row_length
                        > self.config.max_total_hunk_length_per_read)
            {
                // defer the rest to the next batch
                break;
            }

            hunk_count += row_count;
            total_hunk_length += row_length;

            let row = self.deferred.pop_front().unwrap();
            let row_index = rows.len();
            for (value_index, value) in row.values.iter().enumerate() {
                if !value.is_hunk() {
                    continue;
                }
                let decoded = read_hunk_value(hunk_value_payload(&value.value)?)?;
                let action = match &decoded {
                    HunkValue::Inline { payload } => {
                        self.statistics
                            .inline_value_count
                            .fetch_add(1, Ordering::Relaxed);
                        HunkAction::SetPayload(payload.clone())
                    }
                    HunkValue::LocalRef { .. } => {
                        bail!("unexpected local hunk reference on the read path")
                    }
                    HunkValue::GlobalRef {
                        chunk_id,
                        erasure_codec,
                        length,
                        block_index,
                        block_offset,
                    } => {
                        if decide(value.id, &decoded) {
                            self.statistics
                                .ref_value_count
                                .fetch_add(1, Ordering::Relaxed);
                            requests.push(FragmentRequest {
                                chunk_id: *chunk_id,
                                erasure_codec: *erasure_codec,
                                length: HUNK_PAYLOAD_HEADER_SIZE + length,
                                block_index: *block_index,
                                block_offset: *block_offset,
                            });
                            HunkAction::Fetch(requests.len() - 1)
                        } else {
                            self.statistics
                                .dropped_data_weight
                                .fetch_add(*length, Ordering::Relaxed);
                            HunkAction::Keep
                        }
                    }
                };
                patches.push((row_index, value_index, action));
            }
            rows.push(row);
        }

        let fragments = if requests.is_empty() {
            Vec::new()
        } else {
            log::debug!(
                "fetching hunks in row slice (rows: {}, hunks: {hunk_count}, total length: {total_hunk_length})",
                rows.len(),
            );
            let fragments = self
                .fragment_reader
                .read_fragments(requests.clone())
                .await?;
            if fragments.len() != requests.len() {
                bail!(
                    "fragment reader returned {} fragments for {} requests",
                    fragments.len(),
                    requests.len(),
                );
            }
            fragments
        };

        for (row_index, value_index, action) in patches {
            let value = &mut rows[row_index].values[value_index];
            match action {
                HunkAction::SetPayload(payload) => {
                    self.statistics
                        .data_weight
                        .fetch_add(payload.len() as u64, Ordering::Relaxed);
                    value.value = Value::String(payload);
                    value.flags &= !value_flags::HUNK;
                }
                HunkAction::Fetch(request_index) => {
                    let payload = validate_hunk_payload(
                        &fragments[request_index],
                        &requests[request_index],
                    )?;
                    self.statistics
                        .data_weight
                        .fetch_add(payload.len() as u64, Ordering::Relaxed);
                    value.value = Value::String(payload);
                    value.flags &= !value_flags::HUNK;
                }
                HunkAction::Keep => {}
            }
        }

        Ok(Some(rows))
    }
}

/// Reader wrapper resolving every hunk value to its payload.
pub struct HunkDecodingReader {
    inner: BatchHunkReader,
}

impl HunkDecodingReader {
    pub fn new(
        underlying: Box<dyn VersionedReader>,
        fragment_reader: Arc<dyn ChunkFragmentReader>,
        config: BatchHunkReaderConfig,
    ) -> Self {
        Self {
            inner: BatchHunkReader::new(underlying, fragment_reader, config),
        }
    }

    pub fn statistics(&self) -> Arc<HunkReaderStatistics> {
        Arc::clone(&self.inner.statistics)
    }
}

#[async_trait]
impl VersionedReader for HunkDecodingReader {
    async fn read(&mut self, max_rows: usize) -> Result<Option<Vec<VersionedRow>>, Error> {
        self.inner.read_batch(max_rows, |_, _| true).await
    }
}

/// Reader wrapper inlining only refs at or below the column's inline
/// threshold or whose source chunk appears in the force-inline set; other
/// refs pass through unchanged and their weight is counted as dropped.
pub struct HunkInliningReader {
    inner: BatchHunkReader,
    schema: TableSchema,
    force_inline: std::collections::HashSet<ChunkId>,
}

impl HunkInliningReader {
    pub fn new(
        underlying: Box<dyn VersionedReader>,
        fragment_reader: Arc<dyn ChunkFragmentReader>,
        config: BatchHunkReaderConfig,
        schema: TableSchema,
        force_inline: std::collections::HashSet<ChunkId>,
    ) -> Self {
        Self {
            inner: BatchHunkReader::new(underlying, fragment_reader, config),
            schema,
            force_inline,
        }
    }

    pub fn statistics(&self) -> Arc<HunkReaderStatistics> {
        Arc::clone(&self.inner.statistics)
    }
}

#[async_trait]
impl VersionedReader for HunkInliningReader {
    async fn read(&mut self, max_rows: usize) -> Result<Option<Vec<VersionedRow>>, Error> {
        let schema = self.schema.clone();
        let force_inline = self.force_inline.clone();
        self.inner
            .read_batch(max_rows, move |id, decoded| match decoded {
                HunkValue::GlobalRef {
                    chunk_id, length, ..
                } => {
                    let threshold = schema.column(id).max_inline_hunk_size.unwrap_or(0);
                    *length <= threshold || force_inline.contains(chunk_id)
                }
                _ => true,
            })
            .await
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::row::{Timestamp, VersionedValue};
    use crate::schema::ColumnSchema;
    use dn_api_types::ObjectType;
    use std::sync::Mutex;

    fn hunk_chunk_id() -> ChunkId {
        ChunkId::new(ObjectType::Blob, 1, 0x91)
    }

    #[test]
    fn test_hunk_value_encoding_roundtrip() {
        let cases = vec![
            HunkValue::Inline {
                payload: Bytes::from_static(b"small"),
            },
            HunkValue::Inline {
                payload: Bytes::new(),
            },
            HunkValue::LocalRef {
                chunk_index: 3,
                length: 1 << 20,
                block_index: 17,
                block_offset: 12345,
            },
            HunkValue::GlobalRef {
                chunk_id: hunk_chunk_id(),
                erasure_codec: 0,
                length: 7,
                block_index: 0,
                block_offset: 0,
            },
            HunkValue::GlobalRef {
                chunk_id: ChunkId::new(ObjectType::ErasureBlob, 2, 0x92),
                erasure_codec: 4,
                length: 9000,
                block_index: 2,
                block_offset: 4096,
            },
        ];
        for value in cases {
            let encoded = write_hunk_value(&value);
            let decoded = read_hunk_value(&encoded).unwrap();
            assert_eq!(decoded, value);
        }

        assert!(read_hunk_value(&[9, 9, 9]).is_err());
    }

    struct VecSink {
        blocks: Arc<Mutex<Vec<Bytes>>>,
    }

    impl HunkBlockSink for VecSink {
        fn append_block(&mut self, block: Bytes) -> Result<u32, Error> {
            let mut blocks = self.blocks.lock().unwrap();
            blocks.push(block);
            Ok(blocks.len() as u32 - 1)
        }
    }

    /// Fragment reader over the in-memory hunk chunk blocks.
    struct VecFragmentReader {
        chunk_id: ChunkId,
        blocks: Arc<Mutex<Vec<Bytes>>>,
    }

    #[async_trait]
    impl ChunkFragmentReader for VecFragmentReader {
        async fn read_fragments(
            &self,
            requests: Vec<FragmentRequest>,
        ) -> Result<Vec<Bytes>, Error> {
            let blocks = self.blocks.lock().unwrap();
            requests
                .iter()
                .map(|request| {
                    if request.chunk_id != self.chunk_id {
                        bail!("unknown hunk chunk {}", request.chunk_id);
                    }
                    let block = blocks
                        .get(request.block_index as usize)
                        .ok_or_else(|| anyhow::format_err!("no such block"))?;
                    let start = request.block_offset as usize;
                    let end = start + request.length as usize;
                    Ok(block.slice(start..end))
                })
                .collect()
        }
    }

    struct VecRowReader {
        rows: VecDeque<VersionedRow>,
    }

    #[async_trait]
    impl VersionedReader for VecRowReader {
        async fn read(&mut self, max_rows: usize) -> Result<Option<Vec<VersionedRow>>, Error> {
            if self.rows.is_empty() {
                return Ok(None);
            }
            let take = max_rows.min(self.rows.len());
            Ok(Some(self.rows.drain(..take).collect()))
        }
    }

    fn hunk_schema(max_inline: u64) -> TableSchema {
        TableSchema::new(
            vec![
                ColumnSchema::new("k"),
                ColumnSchema::new("a").with_max_inline_hunk_size(max_inline),
                ColumnSchema::new("b").with_max_inline_hunk_size(max_inline),
            ],
            1,
        )
    }

    fn string_row(key: i64, values: &[(u16, Timestamp, &[u8])]) -> VersionedRow {
        let mut row = VersionedRow {
            key: vec![Value::Int64(key)],
            values: values
                .iter()
                .map(|&(id, ts, payload)| VersionedValue {
                    id,
                    timestamp: ts,
                    flags: 0,
                    value: Value::String(Bytes::copy_from_slice(payload)),
                })
                .collect(),
            write_timestamps: values.iter().map(|&(_, ts, _)| ts).collect(),
            delete_timestamps: vec![],
        };
        row.normalize();
        row
    }

    #[tokio::test]
    async fn test_hunk_write_globalize_decode_roundtrip() {
        let schema = hunk_schema(16);
        let blocks = Arc::new(Mutex::new(Vec::new()));

        let payload_writer = HunkChunkPayloadWriter::new(
            hunk_chunk_id(),
            Box::new(VecSink {
                blocks: Arc::clone(&blocks),
            }),
            64,
        );
        let mut encoder = HunkEncodingWriter::new(schema.clone(), payload_writer);

        let small = b"tiny".as_slice();
        let large = vec![0x5au8; 1000];
        let mut rows = vec![string_row(1, &[(1, 10, small), (2, 10, &large)])];
        encoder.encode_rows(&mut rows).unwrap();

        // the small value went inline, the large one became a local ref
        assert!(rows[0].values.iter().all(|value| value.is_hunk()));
        assert_eq!(encoder.statistics().inline_value_count, 1);
        assert_eq!(encoder.statistics().ref_value_count, 1);

        let refs_ext = encoder.close().unwrap();
        assert_eq!(refs_ext.refs.len(), 1);
        assert_eq!(refs_ext.refs[0].hunk_count, 1);
        assert_eq!(refs_ext.refs[0].total_hunk_length, 1000);

        // local refs are globalized when the chunk is loaded
        globalize_hunk_values(&mut rows[0], &refs_ext.refs).unwrap();
        let decoded_ref =
            read_hunk_value(rows[0].values[1].value.as_bytes().unwrap()).unwrap();
        assert!(matches!(decoded_ref, HunkValue::GlobalRef { chunk_id, .. }
            if chunk_id == hunk_chunk_id()));

        // and a decoding reader resolves both values back to their bytes
        let reader = VecRowReader {
            rows: rows.clone().into(),
        };
        let fragment_reader = Arc::new(VecFragmentReader {
            chunk_id: hunk_chunk_id(),
            blocks,
        });
        let mut decoding = HunkDecodingReader::new(
            Box::new(reader),
            fragment_reader,
            BatchHunkReaderConfig::default(),
        );

        let decoded = decoding.read(10).await.unwrap().unwrap();
        assert_eq!(decoded[0].values[0].value.as_bytes().unwrap().as_ref(), small);
        assert_eq!(decoded[0].values[1].value.as_bytes().unwrap().as_ref(), &large[..]);
        assert!(decoded[0].values.iter().all(|value| !value.is_hunk()));
        assert!(decoding.read(10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_hunk_fragment_detected() {
        let schema = hunk_schema(4);
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let payload_writer = HunkChunkPayloadWriter::new(
            hunk_chunk_id(),
            Box::new(VecSink {
                blocks: Arc::clone(&blocks),
            }),
            1 << 16,
        );
        let mut encoder = HunkEncodingWriter::new(schema, payload_writer);
        let mut rows = vec![string_row(1, &[(1, 10, b"large enough payload")])];
        encoder.encode_rows(&mut rows).unwrap();
        let refs_ext = encoder.close().unwrap();
        globalize_hunk_values(&mut rows[0], &refs_ext.refs).unwrap();

        // corrupt one payload byte past the checksum header
        {
            let mut guard = blocks.lock().unwrap();
            let mut raw = guard[0].to_vec();
            raw[9] ^= 0xff;
            guard[0] = Bytes::from(raw);
        }

        let mut decoding = HunkDecodingReader::new(
            Box::new(VecRowReader { rows: rows.into() }),
            Arc::new(VecFragmentReader {
                chunk_id: hunk_chunk_id(),
                blocks,
            }),
            BatchHunkReaderConfig::default(),
        );
        let err = decoding.read(10).await.unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[tokio::test]
    async fn test_inlining_reader_keeps_large_refs() {
        let schema = hunk_schema(8);
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let payload_writer = HunkChunkPayloadWriter::new(
            hunk_chunk_id(),
            Box::new(VecSink {
                blocks: Arc::clone(&blocks),
            }),
            1 << 16,
        );
        let mut encoder = HunkEncodingWriter::new(schema.clone(), payload_writer);
        // both above the inline threshold of 8, one is small enough to be
        // inlined back on merge (<= threshold is impossible here, so use
        // the force-inline set for the other check)
        let mut rows = vec![string_row(
            1,
            &[(1, 10, b"0123456789"), (2, 10, &[7u8; 4000])],
        )];
        encoder.encode_rows(&mut rows).unwrap();
        let refs_ext = encoder.close().unwrap();
        globalize_hunk_values(&mut rows[0], &refs_ext.refs).unwrap();

        let mut inlining = HunkInliningReader::new(
            Box::new(VecRowReader {
                rows: rows.clone().into(),
            }),
            Arc::new(VecFragmentReader {
                chunk_id: hunk_chunk_id(),
                blocks: Arc::clone(&blocks),
            }),
            BatchHunkReaderConfig::default(),
            schema.clone(),
            Default::default(),
        );

        let batch = inlining.read(10).await.unwrap().unwrap();
        // neither ref is at or below the threshold: both stay refs
        assert!(batch[0].values.iter().all(|value| value.is_hunk()));
        assert_eq!(
            inlining.statistics().dropped_data_weight(),
            10 + 4000,
        );

        // with the chunk force-inlined everything comes back as payload
        let mut force: std::collections::HashSet<ChunkId> = Default::default();
        force.insert(hunk_chunk_id());
        let mut inlining = HunkInliningReader::new(
            Box::new(VecRowReader { rows: rows.into() }),
            Arc::new(VecFragmentReader {
                chunk_id: hunk_chunk_id(),
                blocks,
            }),
            BatchHunkReaderConfig::default(),
            schema,
            force,
        );
        let batch = inlining.read(10).await.unwrap().unwrap();
        assert!(batch[0].values.iter().all(|value| !value.is_hunk()));
        assert_eq!(
            batch[0].values[1].value.as_bytes().unwrap().as_ref(),
            &[7u8; 4000][..],
        );
    }

    #[tokio::test]
    async fn test_batching_defers_rows_over_budget() {
        let schema = hunk_schema(4);
        let blocks = Arc::new(Mutex::new(Vec::new()));
        let payload_writer = HunkChunkPayloadWriter::new(
            hunk_chunk_id(),
            Box::new(VecSink {
                blocks: Arc::clone(&blocks),
            }),
            1 << 16,
        );
        let mut encoder = HunkEncodingWriter::new(schema, payload_writer);
        let payload = [1u8; 100];
        let mut rows: Vec<VersionedRow> = (0..6)
            .map(|key| string_row(key, &[(1, 10, &payload)]))
            .collect();
        encoder.encode_rows(&mut rows).unwrap();
        let refs_ext = encoder.close().unwrap();
        for row in &mut rows {
            globalize_hunk_values(row, &refs_ext.refs).unwrap();
        }

        let mut decoding = HunkDecodingReader::new(
            Box::new(VecRowReader { rows: rows.into() }),
            Arc::new(VecFragmentReader {
                chunk_id: hunk_chunk_id(),
                blocks,
            }),
            BatchHunkReaderConfig {
                max_hunk_count_per_read: 2,
                max_total_hunk_length_per_read: 1 << 20,
            },
        );

        // six rows with one ref each, two refs per batch: three batches
        let mut batches = Vec::new();
        while let Some(batch) = decoding.read(100).await.unwrap() {
            batches.push(batch.len());
        }
        assert_eq!(batches, vec![2, 2, 2]);
    }
}
