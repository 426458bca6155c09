//! Row-oriented versioned block codec.
//!
//! A block stores a run of versioned rows in key order with an offset
//! table up front, so readers can jump to any row index directly and
//! binary-search by key.
//!
//! Layout: `u32 row_count`, `u32 offsets[row_count]` (relative to the
//! payload start), then the encoded rows. All multi-byte integers are
//! varints except the fixed header and offsets.

use std::cmp::Ordering;

use anyhow::{bail, Error};
use bytes::Bytes;

use crate::row::{
    Key, Timestamp, Value, VersionedRow, VersionedValue, ALL_COMMITTED_TIMESTAMP,
};
use crate::schema::ColumnFilter;
use crate::varint::*;

const VALUE_TYPE_NULL: u8 = 0;
const VALUE_TYPE_INT64: u8 = 1;
const VALUE_TYPE_UINT64: u8 = 2;
const VALUE_TYPE_DOUBLE: u8 = 3;
const VALUE_TYPE_BOOLEAN: u8 = 4;
const VALUE_TYPE_STRING: u8 = 5;

fn write_value(out: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => out.push(VALUE_TYPE_NULL),
        Value::Int64(v) => {
            out.push(VALUE_TYPE_INT64);
            write_vari64(out, *v);
        }
        Value::Uint64(v) => {
            out.push(VALUE_TYPE_UINT64);
            write_varu64(out, *v);
        }
        Value::Double(v) => {
            out.push(VALUE_TYPE_DOUBLE);
            out.extend_from_slice(&v.to_le_bytes());
        }
        Value::Boolean(v) => {
            out.push(VALUE_TYPE_BOOLEAN);
            out.push(*v as u8);
        }
        Value::String(payload) => {
            out.push(VALUE_TYPE_STRING);
            write_varu32(out, payload.len() as u32);
            out.extend_from_slice(payload);
        }
    }
}

fn read_value(input: &[u8], pos: &mut usize) -> Result<Value, Error> {
    if *pos >= input.len() {
        bail!("truncated value");
    }
    let tag = input[*pos];
    *pos += 1;
    Ok(match tag {
        VALUE_TYPE_NULL => Value::Null,
        VALUE_TYPE_INT64 => Value::Int64(read_vari64(input, pos)?),
        VALUE_TYPE_UINT64 => Value::Uint64(read_varu64(input, pos)?),
        VALUE_TYPE_DOUBLE => {
            if *pos + 8 > input.len() {
                bail!("truncated double value");
            }
            let raw: [u8; 8] = input[*pos..*pos + 8].try_into().unwrap();
            *pos += 8;
            Value::Double(f64::from_le_bytes(raw))
        }
        VALUE_TYPE_BOOLEAN => {
            if *pos >= input.len() {
                bail!("truncated boolean value");
            }
            let raw = input[*pos];
            *pos += 1;
            Value::Boolean(raw != 0)
        }
        VALUE_TYPE_STRING => {
            let length = read_varu32(input, pos)? as usize;
            if *pos + length > input.len() {
                bail!("truncated string value");
            }
            let payload = Bytes::copy_from_slice(&input[*pos..*pos + length]);
            *pos += length;
            Value::String(payload)
        }
        _ => bail!("invalid value type tag {tag}"),
    })
}

/// Canonical byte encoding of a key, also used for fingerprinting.
pub fn encode_key(key: &Key) -> Vec<u8> {
    let mut out = Vec::new();
    write_varu32(&mut out, key.len() as u32);
    for value in key {
        write_value(&mut out, value);
    }
    out
}

/// Accumulates rows into one encoded block.
#[derive(Default)]
pub struct BlockWriter {
    payload: Vec<u8>,
    offsets: Vec<u32>,
    last_key: Option<Key>,
}

impl BlockWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> u32 {
        self.offsets.len() as u32
    }

    pub fn data_size(&self) -> usize {
        self.payload.len() + 4 * (1 + self.offsets.len())
    }

    pub fn last_key(&self) -> Option<&Key> {
        self.last_key.as_ref()
    }

    pub fn write_row(&mut self, row: &VersionedRow) {
        debug_assert!(
            self.last_key.as_ref().map_or(true, |last| last < &row.key),
            "rows must be appended in strictly increasing key order",
        );

        self.offsets.push(self.payload.len() as u32);
        let out = &mut self.payload;

        write_varu32(out, row.key.len() as u32);
        for value in &row.key {
            write_value(out, value);
        }

        write_varu32(out, row.write_timestamps.len() as u32);
        for &ts in &row.write_timestamps {
            write_varu64(out, ts);
        }
        write_varu32(out, row.delete_timestamps.len() as u32);
        for &ts in &row.delete_timestamps {
            write_varu64(out, ts);
        }

        write_varu32(out, row.values.len() as u32);
        for value in &row.values {
            write_varu32(out, value.id as u32);
            write_varu64(out, value.timestamp);
            out.push(value.flags);
            write_value(out, &value.value);
        }

        self.last_key = Some(row.key.clone());
    }

    pub fn finish(self) -> Bytes {
        let mut out = Vec::with_capacity(4 + 4 * self.offsets.len() + self.payload.len());
        out.extend_from_slice(&(self.offsets.len() as u32).to_le_bytes());
        for offset in &self.offsets {
            out.extend_from_slice(&offset.to_le_bytes());
        }
        out.extend_from_slice(&self.payload);
        Bytes::from(out)
    }
}

/// Positioned reader over one encoded block.
pub struct BlockReader {
    data: Bytes,
    row_count: u32,
    payload_base: usize,
    row_index: u32,
}

impl BlockReader {
    pub fn new(data: Bytes) -> Result<Self, Error> {
        if data.len() < 4 {
            bail!("block is too short");
        }
        let row_count = u32::from_le_bytes(data[0..4].try_into().unwrap());
        let payload_base = 4 + 4 * row_count as usize;
        if data.len() < payload_base {
            bail!("block offset table is truncated");
        }
        Ok(Self {
            data,
            row_count,
            payload_base,
            row_index: 0,
        })
    }

    pub fn row_count(&self) -> u32 {
        self.row_count
    }

    pub fn row_index(&self) -> u32 {
        self.row_index
    }

    fn row_offset(&self, row_index: u32) -> usize {
        let at = 4 + 4 * row_index as usize;
        self.payload_base
            + u32::from_le_bytes(self.data[at..at + 4].try_into().unwrap()) as usize
    }

    /// Position at `row_index`; false when past the end.
    pub fn skip_to_row_index(&mut self, row_index: u32) -> bool {
        if row_index >= self.row_count {
            return false;
        }
        self.row_index = row_index;
        true
    }

    /// Advance to the next row; false at end of block.
    pub fn next_row(&mut self) -> bool {
        if self.row_index + 1 >= self.row_count {
            self.row_index = self.row_count;
            return false;
        }
        self.row_index += 1;
        true
    }

    /// Position at the first row with key ≥ `key`; false when no such row
    /// exists in this block.
    pub fn skip_to_key(&mut self, key: &Key) -> Result<bool, Error> {
        let mut lo = 0u32;
        let mut hi = self.row_count;
        while lo < hi {
            let mid = (lo + hi) / 2;
            if self.key_at(mid)?.cmp(key) == Ordering::Less {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        if lo >= self.row_count {
            self.row_index = self.row_count;
            return Ok(false);
        }
        self.row_index = lo;
        Ok(true)
    }

    fn key_at(&self, row_index: u32) -> Result<Key, Error> {
        let mut pos = self.row_offset(row_index);
        let input = &self.data[..];
        let key_len = read_varu32(input, &mut pos)? as usize;
        let mut key = Vec::with_capacity(key_len);
        for _ in 0..key_len {
            key.push(read_value(input, &mut pos)?);
        }
        Ok(key)
    }

    /// Key of the current row.
    pub fn key(&self) -> Result<Key, Error> {
        if self.row_index >= self.row_count {
            bail!("block reader is positioned past the end");
        }
        self.key_at(self.row_index)
    }

    fn decode_row(&self, row_index: u32) -> Result<VersionedRow, Error> {
        let mut pos = self.row_offset(row_index);
        let input = &self.data[..];

        let key_len = read_varu32(input, &mut pos)? as usize;
        let mut key = Vec::with_capacity(key_len);
        for _ in 0..key_len {
            key.push(read_value(input, &mut pos)?);
        }

        let wts_len = read_varu32(input, &mut pos)? as usize;
        let mut write_timestamps = Vec::with_capacity(wts_len);
        for _ in 0..wts_len {
            write_timestamps.push(read_varu64(input, &mut pos)?);
        }
        let dts_len = read_varu32(input, &mut pos)? as usize;
        let mut delete_timestamps = Vec::with_capacity(dts_len);
        for _ in 0..dts_len {
            delete_timestamps.push(read_varu64(input, &mut pos)?);
        }

        let value_count = read_varu32(input, &mut pos)? as usize;
        let mut values = Vec::with_capacity(value_count);
        for _ in 0..value_count {
            let id = read_varu32(input, &mut pos)? as u16;
            let timestamp = read_varu64(input, &mut pos)?;
            if pos >= input.len() {
                bail!("truncated versioned value");
            }
            let flags = input[pos];
            pos += 1;
            let value = read_value(input, &mut pos)?;
            values.push(VersionedValue {
                id,
                timestamp,
                flags,
                value,
            });
        }

        Ok(VersionedRow {
            key,
            values,
            write_timestamps,
            delete_timestamps,
        })
    }

    /// Materialize the current row as visible at `timestamp`.
    ///
    /// With `produce_all_versions` every stored version and timestamp is
    /// returned. Otherwise the row is collapsed to the newest value per
    /// column at or before `timestamp`; a row entirely shadowed by a
    /// delete collapses to a bare tombstone, and `None` means the row did
    /// not exist at that time at all.
    pub fn read_row(
        &self,
        timestamp: Timestamp,
        produce_all_versions: bool,
        column_filter: &ColumnFilter,
    ) -> Result<Option<VersionedRow>, Error> {
        if self.row_index >= self.row_count {
            bail!("block reader is positioned past the end");
        }
        let mut row = self.decode_row(self.row_index)?;

        if produce_all_versions || timestamp == ALL_COMMITTED_TIMESTAMP {
            if !column_filter.is_universal() {
                row.values.retain(|value| column_filter.contains(value.id));
            }
            return Ok(Some(row));
        }

        let latest_write = row
            .write_timestamps
            .iter()
            .copied()
            .find(|&ts| ts <= timestamp);
        let latest_delete = row
            .delete_timestamps
            .iter()
            .copied()
            .find(|&ts| ts <= timestamp);

        match (latest_write, latest_delete) {
            (None, None) => Ok(None),
            (Some(w), Some(d)) if d >= w => Ok(Some(VersionedRow {
                key: row.key,
                values: Vec::new(),
                write_timestamps: Vec::new(),
                delete_timestamps: vec![d],
            })),
            (None, Some(d)) => Ok(Some(VersionedRow {
                key: row.key,
                values: Vec::new(),
                write_timestamps: Vec::new(),
                delete_timestamps: vec![d],
            })),
            (Some(w), latest_delete) => {
                let floor = latest_delete.unwrap_or(0);
                let mut picked: Vec<VersionedValue> = Vec::new();
                for value in row.values {
                    if value.timestamp > timestamp || value.timestamp <= floor {
                        continue;
                    }
                    if !column_filter.contains(value.id) {
                        continue;
                    }
                    // values are sorted (id asc, ts desc): the first hit
                    // per column is the newest visible one
                    if picked.last().map(|last| last.id) == Some(value.id) {
                        continue;
                    }
                    picked.push(value);
                }
                Ok(Some(VersionedRow {
                    key: row.key,
                    values: picked,
                    write_timestamps: vec![w],
                    delete_timestamps: latest_delete.map(|d| vec![d]).unwrap_or_default(),
                }))
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    pub fn make_row(key: i64, versions: &[(u16, Timestamp, i64)]) -> VersionedRow {
        let mut row = VersionedRow {
            key: vec![Value::Int64(key)],
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

    pub fn encode_block(rows: &[VersionedRow]) -> Bytes {
        let mut writer = BlockWriter::new();
        for row in rows {
            writer.write_row(row);
        }
        writer.finish()
    }
}
