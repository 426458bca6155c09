//! Merging reader over overlapping sorted stores.
//!
//! Each underlying reader produces rows in key order; the merger emits
//! rows in global key order, folding the versions of one key across
//! stores with a [`RowMerger`]. Ties on identical `(column, timestamp)`
//! pairs are broken by reader ordinal: the younger store (higher ordinal)
//! wins.

use std::collections::VecDeque;

use anyhow::Error;
use async_trait::async_trait;

use crate::reader::VersionedReader;
use crate::row::{Key, Timestamp, VersionedRow, VersionedValue, ALL_COMMITTED_TIMESTAMP, NULL_TIMESTAMP};
use crate::schema::ColumnFilter;

/// Folds all versions of one key, subject to the read timestamp, the
/// retention bound and a column filter.
pub struct RowMerger {
    pub timestamp: Timestamp,
    /// Versions older than this are dropped, except the newest one per
    /// column which is always kept.
    pub retention_timestamp: Timestamp,
    pub produce_all_versions: bool,
    pub column_filter: ColumnFilter,
}

impl RowMerger {
    pub fn new(timestamp: Timestamp, column_filter: ColumnFilter) -> Self {
        Self {
            timestamp,
            retention_timestamp: NULL_TIMESTAMP,
            produce_all_versions: timestamp == ALL_COMMITTED_TIMESTAMP,
            column_filter,
        }
    }

    pub fn with_retention(mut self, retention_timestamp: Timestamp) -> Self {
        self.retention_timestamp = retention_timestamp;
        self
    }

    /// Merge partial rows of one key, youngest store last. Returns `None`
    /// when the key is invisible at the read timestamp.
    pub fn merge(&self, partial_rows: Vec<(usize, VersionedRow)>) -> Option<VersionedRow> {
        if partial_rows.is_empty() {
            return None;
        }
        let key = partial_rows[0].1.key.clone();

        // collect all versions; on (id, timestamp) collisions the higher
        // ordinal replaces the lower one
        let mut values: Vec<(usize, VersionedValue)> = Vec::new();
        let mut write_timestamps: Vec<Timestamp> = Vec::new();
        let mut delete_timestamps: Vec<Timestamp> = Vec::new();

        for (ordinal, row) in partial_rows {
            write_timestamps.extend(&row.write_timestamps);
            delete_timestamps.extend(&row.delete_timestamps);
            for value in row.values {
                if !self.column_filter.contains(value.id) {
                    continue;
                }
                if let Some(existing) = values
                    .iter_mut()
                    .find(|(_, v)| v.id == value.id && v.timestamp == value.timestamp)
                {
                    if existing.0 < ordinal {
                        *existing = (ordinal, value);
                    }
                } else {
                    values.push((ordinal, value));
                }
            }
        }

        write_timestamps.sort_unstable_by(|a, b| b.cmp(a));
        write_timestamps.dedup();
        delete_timestamps.sort_unstable_by(|a, b| b.cmp(a));
        delete_timestamps.dedup();

        let mut values: Vec<VersionedValue> = values.into_iter().map(|(_, v)| v).collect();
        values.sort_by(|a, b| a.id.cmp(&b.id).then(b.timestamp.cmp(&a.timestamp)));

        if self.produce_all_versions {
            let mut retained = Vec::with_capacity(values.len());
            let mut last_id: Option<u16> = None;
            for value in values {
                let newest_of_column = last_id != Some(value.id);
                if newest_of_column || value.timestamp >= self.retention_timestamp {
                    last_id = Some(value.id);
                    retained.push(value);
                } else {
                    last_id = Some(value.id);
                }
            }
            if retained.is_empty()
                && write_timestamps.is_empty()
                && delete_timestamps.is_empty()
            {
                return None;
            }
            return Some(VersionedRow {
                key,
                values: retained,
                write_timestamps,
                delete_timestamps,
            });
        }

        let latest_write = write_timestamps
            .iter()
            .copied()
            .find(|&ts| ts <= self.timestamp);
        let latest_delete = delete_timestamps
            .iter()
            .copied()
            .find(|&ts| ts <= self.timestamp);

        match (latest_write, latest_delete) {
            (None, None) => None,
            (Some(w), Some(d)) if d >= w => Some(VersionedRow {
                key,
                values: Vec::new(),
                write_timestamps: Vec::new(),
                delete_timestamps: vec![d],
            }),
            (None, Some(d)) => Some(VersionedRow {
                key,
                values: Vec::new(),
                write_timestamps: Vec::new(),
                delete_timestamps: vec![d],
            }),
            (Some(w), latest_delete) => {
                let floor = latest_delete.unwrap_or(NULL_TIMESTAMP);
                let mut picked: Vec<VersionedValue> = Vec::new();
                for value in values {
                    if value.timestamp > self.timestamp || value.timestamp <= floor {
                        continue;
                    }
                    if picked.last().map(|last| last.id) == Some(value.id) {
                        continue;
                    }
                    picked.push(value);
                }
                Some(VersionedRow {
                    key,
                    values: picked,
                    write_timestamps: vec![w],
                    delete_timestamps: latest_delete.map(|d| vec![d]).unwrap_or_default(),
                })
            }
        }
    }
}

struct MergeSession {
    reader: Box<dyn VersionedReader>,
    ordinal: usize,
    /// Seed lower bound: no row of this reader is below it.
    min_key: Option<Key>,
    started: bool,
    buffer: VecDeque<VersionedRow>,
    exhausted: bool,
}

impl MergeSession {
    async fn ensure_buffered(&mut self, batch_size: usize) -> Result<(), Error> {
        self.started = true;
        while self.buffer.is_empty() && !self.exhausted {
            match self.reader.read(batch_size).await? {
                Some(batch) => self.buffer.extend(batch),
                None => self.exhausted = true,
            }
        }
        Ok(())
    }

    fn head_key(&self) -> Option<&Key> {
        self.buffer.front().map(|row| &row.key)
    }
}

pub struct MergeReader {
    sessions: Vec<MergeSession>,
    merger: RowMerger,
    batch_size: usize,
}

impl MergeReader {
    /// `readers` in store age order: older stores first. `min_keys` is
    /// index-aligned with `readers` and seeds active-set pruning: a
    /// reader whose minimum key is above every buffered head is not
    /// polled until the merge frontier reaches it. Pass an empty list to
    /// poll everything from the start.
    pub fn new(
        readers: Vec<Box<dyn VersionedReader>>,
        min_keys: Vec<Key>,
        merger: RowMerger,
    ) -> Self {
        let sessions = readers
            .into_iter()
            .enumerate()
            .map(|(ordinal, reader)| MergeSession {
                reader,
                ordinal,
                min_key: min_keys.get(ordinal).cloned(),
                started: false,
                buffer: VecDeque::new(),
                exhausted: false,
            })
            .collect();
        Self {
            sessions,
            merger,
            batch_size: 256,
        }
    }

    /// Refill drained active readers and activate pending ones whose
    /// seed key has been reached by the merge frontier. Activation may
    /// lower the frontier, so iterate to a fixed point.
    async fn refill_sessions(&mut self) -> Result<(), Error> {
        let batch_size = self.batch_size;
        loop {
            let frontier: Option<Key> = self
                .sessions
                .iter()
                .filter_map(MergeSession::head_key)
                .min()
                .cloned();

            let due = |session: &MergeSession| {
                if session.exhausted || !session.buffer.is_empty() {
                    return false;
                }
                if session.started {
                    return true;
                }
                match (&session.min_key, &frontier) {
                    (Some(min_key), Some(frontier)) => min_key <= frontier,
                    // no frontier yet, or no seed bound: must poll
                    _ => true,
                }
            };

            let refills: Vec<_> = self
                .sessions
                .iter_mut()
                .filter(|session| due(session))
                .map(|session| session.ensure_buffered(batch_size))
                .collect();
            if refills.is_empty() {
                return Ok(());
            }
            futures::future::try_join_all(refills).await?;
        }
    }
}

#[async_trait]
impl VersionedReader for MergeReader {
    async fn read(&mut self, max_rows: usize) -> Result<Option<Vec<VersionedRow>>, Error> {
        // readers are polled in parallel, lazily per the seed bounds
        self.refill_sessions().await?;

        if self.sessions.iter().all(|session| session.buffer.is_empty()) {
            return Ok(None);
        }

        let mut rows = Vec::new();
        while rows.len() < max_rows {
            // the smallest key across buffered heads
            let Some(min_key) = self
                .sessions
                .iter()
                .filter_map(MergeSession::head_key)
                .min()
                .cloned()
            else {
                break;
            };

            // a pending reader whose seed bound was overtaken by the
            // frontier must be activated before this key is merged
            if self.sessions.iter().any(|session| {
                !session.started
                    && !session.exhausted
                    && session
                        .min_key
                        .as_ref()
                        .map_or(true, |seed| seed <= &min_key)
            }) {
                break;
            }

            let mut partial_rows = Vec::new();
            let mut needs_refill = false;
            for session in &mut self.sessions {
                if session.head_key() == Some(&min_key) {
                    partial_rows.push((session.ordinal, session.buffer.pop_front().unwrap()));
                    needs_refill |= session.buffer.is_empty() && !session.exhausted;
                }
            }

            if let Some(row) = self.merger.merge(partial_rows) {
                rows.push(row);
            }

            if needs_refill {
                // a drained reader may still hold smaller keys than the
                // other buffers; stop the batch and refill on next call
                break;
            }
        }

        Ok(Some(rows))
    }
}
