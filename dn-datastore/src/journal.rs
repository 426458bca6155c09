//! Journal chunk files.
//!
//! A journal is an append-only record log: `<id>` holds length+crc framed
//! records, `<id>.index` the record offsets and an empty `<id>.sealed`
//! marker makes the journal immutable. The index is a pure accelerator; a
//! missing or stale index is rebuilt from the data file, dropping a torn
//! trailing record if the node died mid-append.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use anyhow::{bail, format_err, Context, Error};
use bytes::Bytes;

use crate::format::{with_suffix, JOURNAL_INDEX_SUFFIX, SEALED_SUFFIX};

const RECORD_HEADER_SIZE: u64 = 8; // u32 length + u32 crc

fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

pub struct JournalFile {
    data_path: PathBuf,
    index_path: PathBuf,
    sealed_path: PathBuf,
    file: File,
    offsets: Vec<u64>,
    data_size: u64,
    sealed: bool,
}

impl JournalFile {
    pub fn create(data_path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(data_path)
            .map_err(|err| format_err!("unable to create journal {data_path:?} - {err}"))?;
        let mut journal = Self {
            data_path: data_path.to_owned(),
            index_path: with_suffix(data_path, JOURNAL_INDEX_SUFFIX),
            sealed_path: with_suffix(data_path, SEALED_SUFFIX),
            file,
            offsets: Vec::new(),
            data_size: 0,
            sealed: false,
        };
        journal.store_index()?;
        Ok(journal)
    }

    /// Open an existing journal, rebuilding the index if necessary.
    pub fn open(data_path: &Path) -> Result<Self, Error> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(data_path)
            .map_err(|err| format_err!("unable to open journal {data_path:?} - {err}"))?;

        let mut journal = Self {
            data_path: data_path.to_owned(),
            index_path: with_suffix(data_path, JOURNAL_INDEX_SUFFIX),
            sealed_path: with_suffix(data_path, SEALED_SUFFIX),
            file,
            offsets: Vec::new(),
            data_size: 0,
            sealed: false,
        };
        journal.sealed = journal.sealed_path.exists();

        if !journal.try_load_index()? {
            journal.rebuild_index()?;
            journal.store_index()?;
        }

        Ok(journal)
    }

    pub fn row_count(&self) -> u64 {
        self.offsets.len() as u64
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    pub fn append_records(&mut self, records: &[Bytes]) -> Result<(), Error> {
        if self.sealed {
            bail!("journal {:?} is sealed", self.data_path);
        }

        let mut buffer = Vec::new();
        let mut offsets = Vec::with_capacity(records.len());
        let mut offset = self.data_size;
        for record in records {
            offsets.push(offset);
            buffer.extend_from_slice(&(record.len() as u32).to_le_bytes());
            buffer.extend_from_slice(&crc32(record).to_le_bytes());
            buffer.extend_from_slice(record);
            offset += RECORD_HEADER_SIZE + record.len() as u64;
        }

        self.file
            .write_all_at(&buffer, self.data_size)
            .with_context(|| format!("appending to journal {:?}", self.data_path))?;

        self.data_size = offset;
        self.offsets.extend(offsets);
        Ok(())
    }

    /// Make appended records durable and refresh the index file.
    pub fn flush(&mut self) -> Result<(), Error> {
        self.file.flush()?;
        nix::unistd::fsync(self.file.as_raw_fd())
            .map_err(|err| format_err!("fsync of {:?} failed - {err}", self.data_path))?;
        self.store_index()
    }

    pub fn read_records(&self, first: u64, count: u64) -> Result<Vec<Bytes>, Error> {
        if first + count > self.row_count() {
            bail!(
                "record range {}..{} is out of bounds for {:?} ({} records)",
                first,
                first + count,
                self.data_path,
                self.row_count(),
            );
        }

        let mut records = Vec::with_capacity(count as usize);
        for index in first..first + count {
            let offset = self.offsets[index as usize];
            let mut header = [0u8; RECORD_HEADER_SIZE as usize];
            self.file
                .read_exact_at(&mut header, offset)
                .with_context(|| format!("reading record {index} of {:?}", self.data_path))?;
            let length = u32::from_le_bytes(header[0..4].try_into().unwrap());
            let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());

            let mut payload = vec![0u8; length as usize];
            self.file
                .read_exact_at(&mut payload, offset + RECORD_HEADER_SIZE)
                .with_context(|| format!("reading record {index} of {:?}", self.data_path))?;
            if crc32(&payload) != checksum {
                bail!("record {index} of {:?} is corrupt", self.data_path);
            }
            records.push(Bytes::from(payload));
        }
        Ok(records)
    }

    /// Mark the journal sealed; further appends fail.
    pub fn seal(&mut self) -> Result<(), Error> {
        self.flush()?;
        dn_tools::fs::replace_file(&self.sealed_path, b"", true)?;
        self.sealed = true;
        Ok(())
    }

    fn try_load_index(&mut self) -> Result<bool, Error> {
        let raw = match std::fs::read(&self.index_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(err) => {
                return Err(format_err!(
                    "unable to read journal index {:?} - {err}",
                    self.index_path
                ))
            }
        };
        if raw.len() % 8 != 0 {
            log::warn!("journal index {:?} is truncated, rebuilding", self.index_path);
            return Ok(false);
        }

        let offsets: Vec<u64> = raw
            .chunks_exact(8)
            .map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap()))
            .collect();

        // the index is stale when the data file has grown past it
        let data_len = self.file.metadata()?.len();
        let covered = match offsets.last() {
            Some(&last) => {
                let mut header = [0u8; RECORD_HEADER_SIZE as usize];
                if self.file.read_exact_at(&mut header, last).is_err() {
                    return Ok(false);
                }
                let length = u32::from_le_bytes(header[0..4].try_into().unwrap());
                last + RECORD_HEADER_SIZE + length as u64
            }
            None => 0,
        };
        if covered < data_len {
            return Ok(false);
        }

        self.offsets = offsets;
        self.data_size = covered;
        Ok(true)
    }

    fn rebuild_index(&mut self) -> Result<(), Error> {
        let data_len = self.file.metadata()?.len();
        let mut offsets = Vec::new();
        let mut offset = 0u64;

        while offset + RECORD_HEADER_SIZE <= data_len {
            let mut header = [0u8; RECORD_HEADER_SIZE as usize];
            self.file.read_exact_at(&mut header, offset)?;
            let length = u32::from_le_bytes(header[0..4].try_into().unwrap()) as u64;
            let checksum = u32::from_le_bytes(header[4..8].try_into().unwrap());
            if offset + RECORD_HEADER_SIZE + length > data_len {
                break;
            }
            let mut payload = vec![0u8; length as usize];
            self.file.read_exact_at(&mut payload, offset + RECORD_HEADER_SIZE)?;
            if crc32(&payload) != checksum {
                break;
            }
            offsets.push(offset);
            offset += RECORD_HEADER_SIZE + length;
        }

        if offset < data_len {
            log::warn!(
                "journal {:?} has a torn tail, truncating at {offset} of {data_len}",
                self.data_path,
            );
            self.file.set_len(offset)?;
        }

        self.offsets = offsets;
        self.data_size = offset;
        Ok(())
    }

    fn store_index(&self) -> Result<(), Error> {
        let mut raw = Vec::with_capacity(self.offsets.len() * 8);
        for offset in &self.offsets {
            raw.extend_from_slice(&offset.to_le_bytes());
        }
        dn_tools::fs::replace_file(&self.index_path, &raw, true)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn temp_journal(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dn-journal-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(with_suffix(&path, JOURNAL_INDEX_SUFFIX));
        let _ = std::fs::remove_file(with_suffix(&path, SEALED_SUFFIX));
        path
    }

    #[test]
    fn test_journal_roundtrip() {
        let path = temp_journal("j1");

        let mut journal = JournalFile::create(&path).unwrap();
        journal
            .append_records(&[Bytes::from_static(b"one"), Bytes::from_static(b"two")])
            .unwrap();
        journal.flush().unwrap();
        assert_eq!(journal.row_count(), 2);

        let records = journal.read_records(0, 2).unwrap();
        assert_eq!(&records[0][..], b"one");
        assert_eq!(&records[1][..], b"two");

        journal.seal().unwrap();
        assert!(journal.is_sealed());
        assert!(journal
            .append_records(&[Bytes::from_static(b"three")])
            .is_err());

        // reopen picks up the sealed flag and the index
        let reopened = JournalFile::open(&path).unwrap();
        assert!(reopened.is_sealed());
        assert_eq!(reopened.row_count(), 2);
    }

    #[test]
    fn test_journal_index_rebuild_truncates_torn_tail() {
        let path = temp_journal("j2");

        let mut journal = JournalFile::create(&path).unwrap();
        journal
            .append_records(&[Bytes::from_static(b"alpha"), Bytes::from_static(b"beta")])
            .unwrap();
        journal.flush().unwrap();
        let good_size = journal.data_size();
        drop(journal);

        // simulate a torn append: header promising more bytes than exist
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            file.write_all_at(&100u32.to_le_bytes(), good_size).unwrap();
            file.write_all_at(&0u32.to_le_bytes(), good_size + 4).unwrap();
            file.write_all_at(b"partial", good_size + 8).unwrap();
        }
        std::fs::remove_file(with_suffix(&path, JOURNAL_INDEX_SUFFIX)).unwrap();

        let journal = JournalFile::open(&path).unwrap();
        assert_eq!(journal.row_count(), 2);
        assert_eq!(journal.data_size(), good_size);
        let records = journal.read_records(0, 2).unwrap();
        assert_eq!(&records[1][..], b"beta");
    }
}
