//! Blob chunk file format.
//!
//! A blob chunk is two files: `<id>` with the concatenated block payloads
//! and `<id>.meta` with the serialized [`ChunkMeta`] document (block table
//! with sizes and checksums plus the extension map). Data is written to a
//! temporary file first and renamed into place when the chunk is finished.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, format_err, Context, Error};
use bytes::Bytes;

use dn_api_types::{BlockMeta, ChunkMeta};

pub const CHUNK_META_SUFFIX: &str = ".meta";
pub const JOURNAL_INDEX_SUFFIX: &str = ".index";
pub const SEALED_SUFFIX: &str = ".sealed";
pub const ARTIFACT_META_SUFFIX: &str = ".artifact-meta";
const WRITER_TMP_SUFFIX: &str = ".write~";

/// `<path><suffix>` without treating dots in the base name as extensions.
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(suffix);
    PathBuf::from(os)
}

pub fn load_chunk_meta(data_path: &Path) -> Result<ChunkMeta, Error> {
    let meta_path = with_suffix(data_path, CHUNK_META_SUFFIX);
    let raw = std::fs::read(&meta_path)
        .map_err(|err| format_err!("unable to read chunk meta {meta_path:?} - {err}"))?;
    if raw.is_empty() {
        bail!("chunk meta file {meta_path:?} is empty");
    }
    serde_json::from_slice(&raw)
        .map_err(|err| format_err!("malformed chunk meta {meta_path:?} - {err}"))
}

pub fn store_chunk_meta(data_path: &Path, meta: &ChunkMeta, fsync: bool) -> Result<(), Error> {
    let meta_path = with_suffix(data_path, CHUNK_META_SUFFIX);
    let raw = serde_json::to_vec(meta)?;
    dn_tools::fs::replace_file(&meta_path, &raw, fsync)
}

/// Incremental writer for one blob chunk.
pub struct BlobWriter {
    data_path: PathBuf,
    tmp_path: PathBuf,
    file: Option<File>,
    blocks: Vec<BlockMeta>,
    data_size: u64,
}

impl BlobWriter {
    pub fn create(data_path: &Path) -> Result<Self, Error> {
        let tmp_path = with_suffix(data_path, WRITER_TMP_SUFFIX);
        let file = File::create(&tmp_path)
            .map_err(|err| format_err!("unable to create {tmp_path:?} - {err}"))?;
        Ok(Self {
            data_path: data_path.to_owned(),
            tmp_path,
            file: Some(file),
            blocks: Vec::new(),
            data_size: 0,
        })
    }

    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    pub fn data_size(&self) -> u64 {
        self.data_size
    }

    pub fn append_block(&mut self, data: &[u8]) -> Result<u32, Error> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| format_err!("blob writer already closed"))?;

        file.write_all(data)
            .with_context(|| format!("writing block to {:?}", self.tmp_path))?;

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(data);
        self.blocks.push(BlockMeta {
            size: data.len() as u32,
            checksum: hasher.finalize(),
        });
        self.data_size += data.len() as u64;
        Ok(self.blocks.len() as u32 - 1)
    }

    pub fn flush(&mut self) -> Result<(), Error> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            nix::unistd::fsync(file.as_raw_fd())
                .map_err(|err| format_err!("fsync of {:?} failed - {err}", self.tmp_path))?;
        }
        Ok(())
    }

    /// Seal the chunk: fills in the block table of `meta`, makes data and
    /// meta durable and moves the data file to its final name. Returns the
    /// completed meta.
    pub fn finish(mut self, mut meta: ChunkMeta) -> Result<ChunkMeta, Error> {
        self.flush()?;
        self.file.take();

        meta.blocks = std::mem::take(&mut self.blocks);

        std::fs::rename(&self.tmp_path, &self.data_path).map_err(|err| {
            format_err!(
                "renaming {:?} to {:?} failed - {err}",
                self.tmp_path,
                self.data_path
            )
        })?;
        store_chunk_meta(&self.data_path, &meta, true)?;
        dn_tools::fs::fsync_parent_dir(&self.data_path)?;

        Ok(meta)
    }

    /// Drop all written data.
    pub fn abort(mut self) {
        self.file.take();
        let _ = std::fs::remove_file(&self.tmp_path);
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.file.take().is_some() {
            let _ = std::fs::remove_file(&self.tmp_path);
        }
    }
}

/// Read side of a blob chunk; holds the open data file and the parsed
/// meta. Instances are cached by the blob reader cache.
pub struct BlobReader {
    data_path: PathBuf,
    file: File,
    meta: Arc<ChunkMeta>,
}

impl BlobReader {
    pub fn open(data_path: &Path) -> Result<Self, Error> {
        let meta = Arc::new(load_chunk_meta(data_path)?);
        let file = File::open(data_path)
            .map_err(|err| format_err!("unable to open chunk data {data_path:?} - {err}"))?;
        Ok(Self {
            data_path: data_path.to_owned(),
            file,
            meta,
        })
    }

    pub fn meta(&self) -> &Arc<ChunkMeta> {
        &self.meta
    }

    pub fn read_blocks(&self, first_block_index: u32, block_count: u32) -> Result<Vec<Bytes>, Error> {
        let total = self.meta.block_count();
        if first_block_index + block_count > total {
            bail!(
                "block range {}..{} is out of bounds for {:?} ({} blocks)",
                first_block_index,
                first_block_index + block_count,
                self.data_path,
                total,
            );
        }

        let mut offset = self.meta.block_offset(first_block_index);
        let mut blocks = Vec::with_capacity(block_count as usize);
        for index in first_block_index..first_block_index + block_count {
            let block_meta = &self.meta.blocks[index as usize];
            let mut buffer = vec![0u8; block_meta.size as usize];
            self.file
                .read_exact_at(&mut buffer, offset)
                .with_context(|| format!("reading block {index} of {:?}", self.data_path))?;

            let mut hasher = crc32fast::Hasher::new();
            hasher.update(&buffer);
            let checksum = hasher.finalize();
            if checksum != block_meta.checksum {
                bail!(
                    "block {index} of {:?} is corrupt: checksum {checksum:#010x}, expected {:#010x}",
                    self.data_path,
                    block_meta.checksum,
                );
            }

            offset += block_meta.size as u64;
            blocks.push(Bytes::from(buffer));
        }
        Ok(blocks)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_blob_roundtrip() {
        let dir = std::env::temp_dir().join(format!("dn-format-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let data_path = dir.join("0000cafe");

        let mut writer = BlobWriter::create(&data_path).unwrap();
        writer.append_block(b"first block").unwrap();
        writer.append_block(b"").unwrap();
        writer.append_block(&[7u8; 4096]).unwrap();
        assert_eq!(writer.block_count(), 3);

        let meta = writer.finish(ChunkMeta::default()).unwrap();
        assert_eq!(meta.blocks.len(), 3);
        assert_eq!(meta.total_block_size(), 11 + 4096);

        let reader = BlobReader::open(&data_path).unwrap();
        let blocks = reader.read_blocks(0, 3).unwrap();
        assert_eq!(&blocks[0][..], b"first block");
        assert!(blocks[1].is_empty());
        assert_eq!(&blocks[2][..], &[7u8; 4096][..]);

        assert!(reader.read_blocks(2, 2).is_err());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_blob_corruption_detected() {
        let dir = std::env::temp_dir().join(format!("dn-format-corrupt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let data_path = dir.join("0000beef");

        let mut writer = BlobWriter::create(&data_path).unwrap();
        writer.append_block(b"payload payload payload").unwrap();
        writer.finish(ChunkMeta::default()).unwrap();

        // flip one byte in the data file
        let mut raw = std::fs::read(&data_path).unwrap();
        raw[3] ^= 0xff;
        std::fs::write(&data_path, &raw).unwrap();

        let reader = BlobReader::open(&data_path).unwrap();
        let err = reader.read_blocks(0, 1).unwrap_err();
        assert!(err.to_string().contains("corrupt"));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
