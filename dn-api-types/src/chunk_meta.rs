use std::collections::BTreeMap;

use anyhow::{format_err, Error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::ChunkId;

/// Per-block entry of the chunk meta block table. Offsets are implied by
/// the running sum of sizes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct BlockMeta {
    pub size: u32,
    pub checksum: u32,
}

/// Miscellaneous chunk-level counters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MiscExt {
    #[serde(default)]
    pub row_count: u64,
    #[serde(default)]
    pub uncompressed_data_size: u64,
    #[serde(default)]
    pub sealed: bool,
    #[serde(default)]
    pub min_timestamp: u64,
    #[serde(default)]
    pub max_timestamp: u64,
}

/// The chunk meta document stored in a blob chunk's `.meta` file.
///
/// Subsystems attach their own data as numbered extensions; an extension is
/// an opaque JSON value here and a typed struct at its owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkMeta {
    pub blocks: Vec<BlockMeta>,
    #[serde(default)]
    pub misc: MiscExt,
    #[serde(default)]
    pub extensions: BTreeMap<u32, serde_json::Value>,
}

impl ChunkMeta {
    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Byte offset of a block within the data file.
    pub fn block_offset(&self, block_index: u32) -> u64 {
        self.blocks[..block_index as usize]
            .iter()
            .map(|b| b.size as u64)
            .sum()
    }

    pub fn total_block_size(&self) -> u64 {
        self.blocks.iter().map(|b| b.size as u64).sum()
    }

    pub fn set_extension<T: Serialize>(&mut self, tag: u32, ext: &T) -> Result<(), Error> {
        let value = serde_json::to_value(ext)?;
        self.extensions.insert(tag, value);
        Ok(())
    }

    pub fn get_extension<T: DeserializeOwned>(&self, tag: u32) -> Result<T, Error> {
        let value = self
            .extensions
            .get(&tag)
            .ok_or_else(|| format_err!("chunk meta extension {tag} is missing"))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    pub fn find_extension<T: DeserializeOwned>(&self, tag: u32) -> Result<Option<T>, Error> {
        match self.extensions.get(&tag) {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// A copy retaining only the listed extension tags.
    pub fn filter_extensions(&self, tags: &[u32]) -> ChunkMeta {
        let mut filtered = self.clone();
        filtered.extensions.retain(|tag, _| tags.contains(tag));
        filtered
    }

    /// Rough accounting size of the cached meta.
    pub fn memory_usage(&self) -> usize {
        let ext_size: usize = self
            .extensions
            .values()
            .map(|v| v.to_string().len())
            .sum();
        std::mem::size_of::<Self>() + self.blocks.len() * std::mem::size_of::<BlockMeta>() + ext_size
    }
}

/// Result of scanning one chunk's files off a location.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkDescriptor {
    pub id: ChunkId,
    pub disk_space: u64,
    #[serde(default)]
    pub row_count: Option<u64>,
    #[serde(default)]
    pub sealed: Option<bool>,
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct DummyExt {
        names: Vec<String>,
    }

    #[test]
    fn test_extension_roundtrip() {
        let mut meta = ChunkMeta {
            blocks: vec![
                BlockMeta { size: 10, checksum: 1 },
                BlockMeta { size: 20, checksum: 2 },
                BlockMeta { size: 30, checksum: 3 },
            ],
            ..Default::default()
        };
        assert_eq!(meta.block_offset(0), 0);
        assert_eq!(meta.block_offset(2), 30);
        assert_eq!(meta.total_block_size(), 60);

        let ext = DummyExt {
            names: vec!["a".into(), "b".into()],
        };
        meta.set_extension(17, &ext).unwrap();
        assert_eq!(meta.get_extension::<DummyExt>(17).unwrap(), ext);
        assert!(meta.get_extension::<DummyExt>(18).is_err());
        assert!(meta.find_extension::<DummyExt>(18).unwrap().is_none());

        let filtered = meta.filter_extensions(&[]);
        assert!(filtered.extensions.is_empty());
        assert_eq!(filtered.blocks.len(), 3);
    }
}
