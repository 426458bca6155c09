use std::fmt;
use std::str::FromStr;

use anyhow::{bail, format_err, Error};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Object type encoded in the top bits of a chunk id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ObjectType {
    /// Regular blob chunk (data file + meta file).
    Blob,
    /// Erasure-coded blob chunk part.
    ErasureBlob,
    /// Append-only journal chunk (data file + index file).
    Journal,
    /// Cache-only artifact.
    Artifact,
}

impl ObjectType {
    fn from_tag(tag: u16) -> Result<Self, Error> {
        Ok(match tag {
            0x0064 => ObjectType::Blob,
            0x0065 => ObjectType::ErasureBlob,
            0x0066 => ObjectType::Journal,
            0x0067 => ObjectType::Artifact,
            _ => bail!("unknown object type tag {tag:#06x}"),
        })
    }

    fn tag(self) -> u16 {
        match self {
            ObjectType::Blob => 0x0064,
            ObjectType::ErasureBlob => 0x0065,
            ObjectType::Journal => 0x0066,
            ObjectType::Artifact => 0x0067,
        }
    }
}

/// Tag of the master cell a chunk belongs to.
pub type CellTag = u16;

/// 128 bit opaque chunk identifier.
///
/// Layout: bits 127..112 hold the object type tag, bits 111..96 the cell
/// tag, the remainder is unique entropy. The id is immutable and globally
/// unique; it renders as 32 lowercase hex digits.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(pub u128);

impl ChunkId {
    pub fn new(object_type: ObjectType, cell_tag: CellTag, entropy: u128) -> Self {
        let high = ((object_type.tag() as u128) << 112) | ((cell_tag as u128) << 96);
        ChunkId(high | (entropy & ((1u128 << 96) - 1)))
    }

    pub fn object_type(&self) -> Result<ObjectType, Error> {
        ObjectType::from_tag((self.0 >> 112) as u16)
    }

    pub fn cell_tag(&self) -> CellTag {
        (self.0 >> 96) as u16
    }

    pub fn is_blob(&self) -> bool {
        matches!(
            self.object_type(),
            Ok(ObjectType::Blob) | Ok(ObjectType::ErasureBlob)
        )
    }

    pub fn is_erasure(&self) -> bool {
        matches!(self.object_type(), Ok(ObjectType::ErasureBlob))
    }

    pub fn is_journal(&self) -> bool {
        matches!(self.object_type(), Ok(ObjectType::Journal))
    }

    pub fn is_artifact(&self) -> bool {
        matches!(self.object_type(), Ok(ObjectType::Artifact))
    }

    /// Low entropy byte of the id, used to fan chunk files out into `<hh>/`
    /// directories.
    pub fn hash_byte(&self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn to_bytes(&self) -> [u8; 16] {
        self.0.to_le_bytes()
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        ChunkId(u128::from_le_bytes(bytes))
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

impl fmt::Debug for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for ChunkId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.len() != 32 {
            bail!("invalid chunk id '{s}': expected 32 hex digits");
        }
        let raw = u128::from_str_radix(s, 16)
            .map_err(|err| format_err!("invalid chunk id '{s}' - {err}"))?;
        Ok(ChunkId(raw))
    }
}

impl Serialize for ChunkId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ChunkId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Identifier of a single block within a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId {
    pub chunk_id: ChunkId,
    pub block_index: u32,
}

impl BlockId {
    pub fn new(chunk_id: ChunkId, block_index: u32) -> Self {
        Self {
            chunk_id,
            block_index,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.chunk_id, self.block_index)
    }
}

/// Identifier of a maintenance job. Shares the chunk id layout so that the
/// owning cell can be recovered from the id alone.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub ChunkId);

impl JobId {
    pub fn cell_tag(&self) -> CellTag {
        self.0.cell_tag()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Identifier of the master cell cluster a node belongs to, persisted in the
/// `cell_id` file of every location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

impl FromStr for CellId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let raw = u64::from_str_radix(s.trim(), 16)
            .map_err(|err| format_err!("invalid cell id '{s}' - {err}"))?;
        Ok(CellId(raw))
    }
}
