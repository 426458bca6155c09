//! Cache of open blob readers.
//!
//! Opening a blob chunk means reading its meta file and keeping a file
//! handle around; both are worth reusing across requests. Readers of
//! removed chunks are evicted explicitly before their files are moved
//! away.

use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Error;

use dn_api_types::ChunkId;
use dn_tools::lru_cache::LruCache;

use crate::format::BlobReader;

pub struct BlobReaderCache {
    readers: Mutex<LruCache<ChunkId, Arc<BlobReader>>>,
}

impl BlobReaderCache {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            readers: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Cached reader for the chunk, opening (and caching) one on a miss.
    pub fn get_reader(&self, chunk_id: ChunkId, data_path: &Path) -> Result<Arc<BlobReader>, Error> {
        {
            let mut readers = self.readers.lock().unwrap();
            if let Some(reader) = readers.get(&chunk_id) {
                return Ok(Arc::clone(reader));
            }
        }

        // open outside the lock; concurrent misses may both open, the
        // second insert simply replaces the first
        let reader = Arc::new(BlobReader::open(data_path)?);
        self.readers
            .lock()
            .unwrap()
            .insert(chunk_id, Arc::clone(&reader));
        Ok(reader)
    }

    pub fn evict_reader(&self, chunk_id: ChunkId) {
        self.readers.lock().unwrap().remove(&chunk_id);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::format::BlobWriter;
    use dn_api_types::{ChunkMeta, ObjectType};

    #[test]
    fn test_reader_cache_hit_and_evict() {
        let dir = std::env::temp_dir().join(format!("dn-reader-cache-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();

        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 99);
        let data_path = dir.join(chunk_id.to_string());
        let mut writer = BlobWriter::create(&data_path).unwrap();
        writer.append_block(b"cached").unwrap();
        writer.finish(ChunkMeta::default()).unwrap();

        let cache = BlobReaderCache::new(4);
        let first = cache.get_reader(chunk_id, &data_path).unwrap();
        let second = cache.get_reader(chunk_id, &data_path).unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        cache.evict_reader(chunk_id);
        let third = cache.get_reader(chunk_id, &data_path).unwrap();
        assert!(!Arc::ptr_eq(&first, &third));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
