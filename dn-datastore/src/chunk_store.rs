//! Global chunk registry and the store built on top of it.
//!
//! The registry is the single lookup point for chunk handles (store and
//! cache locations alike) and fans out added/removed events to
//! subscribers; the master connector turns those into heartbeat deltas.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::{bail, Error};

use dn_api_types::{
    ChunkAddInfo, ChunkDescriptor, ChunkId, ChunkRemoveInfo, ErrorKind, LocationStatistics,
    ObjectType,
};

use crate::chunk::{Chunk, ChunkContext};
use crate::journal::JournalFile;
use crate::location::{Location, LocationKind};

#[derive(Clone)]
pub enum ChunkEvent {
    Added(Arc<Chunk>),
    Removed(Arc<Chunk>),
}

pub struct ChunkRegistry {
    chunks: RwLock<HashMap<ChunkId, Arc<Chunk>>>,
    events: tokio::sync::broadcast::Sender<ChunkEvent>,
}

impl Default for ChunkRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkRegistry {
    pub fn new() -> Self {
        let (events, _) = tokio::sync::broadcast::channel(8192);
        Self {
            chunks: RwLock::new(HashMap::new()),
            events,
        }
    }

    pub fn find_chunk(&self, chunk_id: ChunkId) -> Option<Arc<Chunk>> {
        self.chunks.read().unwrap().get(&chunk_id).cloned()
    }

    pub fn get_chunk(&self, chunk_id: ChunkId) -> Result<Arc<Chunk>, Error> {
        self.find_chunk(chunk_id)
            .ok_or_else(|| anyhow::Error::new(ErrorKind::NoSuchChunk(chunk_id)))
    }

    pub fn chunks(&self) -> Vec<Arc<Chunk>> {
        self.chunks.read().unwrap().values().cloned().collect()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.read().unwrap().len()
    }

    /// Subscribe to chunk added/removed events. Delivery is best effort;
    /// subscribers must tolerate duplicates and handle lag.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<ChunkEvent> {
        self.events.subscribe()
    }

    pub fn register_chunk(&self, chunk: Arc<Chunk>) -> Result<(), Error> {
        {
            let mut chunks = self.chunks.write().unwrap();
            if chunks.contains_key(&chunk.id()) {
                bail!(ErrorKind::ChunkAlreadyExists(chunk.id()));
            }
            chunks.insert(chunk.id(), Arc::clone(&chunk));
        }

        let location = chunk.location();
        location.update_chunk_count(1);
        location.update_used_space(chunk.disk_space() as i64);

        log::debug!(
            "chunk registered (chunk: {}, location: {})",
            chunk.id(),
            location.id(),
        );
        let _ = self.events.send(ChunkEvent::Added(chunk));
        Ok(())
    }

    pub fn unregister_chunk(&self, chunk_id: ChunkId) -> Option<Arc<Chunk>> {
        let chunk = self.chunks.write().unwrap().remove(&chunk_id)?;

        let location = chunk.location();
        location.update_chunk_count(-1);
        location.update_used_space(-(chunk.disk_space() as i64));

        log::debug!(
            "chunk unregistered (chunk: {}, location: {})",
            chunk.id(),
            location.id(),
        );
        let _ = self.events.send(ChunkEvent::Removed(Arc::clone(&chunk)));
        Some(chunk)
    }
}

pub fn build_add_info(chunk: &Arc<Chunk>) -> ChunkAddInfo {
    ChunkAddInfo {
        chunk_id: chunk.id(),
        cached: chunk.location().kind() == LocationKind::Cache,
        active: chunk.is_active(),
        sealed: chunk.is_sealed(),
    }
}

pub fn build_remove_info(chunk: &Arc<Chunk>) -> ChunkRemoveInfo {
    ChunkRemoveInfo {
        chunk_id: chunk.id(),
        cached: chunk.location().kind() == LocationKind::Cache,
    }
}

/// The set of locations this node serves plus the registry of their
/// chunks.
pub struct ChunkStore {
    ctx: Arc<ChunkContext>,
    registry: Arc<ChunkRegistry>,
    store_locations: Vec<Arc<Location>>,
    cache_locations: Vec<Arc<Location>>,
}

impl ChunkStore {
    pub fn new(
        ctx: Arc<ChunkContext>,
        store_locations: Vec<Arc<Location>>,
        cache_locations: Vec<Arc<Location>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            registry: Arc::new(ChunkRegistry::new()),
            store_locations,
            cache_locations,
        })
    }

    pub fn registry(&self) -> &Arc<ChunkRegistry> {
        &self.registry
    }

    pub fn context(&self) -> &Arc<ChunkContext> {
        &self.ctx
    }

    pub fn store_locations(&self) -> &[Arc<Location>] {
        &self.store_locations
    }

    pub fn cache_locations(&self) -> &[Arc<Location>] {
        &self.cache_locations
    }

    /// Scan all locations, materialize chunk handles for everything found
    /// and start the locations' background machinery.
    pub async fn initialize(&self, cell_id: dn_api_types::CellId) -> Result<(), Error> {
        for location in self.store_locations.iter().chain(&self.cache_locations) {
            let descriptors = location.scan().await;
            for descriptor in descriptors {
                match self.materialize_chunk(location, &descriptor) {
                    Ok(chunk) => {
                        // a duplicate id across locations is a hard error
                        self.registry.register_chunk(chunk)?;
                    }
                    Err(err) => {
                        log::error!(
                            "failed to materialize chunk {} at {} - {err:#}",
                            descriptor.id,
                            location.id(),
                        );
                    }
                }
            }
            location.start(cell_id).await?;
        }
        Ok(())
    }

    fn materialize_chunk(
        &self,
        location: &Arc<Location>,
        descriptor: &ChunkDescriptor,
    ) -> Result<Arc<Chunk>, Error> {
        let chunk = match descriptor.id.object_type()? {
            ObjectType::Journal => {
                let journal = JournalFile::open(&location.chunk_path(descriptor.id))?;
                Chunk::new_journal(
                    Arc::clone(&self.ctx),
                    Arc::clone(location),
                    descriptor,
                    journal,
                )
            }
            _ => Chunk::new_blob(
                Arc::clone(&self.ctx),
                Arc::clone(location),
                descriptor,
                None,
            ),
        };
        Ok(chunk)
    }

    /// Register a freshly written chunk (the session finish path).
    pub fn register_new_chunk(&self, chunk: Arc<Chunk>) -> Result<(), Error> {
        self.registry.register_chunk(chunk)
    }

    pub fn find_chunk(&self, chunk_id: ChunkId) -> Option<Arc<Chunk>> {
        self.registry.find_chunk(chunk_id)
    }

    pub fn get_chunk(&self, chunk_id: ChunkId) -> Result<Arc<Chunk>, Error> {
        self.registry.get_chunk(chunk_id)
    }

    /// Pick the emptiest enabled location accepting this chunk type.
    pub fn place_chunk(&self, object_type: ObjectType) -> Result<Arc<Location>, Error> {
        let mut best: Option<(u64, Arc<Location>)> = None;
        let candidates = match object_type {
            ObjectType::Artifact => &self.cache_locations,
            _ => &self.store_locations,
        };
        for location in candidates {
            if !location.accepts_chunk_type(object_type) {
                continue;
            }
            let available = location.available_space();
            if best.as_ref().map_or(true, |(space, _)| available > *space) {
                best = Some((available, Arc::clone(location)));
            }
        }
        match best {
            Some((_, location)) => Ok(location),
            None => bail!(
                "no enabled location accepts chunks of type {object_type:?}"
            ),
        }
    }

    /// Schedule chunk removal; the returned future resolves after the
    /// files are gone and the chunk has left the registry.
    pub fn remove_chunk(
        self: &Arc<Self>,
        chunk: Arc<Chunk>,
    ) -> impl std::future::Future<Output = Result<(), Error>> + Send + 'static {
        let this = Arc::clone(self);
        let removal = chunk.schedule_remove();
        async move {
            removal.await?;
            this.registry.unregister_chunk(chunk.id());
            Ok(())
        }
    }

    pub fn location_statistics(&self) -> Vec<LocationStatistics> {
        self.store_locations
            .iter()
            .chain(&self.cache_locations)
            .map(|location| LocationStatistics {
                available_space: location.available_space(),
                used_space: location.used_space(),
                chunk_count: location.chunk_count(),
                session_count: location.session_count(),
                full: location.is_full(),
                enabled: location.is_enabled(),
            })
            .collect()
    }

    /// Alerts from disabled locations, surfaced through heartbeats.
    pub fn location_alerts(&self) -> Vec<String> {
        self.store_locations
            .iter()
            .chain(&self.cache_locations)
            .filter_map(|location| location.alert())
            .collect()
    }
}
