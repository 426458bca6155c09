//! Data node request surface.
//!
//! Each handler validates master connectivity first, then does its work;
//! read surfaces flip into throttling mode when the outgoing bus or the
//! pending disk reads run hot, answering with peer suggestions instead
//! of data, and all read replies are charged against the egress
//! throttler. The wire framing around these entrypoints is provided by
//! the RPC layer; requests and responses here are plain structs.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::{bail, Error};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use dn_api_types::{
    BlockId, ChunkId, ChunkMeta, DataNodeConfig, ErrorKind, NodeDescriptor, SessionType,
    WorkloadCategory,
};
use dn_datastore::block_store::BlockStore;
use dn_datastore::chunk_store::ChunkStore;
use dn_datastore::location::Location;
use dn_datastore::peer_table::PeerBlockTable;
use dn_datastore::session::{SessionManager, SessionOptions};
use dn_table::chunk_meta::CachedChunkMeta;
use dn_table::row::Key;
use dn_tools::throttler::ThroughputThrottler;

use crate::master::ConnectorHandle;

/// Downloads a chunk from its peers into a cache location; the transfer
/// protocol lives outside this crate.
#[async_trait]
pub trait ChunkDownloader: Send + Sync {
    async fn download(&self, chunk_id: ChunkId, location: Arc<Location>) -> Result<(), Error>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StartChunkRequest {
    pub chunk_id: ChunkId,
    pub session_type: SessionType,
    #[serde(default)]
    pub sync_on_close: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FinishChunkRequest {
    pub chunk_id: ChunkId,
    pub meta: ChunkMeta,
    #[serde(default)]
    pub block_count: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FinishChunkResponse {
    pub disk_space: u64,
}

#[derive(Debug, Clone)]
pub struct PutBlocksRequest {
    pub chunk_id: ChunkId,
    pub first_block_index: u32,
    pub blocks: Vec<Bytes>,
    pub enable_caching: bool,
    pub flush_blocks: bool,
}

#[derive(Debug, Clone)]
pub struct SendBlocksRequest {
    pub chunk_id: ChunkId,
    pub first_block_index: u32,
    pub block_count: u32,
    pub target: NodeDescriptor,
}

#[derive(Debug, Clone)]
pub struct GetBlockSetRequest {
    pub chunk_id: ChunkId,
    pub block_indexes: Vec<u32>,
    pub enable_caching: bool,
    pub workload: WorkloadCategory,
    pub priority: i64,
    /// The requester's own address plus an expiration: registering it
    /// makes this node hand the requester out as a peer for these
    /// blocks.
    pub peer_descriptor: Option<NodeDescriptor>,
    pub peer_expiration: Option<SystemTime>,
}

#[derive(Debug, Clone, Default)]
pub struct PeerSuggestion {
    pub block_index: u32,
    pub peers: Vec<NodeDescriptor>,
}

#[derive(Debug, Clone, Default)]
pub struct GetBlockSetResponse {
    pub has_complete_chunk: bool,
    pub throttling: bool,
    /// Index-aligned with the requested block indexes; `None` when the
    /// block is not on this node.
    pub blocks: Vec<Option<Bytes>>,
    pub peer_suggestions: Vec<PeerSuggestion>,
}

#[derive(Debug, Clone)]
pub struct GetBlockRangeRequest {
    pub chunk_id: ChunkId,
    pub first_block_index: u32,
    pub block_count: u32,
    pub workload: WorkloadCategory,
    pub priority: i64,
}

#[derive(Debug, Clone, Default)]
pub struct GetBlockRangeResponse {
    pub has_complete_chunk: bool,
    pub throttling: bool,
    pub blocks: Vec<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GetChunkMetaRequest {
    pub chunk_id: ChunkId,
    #[serde(default)]
    pub extension_tags: Option<Vec<u32>>,
    /// Restrict the data block table to one partition of a partitioned
    /// chunk.
    #[serde(default)]
    pub partition_tag: Option<u32>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GetTableSamplesRequest {
    pub chunk_id: ChunkId,
    pub sample_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct GetChunkSplitsRequest {
    pub chunk_id: ChunkId,
    pub split_data_size: u64,
}

#[derive(Debug, Clone)]
pub struct UpdatePeerRequest {
    pub peer_descriptor: NodeDescriptor,
    pub expiration: SystemTime,
    pub block_ids: Vec<BlockId>,
}

pub struct DataNodeService {
    config: DataNodeConfig,
    store: Arc<ChunkStore>,
    block_store: Arc<BlockStore>,
    session_manager: Arc<SessionManager>,
    peer_table: Arc<PeerBlockTable>,
    connector: ConnectorHandle,
    downloader: Arc<dyn ChunkDownloader>,
    out_throttler: ThroughputThrottler,
    /// Pending outgoing bus bytes, maintained by the transport layer.
    bus_pending_out: AtomicI64,
    bus_pending_in: AtomicI64,
}

impl DataNodeService {
    pub fn new(
        config: DataNodeConfig,
        store: Arc<ChunkStore>,
        block_store: Arc<BlockStore>,
        session_manager: Arc<SessionManager>,
        peer_table: Arc<PeerBlockTable>,
        connector: ConnectorHandle,
        downloader: Arc<dyn ChunkDownloader>,
    ) -> Arc<Self> {
        let out_throttler = ThroughputThrottler::new(config.out_throttler_rate);
        Arc::new(Self {
            config,
            store,
            block_store,
            session_manager,
            peer_table,
            connector,
            downloader,
            out_throttler,
            bus_pending_out: AtomicI64::new(0),
            bus_pending_in: AtomicI64::new(0),
        })
    }

    /// Transport feedback: how many response bytes are queued on the
    /// wire right now.
    pub fn set_bus_pending_out(&self, bytes: i64) {
        self.bus_pending_out.store(bytes, Ordering::SeqCst);
    }

    pub fn set_bus_pending_in(&self, bytes: i64) {
        self.bus_pending_in.store(bytes, Ordering::SeqCst);
    }

    fn validate_connected(&self) -> Result<(), Error> {
        if !self.connector.is_connected() {
            bail!(ErrorKind::Unavailable(
                "master is not connected".to_string()
            ));
        }
        Ok(())
    }

    fn is_out_throttling(&self) -> bool {
        let bus_pending = self.bus_pending_out.load(Ordering::SeqCst);
        if bus_pending > self.config.bus_out_throttling_limit as i64 {
            log::debug!(
                "outgoing throttling is active: {bus_pending} > {}",
                self.config.bus_out_throttling_limit,
            );
            return true;
        }
        let disk_pending = self.block_store.pending_read_size();
        if disk_pending > self.config.disk_read_throttling_limit as i64 {
            log::debug!(
                "disk read throttling is active: {disk_pending} > {}",
                self.config.disk_read_throttling_limit,
            );
            return true;
        }
        false
    }

    fn is_in_throttling(&self) -> bool {
        self.bus_pending_in.load(Ordering::SeqCst) > self.config.bus_in_throttling_limit as i64
    }

    // -- session surface ----------------------------------------------------

    pub async fn start_chunk(&self, request: StartChunkRequest) -> Result<(), Error> {
        self.validate_connected()?;
        self.session_manager.start_session(
            request.chunk_id,
            SessionOptions {
                session_type: request.session_type,
                sync_on_close: request.sync_on_close,
            },
        )?;
        Ok(())
    }

    pub async fn finish_chunk(
        &self,
        request: FinishChunkRequest,
    ) -> Result<FinishChunkResponse, Error> {
        self.validate_connected()?;
        let session = self.session_manager.get_session(request.chunk_id)?;
        let chunk = session.finish(request.meta, request.block_count).await?;
        Ok(FinishChunkResponse {
            disk_space: chunk.disk_space(),
        })
    }

    pub async fn cancel_chunk(&self, chunk_id: ChunkId) -> Result<(), Error> {
        let session = self.session_manager.get_session(chunk_id)?;
        session.cancel(&anyhow::format_err!("canceled by client request"));
        Ok(())
    }

    pub async fn ping_session(&self, chunk_id: ChunkId) -> Result<(), Error> {
        let session = self.session_manager.get_session(chunk_id)?;
        session.ping();
        Ok(())
    }

    pub async fn put_blocks(&self, request: PutBlocksRequest) -> Result<(), Error> {
        if self.is_in_throttling() {
            bail!(ErrorKind::Unavailable("write throttling is active".into()));
        }
        self.validate_connected()?;

        let session = self.session_manager.get_session(request.chunk_id)?;
        let last_block_index =
            request.first_block_index + request.blocks.len().max(1) as u32 - 1;
        session
            .put_blocks(
                request.first_block_index,
                request.blocks,
                request.enable_caching,
            )
            .await?;
        if request.flush_blocks {
            session.flush_blocks(last_block_index).await?;
        }
        Ok(())
    }

    pub async fn send_blocks(&self, request: SendBlocksRequest) -> Result<(), Error> {
        self.validate_connected()?;
        let session = self.session_manager.get_session(request.chunk_id)?;
        session
            .send_blocks(
                request.first_block_index,
                request.block_count,
                request.target,
            )
            .await
    }

    pub async fn flush_blocks(&self, chunk_id: ChunkId, block_index: u32) -> Result<(), Error> {
        self.validate_connected()?;
        let session = self.session_manager.get_session(chunk_id)?;
        session.flush_blocks(block_index).await
    }

    // -- read surface -------------------------------------------------------

    pub async fn get_block_set(
        &self,
        request: GetBlockSetRequest,
    ) -> Result<GetBlockSetResponse, Error> {
        self.validate_connected()?;

        let mut response = GetBlockSetResponse {
            has_complete_chunk: self.store.find_chunk(request.chunk_id).is_some(),
            throttling: self.is_out_throttling(),
            ..Default::default()
        };

        if response.throttling {
            // cannot push the data out; suggest peers instead
            for &block_index in &request.block_indexes {
                let block_id = BlockId::new(request.chunk_id, block_index);
                let peers = self.peer_table.get_peers(block_id);
                if !peers.is_empty() {
                    response.peer_suggestions.push(PeerSuggestion {
                        block_index,
                        peers,
                    });
                }
            }
            response
                .blocks
                .resize(request.block_indexes.len(), None);
        } else {
            // decreasing priorities take advantage of sequential reads
            let fetches = request.block_indexes.iter().enumerate().map(
                |(index, &block_index)| {
                    let block_store = Arc::clone(&self.block_store);
                    let chunk_id = request.chunk_id;
                    let priority = request.priority - index as i64;
                    let enable_caching = request.enable_caching;
                    async move {
                        block_store
                            .find_block(chunk_id, block_index, priority, enable_caching)
                            .await
                    }
                },
            );
            response.blocks = futures::future::try_join_all(fetches).await?;
        }

        // register the requester as a future peer for these blocks
        if let (Some(descriptor), Some(expiration)) =
            (request.peer_descriptor, request.peer_expiration)
        {
            for &block_index in &request.block_indexes {
                self.peer_table.update_peer(
                    BlockId::new(request.chunk_id, block_index),
                    descriptor.clone(),
                    expiration,
                );
            }
        }

        let payload: u64 = response
            .blocks
            .iter()
            .flatten()
            .map(|block| block.len() as u64)
            .sum();
        self.out_throttler.throttle(payload).await;

        Ok(response)
    }

    pub async fn get_block_range(
        &self,
        request: GetBlockRangeRequest,
    ) -> Result<GetBlockRangeResponse, Error> {
        self.validate_connected()?;

        let mut response = GetBlockRangeResponse {
            has_complete_chunk: self.store.find_chunk(request.chunk_id).is_some(),
            throttling: self.is_out_throttling(),
            ..Default::default()
        };

        if !response.throttling {
            response.blocks = self
                .block_store
                .find_blocks(
                    request.chunk_id,
                    request.first_block_index,
                    request.block_count,
                    request.priority,
                    request.workload,
                )
                .await?;
        }

        let payload: u64 = response.blocks.iter().map(|block| block.len() as u64).sum();
        self.out_throttler.throttle(payload).await;

        Ok(response)
    }

    pub async fn get_chunk_meta(
        &self,
        request: GetChunkMetaRequest,
    ) -> Result<ChunkMeta, Error> {
        self.validate_connected()?;
        let chunk = self.store.get_chunk(request.chunk_id)?;
        let meta = chunk
            .get_meta(request.priority, request.extension_tags)
            .await?;
        let mut meta = meta.as_ref().clone();

        if let Some(partition_tag) = request.partition_tag {
            use dn_table::chunk_meta::{DataBlocksExt, DATA_BLOCKS_EXT_TAG};
            let mut blocks_ext: DataBlocksExt = meta
                .get_extension(DATA_BLOCKS_EXT_TAG)
                .map_err(|err| err.context("chunk is not partitioned"))?;
            blocks_ext
                .data_blocks
                .retain(|block| block.partition_tag == Some(partition_tag));
            meta.set_extension(DATA_BLOCKS_EXT_TAG, &blocks_ext)?;
        }

        Ok(meta)
    }

    /// Evenly spaced sample keys of a table chunk, served off the cached
    /// meta on the worker path.
    pub async fn get_table_samples(
        &self,
        request: GetTableSamplesRequest,
    ) -> Result<Vec<Key>, Error> {
        self.validate_connected()?;
        let chunk = self.store.get_chunk(request.chunk_id)?;
        let meta = chunk.get_meta(0, None).await?;
        let table_meta = CachedChunkMeta::parse(request.chunk_id, &meta)?;

        let block_count = table_meta.data_blocks.len();
        if block_count == 0 || request.sample_count == 0 {
            return Ok(Vec::new());
        }
        let step = (block_count as f64 / request.sample_count as f64).max(1.0);
        let mut samples = Vec::new();
        let mut position = 0.0;
        while (position as usize) < block_count && samples.len() < request.sample_count {
            samples.push(table_meta.data_blocks[position as usize].last_key.clone());
            position += step;
        }
        Ok(samples)
    }

    /// Split boundary keys such that every split covers roughly
    /// `split_data_size` bytes of blocks.
    pub async fn get_chunk_splits(
        &self,
        request: GetChunkSplitsRequest,
    ) -> Result<Vec<Key>, Error> {
        self.validate_connected()?;
        if request.split_data_size == 0 {
            bail!("split data size must be positive");
        }
        let chunk = self.store.get_chunk(request.chunk_id)?;
        let meta = chunk.get_meta(0, None).await?;
        let table_meta = CachedChunkMeta::parse(request.chunk_id, &meta)?;

        let mut splits = Vec::new();
        let mut accumulated = 0u64;
        for (index, block) in table_meta.data_blocks.iter().enumerate() {
            accumulated += table_meta.block_sizes[index] as u64;
            if accumulated >= request.split_data_size {
                splits.push(block.last_key.clone());
                accumulated = 0;
            }
        }
        Ok(splits)
    }

    /// Download a chunk into the chunk cache.
    pub async fn precache_chunk(&self, chunk_id: ChunkId) -> Result<(), Error> {
        self.validate_connected()?;
        if self.store.find_chunk(chunk_id).is_some() {
            return Ok(());
        }

        let object_type = chunk_id.object_type()?;
        let location = self
            .store
            .cache_locations()
            .iter()
            .filter(|location| location.accepts_chunk_type(object_type))
            .max_by_key(|location| location.available_space())
            .cloned()
            .ok_or_else(|| {
                anyhow::format_err!("no cache location accepts chunks of type {object_type:?}")
            })?;
        self.downloader.download(chunk_id, location).await
    }

    /// One-way peer hint registration.
    pub fn update_peer(&self, request: UpdatePeerRequest) {
        for block_id in request.block_ids {
            self.peer_table
                .update_peer(block_id, request.peer_descriptor.clone(), request.expiration);
        }
    }
}
