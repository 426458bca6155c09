//! Data node bootstrap: builds the subsystem graph from the config and
//! the externally provided collaborators, then starts everything in
//! order (scan → start → sessions → jobs → master connector).

use std::sync::Arc;

use anyhow::Error;

use dn_api_types::{CellId, CellTag, DataNodeConfig, NodeDescriptor};
use dn_datastore::block_store::{BlockStore, PendingReadTracker};
use dn_datastore::chunk::ChunkContext;
use dn_datastore::chunk_store::ChunkStore;
use dn_datastore::location::{exit_process_hook, AbortHook, Location};
use dn_datastore::peer_table::PeerBlockTable;
use dn_datastore::reader_cache::BlobReaderCache;
use dn_datastore::session::{ReplicationClient, SessionManager};
use dn_tools::memory_tracker::MemoryTracker;

use crate::jobs::{
    ErasureRepairClient, JobController, JobEnvironment, MappedMemoryCollector,
    ProcVmstatCollector, ReplicationJobClient,
};
use crate::master::{ConnectorHandle, MasterClient, MasterConnector};
use crate::service::{ChunkDownloader, DataNodeService};

/// External collaborators the node core consumes; tests substitute
/// fakes at these seams.
pub struct NodeEnvironment {
    pub master_client: Arc<dyn MasterClient>,
    pub replication_client: Arc<dyn ReplicationClient>,
    pub replication_job_client: Arc<dyn ReplicationJobClient>,
    pub erasure_repair_client: Arc<dyn ErasureRepairClient>,
    pub chunk_downloader: Arc<dyn ChunkDownloader>,
    pub mapped_memory_collector: Arc<dyn MappedMemoryCollector>,
    /// Invoked when a location must take the process down; defaults to
    /// exiting.
    pub location_abort_hook: AbortHook,
}

impl NodeEnvironment {
    pub fn with_defaults(
        master_client: Arc<dyn MasterClient>,
        replication_client: Arc<dyn ReplicationClient>,
        replication_job_client: Arc<dyn ReplicationJobClient>,
        erasure_repair_client: Arc<dyn ErasureRepairClient>,
        chunk_downloader: Arc<dyn ChunkDownloader>,
    ) -> Self {
        Self {
            master_client,
            replication_client,
            replication_job_client,
            erasure_repair_client,
            chunk_downloader,
            mapped_memory_collector: Arc::new(ProcVmstatCollector),
            location_abort_hook: exit_process_hook(),
        }
    }
}

pub struct DataNode {
    cell_id: CellId,
    store: Arc<ChunkStore>,
    block_store: Arc<BlockStore>,
    session_manager: Arc<SessionManager>,
    peer_table: Arc<PeerBlockTable>,
    job_controller: Arc<JobController>,
    service: Arc<DataNodeService>,
    connector: Option<MasterConnector>,
    connector_handle: ConnectorHandle,
    memory_tracker: Arc<MemoryTracker>,
}

impl DataNode {
    pub fn new(
        config: DataNodeConfig,
        cell_id: CellId,
        cell_tags: Vec<CellTag>,
        local_descriptor: NodeDescriptor,
        memory_limit: u64,
        env: NodeEnvironment,
    ) -> Self {
        let memory_tracker = MemoryTracker::new(memory_limit);

        let store_locations: Vec<Arc<Location>> = config
            .store_locations
            .iter()
            .enumerate()
            .map(|(index, location_config)| {
                Location::new_store(
                    &format!("store{index}"),
                    location_config,
                    Arc::clone(&env.location_abort_hook),
                )
            })
            .collect();
        let cache_locations: Vec<Arc<Location>> = config
            .cache_locations
            .iter()
            .enumerate()
            .map(|(index, location_config)| {
                Location::new_cache(
                    &format!("cache{index}"),
                    location_config,
                    Arc::clone(&env.location_abort_hook),
                )
            })
            .collect();

        let pending_read_tracker = PendingReadTracker::new();
        let ctx = Arc::new(ChunkContext {
            memory_tracker: Arc::clone(&memory_tracker),
            reader_cache: BlobReaderCache::new(config.reader_cache_capacity),
            pending_read_tracker: Arc::clone(&pending_read_tracker),
            max_blocks_per_read: config.max_blocks_per_read,
            max_bytes_per_read: config.max_bytes_per_read,
        });

        let store = ChunkStore::new(ctx, store_locations, cache_locations);
        let block_store = BlockStore::new(
            &config.block_cache,
            Arc::clone(store.registry()),
            pending_read_tracker,
        );
        let peer_table = Arc::new(PeerBlockTable::new(config.peer_table.clone()));

        let session_manager = SessionManager::new(
            Arc::clone(&store),
            Arc::clone(&block_store),
            Arc::clone(&env.replication_client),
            config.session_timeout,
        );

        let job_controller = JobController::new(
            config.job_controller.clone(),
            JobEnvironment {
                store: Arc::clone(&store),
                block_store: Arc::clone(&block_store),
                replication: Arc::clone(&env.replication_job_client),
                repair: Arc::clone(&env.erasure_repair_client),
            },
            Arc::clone(&memory_tracker),
            Arc::clone(&env.mapped_memory_collector),
        );

        let connector = MasterConnector::new(
            config.master_connector.clone(),
            Arc::clone(&env.master_client),
            Arc::clone(&store),
            Arc::clone(&session_manager),
            Arc::clone(&job_controller),
            Arc::clone(&memory_tracker),
            local_descriptor,
            cell_tags,
        );
        let connector_handle = connector.handle();

        let service = DataNodeService::new(
            config,
            Arc::clone(&store),
            Arc::clone(&block_store),
            Arc::clone(&session_manager),
            Arc::clone(&peer_table),
            connector_handle.clone(),
            Arc::clone(&env.chunk_downloader),
        );

        Self {
            cell_id,
            store,
            block_store,
            session_manager,
            peer_table,
            job_controller,
            service,
            connector: Some(connector),
            connector_handle,
            memory_tracker,
        }
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    pub fn block_store(&self) -> &Arc<BlockStore> {
        &self.block_store
    }

    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.session_manager
    }

    pub fn peer_table(&self) -> &Arc<PeerBlockTable> {
        &self.peer_table
    }

    pub fn job_controller(&self) -> &Arc<JobController> {
        &self.job_controller
    }

    pub fn service(&self) -> &Arc<DataNodeService> {
        &self.service
    }

    pub fn connector_handle(&self) -> &ConnectorHandle {
        &self.connector_handle
    }

    pub fn memory_tracker(&self) -> &Arc<MemoryTracker> {
        &self.memory_tracker
    }

    /// Take the connector out to drive it manually instead of spawning
    /// the background task. Used by tests.
    pub fn take_connector(&mut self) -> Option<MasterConnector> {
        self.connector.take()
    }

    /// Scan and start all locations, then bring up the background
    /// machinery. The connector task runs until the node shuts down.
    pub async fn start(&mut self) -> Result<(), Error> {
        self.store.initialize(self.cell_id).await?;
        self.session_manager.start();
        self.job_controller.start();

        if let Some(connector) = self.connector.take() {
            tokio::spawn(connector.run());
        }

        log::info!("data node started (cell: {})", self.cell_id);
        Ok(())
    }
}
