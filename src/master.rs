//! Master connector.
//!
//! Per master cell the connector walks `Offline → Registered → Online`:
//! it acquires a lease transaction, registers at the primary cell, sends
//! one full heartbeat per cell and then switches to incremental deltas.
//! Chunk added/removed events are captured into per-cell deltas keyed by
//! the chunk's cell tag; entries leave a delta only once a heartbeat
//! reporting them (at an unchanged chunk version) succeeds. A lease
//! abort, an unretriable failure or an incarnation mismatch resets the
//! connector and schedules re-registration.
//!
//! All connector state is owned by a single task; other subsystems only
//! see the cheap [`ConnectorHandle`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{format_err, Error};
use async_trait::async_trait;

use dn_api_types::{
    error_kind, CellTag, ChunkId, ErrorKind, FullHeartbeatRequest, IncrementalHeartbeatRequest,
    IncrementalHeartbeatResponse, JobHeartbeatRequest, JobHeartbeatResponse,
    MasterConnectorConfig, NodeDescriptor, NodeStatistics, RegisterNodeRequest,
    RegisterNodeResponse, SessionType,
};
use dn_datastore::chunk::Chunk;
use dn_datastore::chunk_store::{build_add_info, build_remove_info, ChunkEvent, ChunkStore};
use dn_datastore::session::SessionManager;
use dn_tools::memory_tracker::MemoryTracker;

use crate::jobs::JobController;

/// A lease owned by the node; the watch channel flips to `true` when the
/// master aborts it.
pub struct LeaseTransaction {
    pub id: u64,
    pub aborted: tokio::sync::watch::Receiver<bool>,
}

/// RPC surface the connector consumes from the master cluster.
#[async_trait]
pub trait MasterClient: Send + Sync {
    async fn start_lease_transaction(&self) -> Result<LeaseTransaction, Error>;
    async fn ping_lease(&self, lease_id: u64) -> Result<(), Error>;
    async fn register_node(
        &self,
        request: RegisterNodeRequest,
    ) -> Result<RegisterNodeResponse, Error>;
    async fn full_heartbeat(
        &self,
        cell_tag: CellTag,
        request: FullHeartbeatRequest,
    ) -> Result<(), Error>;
    async fn incremental_heartbeat(
        &self,
        cell_tag: CellTag,
        request: IncrementalHeartbeatRequest,
    ) -> Result<IncrementalHeartbeatResponse, Error>;
    async fn job_heartbeat(
        &self,
        cell_tag: CellTag,
        request: JobHeartbeatRequest,
    ) -> Result<JobHeartbeatResponse, Error>;
}

fn is_retriable(err: &Error) -> bool {
    match error_kind(err) {
        Some(ErrorKind::IncarnationMismatch { .. }) => false,
        Some(kind) => kind.is_retriable(),
        // plain transport-ish failures are worth a retry
        None => true,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellState {
    Offline,
    Registered,
    Online,
}

/// Per-cell chunk delta accumulated between successful heartbeats.
struct ChunksDelta {
    state: CellState,
    added: HashMap<ChunkId, Arc<Chunk>>,
    removed: HashMap<ChunkId, Arc<Chunk>>,
    reported_added: HashMap<ChunkId, u64>,
    reported_removed: Vec<ChunkId>,
}

impl ChunksDelta {
    fn new() -> Self {
        Self {
            state: CellState::Offline,
            added: HashMap::new(),
            removed: HashMap::new(),
            reported_added: HashMap::new(),
            reported_removed: Vec::new(),
        }
    }

    fn clear(&mut self) {
        self.state = CellState::Offline;
        self.added.clear();
        self.removed.clear();
        self.reported_added.clear();
        self.reported_removed.clear();
    }
}

/// Shared, cheaply clonable view of the connector.
pub struct ConnectorShared {
    node_id: AtomicU32,
    connected: AtomicBool,
    static_alerts: Mutex<Vec<String>>,
}

const INVALID_NODE_ID: u32 = u32::MAX;

#[derive(Clone)]
pub struct ConnectorHandle(Arc<ConnectorShared>);

impl ConnectorHandle {
    pub fn is_connected(&self) -> bool {
        self.0.connected.load(Ordering::SeqCst)
    }

    pub fn node_id(&self) -> Option<u32> {
        match self.0.node_id.load(Ordering::SeqCst) {
            INVALID_NODE_ID => None,
            id => Some(id),
        }
    }

    /// Register a static alert; it rides along every incremental
    /// heartbeat from now on.
    pub fn register_alert<S: Into<String>>(&self, alert: S) {
        let alert = alert.into();
        log::warn!("static alert registered: {alert}");
        self.0.static_alerts.lock().unwrap().push(alert);
    }
}

pub struct MasterConnector {
    config: MasterConnectorConfig,
    client: Arc<dyn MasterClient>,
    store: Arc<ChunkStore>,
    session_manager: Arc<SessionManager>,
    job_controller: Arc<JobController>,
    memory_tracker: Arc<MemoryTracker>,
    local_descriptor: NodeDescriptor,
    cell_tags: Vec<CellTag>,
    primary_cell_tag: CellTag,

    shared: Arc<ConnectorShared>,
    deltas: HashMap<CellTag, ChunksDelta>,
    chunk_events: tokio::sync::broadcast::Receiver<ChunkEvent>,
    lease: Option<LeaseTransaction>,
    job_heartbeat_cell_index: usize,
    heartbeat_backoff: Duration,
}

impl MasterConnector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: MasterConnectorConfig,
        client: Arc<dyn MasterClient>,
        store: Arc<ChunkStore>,
        session_manager: Arc<SessionManager>,
        job_controller: Arc<JobController>,
        memory_tracker: Arc<MemoryTracker>,
        local_descriptor: NodeDescriptor,
        cell_tags: Vec<CellTag>,
    ) -> Self {
        assert!(!cell_tags.is_empty(), "at least the primary cell is required");
        let chunk_events = store.registry().subscribe();
        let deltas = cell_tags
            .iter()
            .map(|&cell_tag| (cell_tag, ChunksDelta::new()))
            .collect();
        let heartbeat_backoff = config.heartbeat_backoff_start;
        Self {
            config,
            client,
            store,
            session_manager,
            job_controller,
            memory_tracker,
            local_descriptor,
            primary_cell_tag: cell_tags[0],
            cell_tags,
            shared: Arc::new(ConnectorShared {
                node_id: AtomicU32::new(INVALID_NODE_ID),
                connected: AtomicBool::new(false),
                static_alerts: Mutex::new(Vec::new()),
            }),
            deltas,
            chunk_events,
            lease: None,
            job_heartbeat_cell_index: 0,
            heartbeat_backoff,
        }
    }

    pub fn handle(&self) -> ConnectorHandle {
        ConnectorHandle(Arc::clone(&self.shared))
    }

    /// The connector's main loop: register, then heartbeat until a
    /// non-retriable failure resets everything.
    pub async fn run(mut self) {
        loop {
            match self.register().await {
                Ok(()) => {
                    if let Err(err) = self.run_heartbeats().await {
                        log::warn!("heartbeat loop failed - {err:#}");
                    }
                }
                Err(err) => {
                    log::warn!("error registering node at primary master - {err:#}");
                }
            }
            self.reset();
            tokio::time::sleep(self.config.register_retry_period).await;
        }
    }

    pub fn compute_statistics(&self) -> NodeStatistics {
        let locations = self.store.location_statistics();
        let mut statistics = NodeStatistics {
            total_available_space: locations.iter().map(|l| l.available_space).sum(),
            total_used_space: locations.iter().map(|l| l.used_space).sum(),
            total_low_watermark_space: self
                .store
                .store_locations()
                .iter()
                .filter(|location| location.is_enabled())
                .map(|location| location.low_watermark_space())
                .sum(),
            total_stored_chunk_count: self
                .store
                .store_locations()
                .iter()
                .map(|location| location.chunk_count())
                .sum(),
            total_cached_chunk_count: self
                .store
                .cache_locations()
                .iter()
                .map(|location| location.chunk_count())
                .sum(),
            total_user_session_count: self.session_manager.session_count(SessionType::User) as u64,
            total_replication_session_count: self
                .session_manager
                .session_count(SessionType::Replication) as u64,
            total_repair_session_count: self.session_manager.session_count(SessionType::Repair)
                as u64,
            full: !locations.is_empty()
                && locations
                    .iter()
                    .filter(|location| location.enabled)
                    .all(|location| location.full),
            locations,
            memory_used: self.memory_tracker.total_used(),
            memory_limit: self.memory_tracker.total_limit(),
        };
        // a node without locations must not read as full
        if statistics.locations.is_empty() {
            statistics.full = false;
        }
        statistics
    }

    fn alerts(&self) -> Vec<String> {
        let mut alerts = self.store.location_alerts();
        alerts.extend(self.shared.static_alerts.lock().unwrap().iter().cloned());
        alerts
    }

    /// Acquire the lease and register at the primary cell.
    pub async fn register(&mut self) -> Result<(), Error> {
        let lease = self.client.start_lease_transaction().await?;
        log::info!("lease transaction started (lease: {})", lease.id);

        let request = RegisterNodeRequest {
            statistics: self.compute_statistics(),
            addresses: self.local_descriptor.clone(),
            lease_transaction_id: lease.id,
            tags: self.config.tags.clone(),
        };
        log::info!("node register request sent to primary master");

        let response = self.client.register_node(request).await?;

        self.lease = Some(lease);
        self.shared.node_id.store(response.node_id, Ordering::SeqCst);
        for delta in self.deltas.values_mut() {
            delta.state = CellState::Registered;
        }
        self.shared.connected.store(true, Ordering::SeqCst);

        log::info!(
            "successfully registered at primary master (node id: {})",
            response.node_id,
        );
        Ok(())
    }

    async fn run_heartbeats(&mut self) -> Result<(), Error> {
        let mut lease_ping = tokio::time::interval(self.config.lease_ping_period);
        lease_ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            if let Some(lease) = &self.lease {
                if *lease.aborted.borrow() {
                    return Err(format_err!("master transaction lease aborted"));
                }
            }

            // one round of node heartbeats plus one job heartbeat
            for cell_index in 0..self.cell_tags.len() {
                let cell_tag = self.cell_tags[cell_index];
                match self.report_node_heartbeat(cell_tag).await {
                    Ok(()) => {
                        self.heartbeat_backoff = self.config.heartbeat_backoff_start;
                    }
                    Err(err) if is_retriable(&err) => {
                        log::warn!(
                            "error reporting node heartbeat to master (cell: {cell_tag}) - {err:#}"
                        );
                        tokio::time::sleep(self.heartbeat_backoff).await;
                        self.bump_backoff();
                    }
                    Err(err) => return Err(err),
                }
            }

            match self.report_job_heartbeat().await {
                Ok(()) => {}
                Err(err) if is_retriable(&err) => {
                    log::warn!("error reporting job heartbeat to master - {err:#}");
                }
                Err(err) => return Err(err),
            }

            tokio::select! {
                _ = lease_ping.tick() => {
                    if let Some(lease) = &self.lease {
                        if let Err(err) = self.client.ping_lease(lease.id).await {
                            return Err(err.context("lease ping failed"));
                        }
                    }
                }
                _ = tokio::time::sleep(self.config.incremental_heartbeat_period) => {}
            }
        }
    }

    fn bump_backoff(&mut self) {
        let next = self
            .heartbeat_backoff
            .mul_f64(self.config.heartbeat_backoff_multiplier);
        self.heartbeat_backoff = next.min(self.config.heartbeat_backoff_max);
    }

    /// Drain pending chunk events into the per-cell deltas.
    pub fn process_chunk_events(&mut self) {
        loop {
            match self.chunk_events.try_recv() {
                Ok(event) => self.apply_chunk_event(event),
                Err(tokio::sync::broadcast::error::TryRecvError::Lagged(skipped)) => {
                    // deltas may have lost events; resync would need a
                    // full heartbeat, so just record the fact
                    log::warn!("chunk event stream lagged, {skipped} events dropped");
                }
                Err(_) => break,
            }
        }
    }

    fn apply_chunk_event(&mut self, event: ChunkEvent) {
        match event {
            ChunkEvent::Added(chunk) => {
                if chunk.id().is_artifact() {
                    return;
                }
                let Some(delta) = self.deltas.get_mut(&chunk.id().cell_tag()) else {
                    return;
                };
                if delta.state != CellState::Online {
                    return;
                }
                delta.removed.remove(&chunk.id());
                delta.added.insert(chunk.id(), chunk);
            }
            ChunkEvent::Removed(chunk) => {
                if chunk.id().is_artifact() {
                    return;
                }
                let Some(delta) = self.deltas.get_mut(&chunk.id().cell_tag()) else {
                    return;
                };
                if delta.state != CellState::Online {
                    return;
                }
                delta.added.remove(&chunk.id());
                delta.removed.insert(chunk.id(), chunk);
            }
        }
    }

    fn can_send_full_heartbeat(&self, cell_tag: CellTag) -> bool {
        if cell_tag != self.primary_cell_tag {
            return true;
        }
        self.deltas
            .iter()
            .filter(|(&tag, _)| tag != self.primary_cell_tag)
            .all(|(_, delta)| delta.state == CellState::Online)
    }

    /// One node heartbeat for the cell, full or incremental per its
    /// state.
    pub async fn report_node_heartbeat(&mut self, cell_tag: CellTag) -> Result<(), Error> {
        self.process_chunk_events();
        let state = self
            .deltas
            .get(&cell_tag)
            .map(|delta| delta.state)
            .ok_or_else(|| format_err!("unknown cell tag {cell_tag}"))?;

        match state {
            CellState::Registered => {
                if self.can_send_full_heartbeat(cell_tag) {
                    self.report_full_heartbeat(cell_tag).await
                } else {
                    Ok(())
                }
            }
            CellState::Online => self.report_incremental_heartbeat(cell_tag).await,
            CellState::Offline => Err(format_err!(
                "heartbeat attempted for offline cell {cell_tag}"
            )),
        }
    }

    async fn report_full_heartbeat(&mut self, cell_tag: CellTag) -> Result<(), Error> {
        let node_id = self
            .handle()
            .node_id()
            .ok_or_else(|| format_err!("not registered"))?;

        let chunks: Vec<_> = self
            .store
            .registry()
            .chunks()
            .into_iter()
            .filter(|chunk| {
                chunk.id().cell_tag() == cell_tag && !chunk.id().is_artifact()
            })
            .map(|chunk| build_add_info(&chunk))
            .collect();

        let request = FullHeartbeatRequest {
            node_id,
            statistics: self.compute_statistics(),
            chunks,
        };
        log::info!(
            "full node heartbeat sent to master (cell: {cell_tag}, chunks: {})",
            request.chunks.len(),
        );

        self.client.full_heartbeat(cell_tag, request).await?;

        let delta = self.deltas.get_mut(&cell_tag).unwrap();
        delta.state = CellState::Online;
        assert!(delta.added.is_empty());
        assert!(delta.removed.is_empty());

        log::info!("successfully reported full node heartbeat to master (cell: {cell_tag})");
        Ok(())
    }

    async fn report_incremental_heartbeat(&mut self, cell_tag: CellTag) -> Result<(), Error> {
        let node_id = self
            .handle()
            .node_id()
            .ok_or_else(|| format_err!("not registered"))?;
        let statistics = self.compute_statistics();
        let alerts = self.alerts();

        let delta = self.deltas.get_mut(&cell_tag).unwrap();
        delta.reported_added = delta
            .added
            .values()
            .map(|chunk| (chunk.id(), chunk.version()))
            .collect();
        delta.reported_removed = delta.removed.keys().copied().collect();

        let request = IncrementalHeartbeatRequest {
            node_id,
            statistics,
            added_chunks: delta.added.values().map(build_add_info).collect(),
            removed_chunks: delta.removed.values().map(build_remove_info).collect(),
            alerts,
        };
        log::debug!(
            "incremental node heartbeat sent to master (cell: {cell_tag}, added: {}, removed: {})",
            request.added_chunks.len(),
            request.removed_chunks.len(),
        );

        let response = self.client.incremental_heartbeat(cell_tag, request).await?;

        // prune reported entries whose version did not change meanwhile
        let delta = self.deltas.get_mut(&cell_tag).unwrap();
        let reported_added = std::mem::take(&mut delta.reported_added);
        for (chunk_id, version) in reported_added {
            if delta
                .added
                .get(&chunk_id)
                .map_or(false, |chunk| chunk.version() == version)
            {
                delta.added.remove(&chunk_id);
            }
        }
        let reported_removed = std::mem::take(&mut delta.reported_removed);
        for chunk_id in reported_removed {
            delta.removed.remove(&chunk_id);
        }

        if cell_tag == self.primary_cell_tag {
            self.job_controller
                .set_resource_limits_overrides(response.resource_limits_overrides);
            self.job_controller.set_disable_jobs(response.disable_jobs);
        }

        log::debug!("successfully reported incremental node heartbeat to master (cell: {cell_tag})");
        Ok(())
    }

    /// Job heartbeats rotate through the cells round-robin.
    pub async fn report_job_heartbeat(&mut self) -> Result<(), Error> {
        let cell_tag = self.cell_tags[self.job_heartbeat_cell_index];
        self.job_heartbeat_cell_index =
            (self.job_heartbeat_cell_index + 1) % self.cell_tags.len();

        let online = self
            .deltas
            .get(&cell_tag)
            .map_or(false, |delta| delta.state == CellState::Online);
        if !online {
            return Ok(());
        }

        let node_id = self
            .handle()
            .node_id()
            .ok_or_else(|| format_err!("not registered"))?;
        let mut request = self.job_controller.prepare_heartbeat(cell_tag);
        request.node_id = node_id;

        log::debug!("job heartbeat sent to master (cell: {cell_tag})");
        let response = self.client.job_heartbeat(cell_tag, request).await?;
        self.job_controller.process_heartbeat_response(response);

        log::debug!("successfully reported job heartbeat to master (cell: {cell_tag})");
        Ok(())
    }

    /// Back to square one: clear state and mark the node disconnected.
    pub fn reset(&mut self) {
        self.shared.node_id.store(INVALID_NODE_ID, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);
        self.lease = None;
        self.job_heartbeat_cell_index = 0;
        self.heartbeat_backoff = self.config.heartbeat_backoff_start;
        for delta in self.deltas.values_mut() {
            delta.clear();
        }
        log::info!("master disconnected");
    }

    /// The delta sizes for a cell, used by tests and introspection.
    pub fn delta_sizes(&self, cell_tag: CellTag) -> Option<(usize, usize)> {
        self.deltas
            .get(&cell_tag)
            .map(|delta| (delta.added.len(), delta.removed.len()))
    }
}
