//! End-to-end scenarios driving the assembled data node: write sessions
//! through the service surface, throttled reads, and the master
//! connector's heartbeat deltas against a scripted master.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Error};
use async_trait::async_trait;
use bytes::Bytes;

use chunk_datanode::jobs::{ErasureRepairClient, ReplicationJobClient};
use chunk_datanode::master::{LeaseTransaction, MasterClient, MasterConnector};
use chunk_datanode::service::{
    ChunkDownloader, FinishChunkRequest, GetBlockRangeRequest, GetBlockSetRequest,
    PutBlocksRequest, StartChunkRequest,
};
use chunk_datanode::{DataNode, NodeEnvironment};
use dn_api_types::{
    error_kind, CellId, CellTag, ChunkId, ChunkMeta, DataNodeConfig, ErrorKind,
    FullHeartbeatRequest, IncrementalHeartbeatRequest, IncrementalHeartbeatResponse,
    JobHeartbeatRequest, JobHeartbeatResponse, NodeDescriptor, ObjectType,
    RegisterNodeRequest, RegisterNodeResponse, SessionType, StoreLocationConfig,
    WorkloadCategory,
};
use dn_datastore::location::{AbortHook, Location};
use dn_datastore::session::ReplicationClient;

const PRIMARY_CELL: CellTag = 1;

struct FakeMaster {
    lease_counter: AtomicU64,
    fulls: Mutex<Vec<(CellTag, FullHeartbeatRequest)>>,
    incrementals: Mutex<Vec<(CellTag, IncrementalHeartbeatRequest)>>,
    job_heartbeats: Mutex<Vec<JobHeartbeatRequest>>,
}

impl FakeMaster {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            lease_counter: AtomicU64::new(1),
            fulls: Mutex::new(Vec::new()),
            incrementals: Mutex::new(Vec::new()),
            job_heartbeats: Mutex::new(Vec::new()),
        })
    }

    fn last_incremental(&self, cell_tag: CellTag) -> Option<IncrementalHeartbeatRequest> {
        self.incrementals
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(tag, _)| *tag == cell_tag)
            .map(|(_, request)| request.clone())
    }
}

#[async_trait]
impl MasterClient for FakeMaster {
    async fn start_lease_transaction(&self) -> Result<LeaseTransaction, Error> {
        let (_tx, rx) = tokio::sync::watch::channel(false);
        Ok(LeaseTransaction {
            id: self.lease_counter.fetch_add(1, Ordering::SeqCst),
            aborted: rx,
        })
    }

    async fn ping_lease(&self, _lease_id: u64) -> Result<(), Error> {
        Ok(())
    }

    async fn register_node(
        &self,
        _request: RegisterNodeRequest,
    ) -> Result<RegisterNodeResponse, Error> {
        Ok(RegisterNodeResponse {
            node_id: 42,
            cell_tags: vec![PRIMARY_CELL],
        })
    }

    async fn full_heartbeat(
        &self,
        cell_tag: CellTag,
        request: FullHeartbeatRequest,
    ) -> Result<(), Error> {
        self.fulls.lock().unwrap().push((cell_tag, request));
        Ok(())
    }

    async fn incremental_heartbeat(
        &self,
        cell_tag: CellTag,
        request: IncrementalHeartbeatRequest,
    ) -> Result<IncrementalHeartbeatResponse, Error> {
        self.incrementals.lock().unwrap().push((cell_tag, request));
        Ok(IncrementalHeartbeatResponse::default())
    }

    async fn job_heartbeat(
        &self,
        _cell_tag: CellTag,
        request: JobHeartbeatRequest,
    ) -> Result<JobHeartbeatResponse, Error> {
        self.job_heartbeats.lock().unwrap().push(request);
        Ok(JobHeartbeatResponse::default())
    }
}

struct NullReplication;

#[async_trait]
impl ReplicationClient for NullReplication {
    async fn put_blocks(
        &self,
        _target: &NodeDescriptor,
        _chunk_id: ChunkId,
        _first_block_index: u32,
        _blocks: Vec<Bytes>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl ReplicationJobClient for NullReplication {
    async fn replicate_chunk(
        &self,
        _chunk_id: ChunkId,
        _target: &NodeDescriptor,
        _blocks: Vec<Bytes>,
        _meta: ChunkMeta,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl ErasureRepairClient for NullReplication {
    async fn repair_parts(
        &self,
        _chunk_id: ChunkId,
        _erasure_codec: u32,
        _missing_part_indexes: Vec<u32>,
        _sources: Vec<NodeDescriptor>,
    ) -> Result<(), Error> {
        Ok(())
    }
}

#[async_trait]
impl ChunkDownloader for NullReplication {
    async fn download(&self, _chunk_id: ChunkId, _location: Arc<Location>) -> Result<(), Error> {
        bail!("downloads are not wired in this test")
    }
}

fn abort_hook() -> AbortHook {
    Arc::new(|err: &anyhow::Error| panic!("location disabled in test: {err:#}"))
}

struct Harness {
    node: DataNode,
    connector: MasterConnector,
    master: Arc<FakeMaster>,
    dir: std::path::PathBuf,
}

async fn make_harness(tag: &str, configure: impl FnOnce(&mut DataNodeConfig)) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();

    let dir = std::env::temp_dir().join(format!("dn-node-test-{tag}-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();

    let mut location = StoreLocationConfig::new(&dir);
    location.health_check.use_direct_io = false;
    location.health_check.test_size = 4096;
    location.low_watermark = 0;
    location.high_watermark = 0;
    location.trash_cleanup_watermark = 0;

    let mut config = DataNodeConfig::default();
    config.store_locations = vec![location];
    configure(&mut config);

    let master = FakeMaster::new();
    let null = Arc::new(NullReplication);

    let env = NodeEnvironment {
        master_client: master.clone(),
        replication_client: null.clone(),
        replication_job_client: null.clone(),
        erasure_repair_client: null.clone(),
        chunk_downloader: null,
        mapped_memory_collector: Arc::new(NoMappedMemory),
        location_abort_hook: abort_hook(),
    };

    let mut node = DataNode::new(
        config,
        CellId(0x77),
        vec![PRIMARY_CELL],
        NodeDescriptor::new("localhost:10000"),
        1 << 30,
        env,
    );
    // drive the connector by hand instead of spawning its loop
    let connector = node.take_connector().unwrap();
    node.start().await.unwrap();

    Harness {
        node,
        connector,
        master,
        dir,
    }
}

struct NoMappedMemory;

impl chunk_datanode::jobs::MappedMemoryCollector for NoMappedMemory {
    fn mapped_bytes(&self) -> Result<u64, Error> {
        Ok(0)
    }
}

async fn connect(harness: &mut Harness) {
    harness.connector.register().await.unwrap();
    harness
        .connector
        .report_node_heartbeat(PRIMARY_CELL)
        .await
        .unwrap();
    assert!(harness.node.connector_handle().is_connected());
}

async fn write_chunk(harness: &Harness, chunk_id: ChunkId, blocks: Vec<Bytes>) {
    let service = harness.node.service();
    service
        .start_chunk(StartChunkRequest {
            chunk_id,
            session_type: SessionType::User,
            sync_on_close: true,
        })
        .await
        .unwrap();
    let block_count = blocks.len() as u32;
    service
        .put_blocks(PutBlocksRequest {
            chunk_id,
            first_block_index: 0,
            blocks,
            enable_caching: false,
            flush_blocks: true,
        })
        .await
        .unwrap();
    service
        .finish_chunk(FinishChunkRequest {
            chunk_id,
            meta: ChunkMeta::default(),
            block_count: Some(block_count),
        })
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_service_requires_connected_master() {
    let mut harness = make_harness("connected", |_| {}).await;

    let chunk_id = ChunkId::new(ObjectType::Blob, PRIMARY_CELL, 0x1001);
    let err = harness
        .node
        .service()
        .start_chunk(StartChunkRequest {
            chunk_id,
            session_type: SessionType::User,
            sync_on_close: false,
        })
        .await
        .unwrap_err();
    assert!(matches!(
        error_kind(&err),
        Some(ErrorKind::Unavailable(_))
    ));

    connect(&mut harness).await;
    write_chunk(&harness, chunk_id, vec![Bytes::from_static(b"hello")]).await;
    assert!(harness.node.store().find_chunk(chunk_id).is_some());

    std::fs::remove_dir_all(&harness.dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_block_set_read_and_peer_update() {
    let mut harness = make_harness("blockset", |_| {}).await;
    connect(&mut harness).await;

    let chunk_id = ChunkId::new(ObjectType::Blob, PRIMARY_CELL, 0x1002);
    write_chunk(
        &harness,
        chunk_id,
        vec![
            Bytes::from_static(b"zero"),
            Bytes::from_static(b"one"),
            Bytes::from_static(b"two"),
        ],
    )
    .await;

    let service = harness.node.service();
    let response = service
        .get_block_set(GetBlockSetRequest {
            chunk_id,
            block_indexes: vec![2, 0],
            enable_caching: true,
            workload: WorkloadCategory::Realtime,
            priority: 0,
            peer_descriptor: Some(NodeDescriptor::new("peer-a:10001")),
            peer_expiration: Some(std::time::SystemTime::now() + Duration::from_secs(600)),
        })
        .await
        .unwrap();

    assert!(response.has_complete_chunk);
    assert!(!response.throttling);
    assert_eq!(response.blocks.len(), 2);
    assert_eq!(response.blocks[0].as_ref().unwrap().as_ref(), b"two");
    assert_eq!(response.blocks[1].as_ref().unwrap().as_ref(), b"zero");

    // the requester was recorded as a peer for both blocks
    let peers = harness
        .node
        .peer_table()
        .get_peers(dn_api_types::BlockId::new(chunk_id, 2));
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].address, "peer-a:10001");

    // a block of an unknown chunk reads back as absent
    let absent = ChunkId::new(ObjectType::Blob, PRIMARY_CELL, 0xfff);
    let response = service
        .get_block_set(GetBlockSetRequest {
            chunk_id: absent,
            block_indexes: vec![0],
            enable_caching: false,
            workload: WorkloadCategory::Batch,
            priority: 0,
            peer_descriptor: None,
            peer_expiration: None,
        })
        .await
        .unwrap();
    assert!(!response.has_complete_chunk);
    assert!(response.blocks[0].is_none());

    std::fs::remove_dir_all(&harness.dir).unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_throttled_block_range_read() {
    const MIB: usize = 1024 * 1024;

    // setup runs against the real clock; only the throttled read below
    // is measured in virtual time
    tokio::time::resume();

    let mut harness = make_harness("throttle", |config| {
        // 1 MiB/s egress
        config.out_throttler_rate = Some(MIB as u64);
        // push the timer-driven background checks far away so the paused
        // clock cannot run into them while the disk read is in flight
        let health = &mut config.store_locations[0].health_check;
        health.check_period = Duration::from_secs(86400 * 30);
        health.timeout = Duration::from_secs(86400 * 30);
        config.store_locations[0].trash_check_period = Duration::from_secs(86400 * 30);
        config.session_timeout = Duration::from_secs(86400);
    })
    .await;
    connect(&mut harness).await;

    let chunk_id = ChunkId::new(ObjectType::Blob, PRIMARY_CELL, 0x1003);
    write_chunk(&harness, chunk_id, vec![Bytes::from(vec![0xabu8; 10 * MIB])]).await;

    tokio::time::pause();
    let started = tokio::time::Instant::now();
    let response = harness
        .node
        .service()
        .get_block_range(GetBlockRangeRequest {
            chunk_id,
            first_block_index: 0,
            block_count: 1,
            workload: WorkloadCategory::Batch,
            priority: 0,
        })
        .await
        .unwrap();
    let elapsed = started.elapsed();

    // bus-pending-out was below the threshold when the handler started
    assert!(!response.throttling);
    assert_eq!(response.blocks.len(), 1);
    assert_eq!(response.blocks[0].len(), 10 * MIB);
    // pushing 10 MiB through a 1 MiB/s throttler takes ten (virtual)
    // seconds, minus the initial one-second bucket
    assert!(
        elapsed >= Duration::from_secs(8),
        "read returned too fast: {elapsed:?}",
    );

    std::fs::remove_dir_all(&harness.dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_out_throttling_suggests_peers() {
    let mut harness = make_harness("suggest", |config| {
        config.bus_out_throttling_limit = 1024;
    })
    .await;
    connect(&mut harness).await;

    let chunk_id = ChunkId::new(ObjectType::Blob, PRIMARY_CELL, 0x1004);
    write_chunk(&harness, chunk_id, vec![Bytes::from_static(b"data")]).await;

    // another node advertised itself for this block earlier
    harness.node.peer_table().update_peer(
        dn_api_types::BlockId::new(chunk_id, 0),
        NodeDescriptor::new("peer-b:10001"),
        std::time::SystemTime::now() + Duration::from_secs(600),
    );

    // transport reports a congested outgoing bus
    harness.node.service().set_bus_pending_out(1 << 20);

    let response = harness
        .node
        .service()
        .get_block_set(GetBlockSetRequest {
            chunk_id,
            block_indexes: vec![0],
            enable_caching: true,
            workload: WorkloadCategory::Realtime,
            priority: 0,
            peer_descriptor: None,
            peer_expiration: None,
        })
        .await
        .unwrap();

    assert!(response.throttling);
    assert!(response.blocks.iter().all(Option::is_none));
    assert_eq!(response.peer_suggestions.len(), 1);
    assert_eq!(response.peer_suggestions[0].peers[0].address, "peer-b:10001");

    std::fs::remove_dir_all(&harness.dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_incremental_heartbeat_delta_convergence() {
    let mut harness = make_harness("delta", |_| {}).await;
    connect(&mut harness).await;

    // the full heartbeat was sent on connect and the cell is online
    assert_eq!(harness.master.fulls.lock().unwrap().len(), 1);

    // adding a chunk surfaces in exactly one incremental heartbeat
    let chunk_id = ChunkId::new(ObjectType::Blob, PRIMARY_CELL, 0x1005);
    write_chunk(&harness, chunk_id, vec![Bytes::from_static(b"delta")]).await;

    harness
        .connector
        .report_node_heartbeat(PRIMARY_CELL)
        .await
        .unwrap();
    let report = harness.master.last_incremental(PRIMARY_CELL).unwrap();
    assert_eq!(report.added_chunks.len(), 1);
    assert_eq!(report.added_chunks[0].chunk_id, chunk_id);
    assert!(report.removed_chunks.is_empty());

    // no changes: the next heartbeat's delta is empty
    harness
        .connector
        .report_node_heartbeat(PRIMARY_CELL)
        .await
        .unwrap();
    let report = harness.master.last_incremental(PRIMARY_CELL).unwrap();
    assert!(report.added_chunks.is_empty());
    assert!(report.removed_chunks.is_empty());
    assert_eq!(harness.connector.delta_sizes(PRIMARY_CELL), Some((0, 0)));

    // removal surfaces once, then the delta is empty again
    let chunk = harness.node.store().get_chunk(chunk_id).unwrap();
    harness.node.store().remove_chunk(chunk).await.unwrap();

    harness
        .connector
        .report_node_heartbeat(PRIMARY_CELL)
        .await
        .unwrap();
    let report = harness.master.last_incremental(PRIMARY_CELL).unwrap();
    assert!(report.added_chunks.is_empty());
    assert_eq!(report.removed_chunks.len(), 1);
    assert_eq!(report.removed_chunks[0].chunk_id, chunk_id);

    harness
        .connector
        .report_node_heartbeat(PRIMARY_CELL)
        .await
        .unwrap();
    let report = harness.master.last_incremental(PRIMARY_CELL).unwrap();
    assert!(report.removed_chunks.is_empty());

    std::fs::remove_dir_all(&harness.dir).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connector_reset_disconnects() {
    let mut harness = make_harness("reset", |_| {}).await;
    connect(&mut harness).await;
    assert!(harness.node.connector_handle().is_connected());
    assert_eq!(harness.node.connector_handle().node_id(), Some(42));

    harness.connector.reset();
    assert!(!harness.node.connector_handle().is_connected());
    assert!(harness.node.connector_handle().node_id().is_none());

    // re-registration works after a reset
    connect(&mut harness).await;

    std::fs::remove_dir_all(&harness.dir).unwrap();
}
