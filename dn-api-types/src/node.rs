use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use crate::{CellTag, ChunkId, JobId, JobStartInfo, JobStatus, JobResources};

/// Network identity of a node, as exchanged between peers and with the
/// master.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeDescriptor {
    pub address: String,
    #[serde(default)]
    pub rack: Option<String>,
}

impl NodeDescriptor {
    pub fn new<S: Into<String>>(address: S) -> Self {
        Self {
            address: address.into(),
            rack: None,
        }
    }
}

impl std::fmt::Display for NodeDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.address)
    }
}

/// Workload category a request declares; maps onto an I/O category for
/// pending-I/O accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkloadCategory {
    Idle,
    Batch,
    Realtime,
    Replication,
    Repair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoDirection {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IoCategory {
    Realtime,
    Batch,
    Repair,
}

impl WorkloadCategory {
    /// Fixed mapping of workloads onto I/O accounting categories.
    pub fn io_category(self) -> IoCategory {
        match self {
            WorkloadCategory::Repair => IoCategory::Repair,
            WorkloadCategory::Realtime => IoCategory::Realtime,
            WorkloadCategory::Idle
            | WorkloadCategory::Batch
            | WorkloadCategory::Replication => IoCategory::Batch,
        }
    }
}

/// Type of a write session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionType {
    User,
    Replication,
    Repair,
}

impl SessionType {
    pub fn workload(self) -> WorkloadCategory {
        match self {
            SessionType::User => WorkloadCategory::Realtime,
            SessionType::Replication => WorkloadCategory::Replication,
            SessionType::Repair => WorkloadCategory::Repair,
        }
    }
}

/// Per-location statistics reported to the master.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocationStatistics {
    pub available_space: u64,
    pub used_space: u64,
    pub chunk_count: u64,
    pub session_count: u64,
    pub full: bool,
    pub enabled: bool,
}

/// Node statistics included in registration and heartbeats.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct NodeStatistics {
    pub total_available_space: u64,
    pub total_used_space: u64,
    pub total_low_watermark_space: u64,
    pub total_stored_chunk_count: u64,
    pub total_cached_chunk_count: u64,
    pub total_user_session_count: u64,
    pub total_replication_session_count: u64,
    pub total_repair_session_count: u64,
    pub full: bool,
    #[serde(default)]
    pub locations: Vec<LocationStatistics>,
    #[serde(default)]
    pub memory_used: u64,
    #[serde(default)]
    pub memory_limit: u64,
}

/// One chunk's slice of a (full or incremental) heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkAddInfo {
    pub chunk_id: ChunkId,
    pub cached: bool,
    pub active: bool,
    pub sealed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChunkRemoveInfo {
    pub chunk_id: ChunkId,
    pub cached: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegisterNodeRequest {
    pub statistics: NodeStatistics,
    pub addresses: NodeDescriptor,
    pub lease_transaction_id: u64,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RegisterNodeResponse {
    pub node_id: u32,
    pub cell_tags: Vec<CellTag>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct FullHeartbeatRequest {
    pub node_id: u32,
    pub statistics: NodeStatistics,
    pub chunks: Vec<ChunkAddInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IncrementalHeartbeatRequest {
    pub node_id: u32,
    pub statistics: NodeStatistics,
    pub added_chunks: Vec<ChunkAddInfo>,
    pub removed_chunks: Vec<ChunkRemoveInfo>,
    pub alerts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IncrementalHeartbeatResponse {
    #[serde(default)]
    pub rack: Option<String>,
    #[serde(default)]
    pub resource_limits_overrides: Option<JobResources>,
    #[serde(default)]
    pub disable_jobs: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobHeartbeatRequest {
    pub node_id: u32,
    pub cell_tag: CellTag,
    pub resource_limits: JobResources,
    pub resource_usage: JobResources,
    pub jobs: Vec<JobStatus>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobHeartbeatResponse {
    #[serde(default)]
    pub jobs_to_start: Vec<JobStartInfo>,
    #[serde(default)]
    pub jobs_to_remove: Vec<JobId>,
    #[serde(default)]
    pub jobs_to_abort: Vec<JobId>,
    #[serde(default)]
    pub jobs_to_interrupt: Vec<JobId>,
    #[serde(default)]
    pub jobs_to_fail: Vec<JobId>,
    #[serde(default)]
    pub jobs_to_store: Vec<JobId>,
}

/// Advisory peer hint with a wall-clock expiration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PeerInfo {
    pub descriptor: NodeDescriptor,
    pub expiration: SystemTime,
}
