use serde::{Deserialize, Serialize};

use crate::{ChunkId, JobId, NodeDescriptor};

/// Kind of maintenance job the master may schedule on a data node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    ReplicateChunk,
    RepairChunk,
    RemoveChunk,
    SealChunk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Running,
    Completed,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Aborted
        )
    }
}

/// Coarse progress marker reported in job heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobPhase {
    Created,
    Running,
    Cleanup,
    Finished,
}

/// Resource vector governing job admission.
///
/// `replication_data_size` and `repair_data_size` allow unlimited overdraft
/// so that at least one job of each kind can always start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobResources {
    #[serde(default)]
    pub replication_slots: u32,
    #[serde(default)]
    pub repair_slots: u32,
    #[serde(default)]
    pub removal_slots: u32,
    #[serde(default)]
    pub seal_slots: u32,
    #[serde(default)]
    pub replication_data_size: u64,
    #[serde(default)]
    pub repair_data_size: u64,
    #[serde(default)]
    pub memory: u64,
    #[serde(default)]
    pub cpu: f64,
}

impl JobResources {
    pub fn add(&self, other: &JobResources) -> JobResources {
        JobResources {
            replication_slots: self.replication_slots + other.replication_slots,
            repair_slots: self.repair_slots + other.repair_slots,
            removal_slots: self.removal_slots + other.removal_slots,
            seal_slots: self.seal_slots + other.seal_slots,
            replication_data_size: self.replication_data_size + other.replication_data_size,
            repair_data_size: self.repair_data_size + other.repair_data_size,
            memory: self.memory + other.memory,
            cpu: self.cpu + other.cpu,
        }
    }

    /// Componentwise `self ≥ other`.
    pub fn dominates(&self, other: &JobResources) -> bool {
        self.replication_slots >= other.replication_slots
            && self.repair_slots >= other.repair_slots
            && self.removal_slots >= other.removal_slots
            && self.seal_slots >= other.seal_slots
            && self.replication_data_size >= other.replication_data_size
            && self.repair_data_size >= other.repair_data_size
            && self.memory >= other.memory
            && self.cpu >= other.cpu
    }

    /// Componentwise saturating `self − other`.
    pub fn saturating_sub(&self, other: &JobResources) -> JobResources {
        JobResources {
            replication_slots: self.replication_slots.saturating_sub(other.replication_slots),
            repair_slots: self.repair_slots.saturating_sub(other.repair_slots),
            removal_slots: self.removal_slots.saturating_sub(other.removal_slots),
            seal_slots: self.seal_slots.saturating_sub(other.seal_slots),
            replication_data_size: self
                .replication_data_size
                .saturating_sub(other.replication_data_size),
            repair_data_size: self.repair_data_size.saturating_sub(other.repair_data_size),
            memory: self.memory.saturating_sub(other.memory),
            cpu: (self.cpu - other.cpu).max(0.0),
        }
    }
}

/// What a job actually has to do, shipped inline in the heartbeat response
/// or fetched from a controller agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "type")]
pub enum JobSpec {
    ReplicateChunk {
        chunk_id: ChunkId,
        targets: Vec<NodeDescriptor>,
    },
    RepairChunk {
        chunk_id: ChunkId,
        erasure_codec: u32,
        missing_part_indexes: Vec<u32>,
        sources: Vec<NodeDescriptor>,
    },
    RemoveChunk {
        chunk_id: ChunkId,
    },
    SealChunk {
        chunk_id: ChunkId,
        row_count: u64,
    },
}

impl JobSpec {
    pub fn job_type(&self) -> JobType {
        match self {
            JobSpec::ReplicateChunk { .. } => JobType::ReplicateChunk,
            JobSpec::RepairChunk { .. } => JobType::RepairChunk,
            JobSpec::RemoveChunk { .. } => JobType::RemoveChunk,
            JobSpec::SealChunk { .. } => JobType::SealChunk,
        }
    }
}

/// Terminal outcome of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobResult {
    pub error: Option<String>,
}

impl JobResult {
    pub fn success() -> Self {
        Self { error: None }
    }

    pub fn failure<E: std::fmt::Display>(err: E) -> Self {
        Self {
            error: Some(err.to_string()),
        }
    }
}

/// One job's slice of a job heartbeat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobStatus {
    pub job_id: JobId,
    pub job_type: JobType,
    pub state: JobState,
    pub phase: JobPhase,
    pub progress: f64,
    /// Present while the job is running.
    #[serde(default)]
    pub resource_usage: Option<JobResources>,
    /// Present once the job is terminal.
    #[serde(default)]
    pub result: Option<JobResult>,
    /// Serialized job statistics, sent under a throttler budget.
    #[serde(default)]
    pub statistics: Option<String>,
}

/// Instruction to start a job, carried in a job heartbeat response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct JobStartInfo {
    pub job_id: JobId,
    pub resources: JobResources,
    /// Inline spec, or absent when the spec must be fetched from the
    /// controller agent named in `spec_service_address`.
    #[serde(default)]
    pub spec: Option<JobSpec>,
    #[serde(default)]
    pub spec_service_address: Option<String>,
    /// Number of distinct TCP ports the job needs reserved.
    #[serde(default)]
    pub port_count: u16,
}
