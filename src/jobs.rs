//! Job controller: admission, execution and heartbeat plumbing for the
//! maintenance jobs the master schedules on this node.
//!
//! Admission is governed by the node resource limits; replication and
//! repair data sizes allow unbounded overdraft so at least one job of
//! each kind can always start. Memory comes from the typed tracker and
//! jobs that declare ports get distinct TCP ports reserved. A watchdog
//! aborts the newest jobs when usage stays above the limits for too
//! long.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;
use bytes::Bytes;

use dn_api_types::{
    error_kind, CellTag, ChunkId, ChunkMeta, ErrorKind, JobControllerConfig, JobHeartbeatRequest,
    JobHeartbeatResponse, JobId, JobPhase, JobResources, JobResult, JobSpec, JobStartInfo,
    JobState, JobStatus, JobType, NodeDescriptor, WorkloadCategory,
};
use dn_datastore::block_store::BlockStore;
use dn_datastore::chunk_store::ChunkStore;
use dn_tools::memory_tracker::{MemoryCategory, MemoryTracker};
use dn_tools::periodic::PeriodicTask;
use dn_tools::throttler::ThroughputThrottler;

/// Pushes a full replica of a chunk to a target node.
#[async_trait]
pub trait ReplicationJobClient: Send + Sync {
    async fn replicate_chunk(
        &self,
        chunk_id: ChunkId,
        target: &NodeDescriptor,
        blocks: Vec<Bytes>,
        meta: ChunkMeta,
    ) -> Result<(), Error>;
}

/// External erasure repair machinery; the codec library itself lives
/// outside this crate.
#[async_trait]
pub trait ErasureRepairClient: Send + Sync {
    async fn repair_parts(
        &self,
        chunk_id: ChunkId,
        erasure_codec: u32,
        missing_part_indexes: Vec<u32>,
        sources: Vec<NodeDescriptor>,
    ) -> Result<(), Error>;
}

/// Probe of the node's mapped memory; production reads `/proc/vmstat`.
pub trait MappedMemoryCollector: Send + Sync {
    fn mapped_bytes(&self) -> Result<u64, Error>;
}

pub struct ProcVmstatCollector;

impl MappedMemoryCollector for ProcVmstatCollector {
    fn mapped_bytes(&self) -> Result<u64, Error> {
        let contents = std::fs::read_to_string("/proc/vmstat")?;
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("nr_mapped ") {
                let pages: u64 = rest.trim().parse()?;
                return Ok(pages * 4096);
            }
        }
        bail!("nr_mapped not present in /proc/vmstat");
    }
}

/// Everything a job body may touch.
pub struct JobEnvironment {
    pub store: Arc<ChunkStore>,
    pub block_store: Arc<BlockStore>,
    pub replication: Arc<dyn ReplicationJobClient>,
    pub repair: Arc<dyn ErasureRepairClient>,
}

struct JobRuntime {
    state: JobState,
    phase: JobPhase,
    progress: f64,
    result: Option<JobResult>,
    started_at: Option<Instant>,
    ports: Vec<u16>,
    memory_acquired: u64,
    statistics_pending: bool,
}

pub struct Job {
    id: JobId,
    spec: JobSpec,
    resources: JobResources,
    port_count: u16,
    created_at: Instant,
    runtime: Mutex<JobRuntime>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Job {
    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn job_type(&self) -> JobType {
        self.spec.job_type()
    }

    pub fn state(&self) -> JobState {
        self.runtime.lock().unwrap().state
    }

    pub fn resources(&self) -> JobResources {
        self.resources
    }

    fn set_progress(&self, phase: JobPhase, progress: f64) {
        let mut runtime = self.runtime.lock().unwrap();
        runtime.phase = phase;
        runtime.progress = progress;
    }

    fn status(&self) -> JobStatus {
        let runtime = self.runtime.lock().unwrap();
        JobStatus {
            job_id: self.id,
            job_type: self.spec.job_type(),
            state: runtime.state,
            phase: runtime.phase,
            progress: runtime.progress,
            resource_usage: (runtime.state == JobState::Running).then_some(self.resources),
            result: runtime.state.is_terminal().then(|| {
                runtime
                    .result
                    .clone()
                    .unwrap_or_else(JobResult::success)
            }),
            statistics: None,
        }
    }
}

pub struct JobController {
    config: JobControllerConfig,
    env: JobEnvironment,
    memory_tracker: Arc<MemoryTracker>,
    mapped_memory: Arc<dyn MappedMemoryCollector>,
    statistics_throttler: ThroughputThrottler,

    jobs: Mutex<HashMap<JobId, Arc<Job>>>,
    used_ports: Mutex<HashSet<u16>>,
    resource_limits_overrides: Mutex<Option<JobResources>>,
    disable_jobs: AtomicBool,
    overdraft_since: Mutex<Option<Instant>>,

    background: Mutex<Option<PeriodicTask>>,
}

impl JobController {
    pub fn new(
        config: JobControllerConfig,
        env: JobEnvironment,
        memory_tracker: Arc<MemoryTracker>,
        mapped_memory: Arc<dyn MappedMemoryCollector>,
    ) -> Arc<Self> {
        let statistics_throttler = ThroughputThrottler::new(config.statistics_throttler_rate);
        Arc::new(Self {
            config,
            env,
            memory_tracker,
            mapped_memory,
            statistics_throttler,
            jobs: Mutex::new(HashMap::new()),
            used_ports: Mutex::new(HashSet::new()),
            resource_limits_overrides: Mutex::new(None),
            disable_jobs: AtomicBool::new(false),
            overdraft_since: Mutex::new(None),
            background: Mutex::new(None),
        })
    }

    /// Kick off the scheduling/watchdog tick.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let task = PeriodicTask::spawn("job-scheduler", Duration::from_secs(1), move || {
            let this = Arc::clone(&this);
            async move {
                this.start_waiting_jobs();
                this.check_waiting_timeouts();
                this.check_overdraft();
            }
        });
        *self.background.lock().unwrap() = Some(task);
    }

    pub fn set_resource_limits_overrides(&self, overrides: Option<JobResources>) {
        *self.resource_limits_overrides.lock().unwrap() = overrides;
    }

    pub fn set_disable_jobs(&self, value: bool) {
        self.disable_jobs.store(value, Ordering::SeqCst);
    }

    pub fn find_job(&self, job_id: JobId) -> Option<Arc<Job>> {
        self.jobs.lock().unwrap().get(&job_id).cloned()
    }

    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs.lock().unwrap().values().cloned().collect()
    }

    pub fn resource_limits(&self) -> JobResources {
        let mut limits = self
            .resource_limits_overrides
            .lock()
            .unwrap()
            .unwrap_or(self.config.resource_limits);
        // memory is additionally bounded by what is actually free
        limits.memory = limits.memory.min(
            self.memory_tracker.used(MemoryCategory::Jobs) + self.memory_tracker.total_free(),
        );
        limits
    }

    pub fn resource_usage(&self, include_waiting: bool) -> JobResources {
        let jobs = self.jobs.lock().unwrap();
        let mut usage = JobResources::default();
        for job in jobs.values() {
            let state = job.state();
            if state == JobState::Running || (include_waiting && state == JobState::Waiting) {
                usage = usage.add(&job.resources);
            }
        }
        usage
    }

    /// Whether `job_resources` fit into the spare resources. Replication
    /// and repair data sizes always fit.
    fn has_enough_resources(&self, job_resources: &JobResources, used: &JobResources) -> bool {
        let mut spare = self.resource_limits().saturating_sub(used);
        spare.replication_data_size = u64::MAX;
        spare.repair_data_size = u64::MAX;
        spare.dominates(job_resources)
    }

    pub fn create_job(self: &Arc<Self>, info: JobStartInfo, spec: JobSpec) -> Result<Arc<Job>, Error> {
        if self.disable_jobs.load(Ordering::SeqCst) {
            bail!("jobs are disabled on this node");
        }

        let job = Arc::new(Job {
            id: info.job_id,
            spec,
            resources: info.resources,
            port_count: info.port_count,
            created_at: Instant::now(),
            runtime: Mutex::new(JobRuntime {
                state: JobState::Waiting,
                phase: JobPhase::Created,
                progress: 0.0,
                result: None,
                started_at: None,
                ports: Vec::new(),
                memory_acquired: 0,
                statistics_pending: false,
            }),
            task: Mutex::new(None),
        });

        {
            let mut jobs = self.jobs.lock().unwrap();
            if jobs.contains_key(&job.id) {
                bail!("job {} already exists", job.id);
            }
            jobs.insert(job.id, Arc::clone(&job));
        }

        log::info!(
            "job created (job: {}, type: {:?})",
            job.id,
            job.spec.job_type(),
        );
        self.start_waiting_jobs();
        Ok(job)
    }

    /// One admission pass over the waiting jobs, oldest first.
    pub fn start_waiting_jobs(self: &Arc<Self>) {
        let mut waiting: Vec<Arc<Job>> = self
            .jobs()
            .into_iter()
            .filter(|job| job.state() == JobState::Waiting)
            .collect();
        waiting.sort_by_key(|job| job.created_at);

        for job in waiting {
            let used = self.resource_usage(false);
            if !self.has_enough_resources(&job.resources, &used) {
                log::debug!(
                    "not enough resources to start waiting job (job: {})",
                    job.id,
                );
                continue;
            }

            if job.resources.memory > 0 {
                if let Err(err) = self
                    .memory_tracker
                    .try_acquire(MemoryCategory::Jobs, job.resources.memory)
                {
                    log::debug!("not enough memory to start waiting job (job: {}) - {err:#}", job.id);
                    continue;
                }
            }

            let ports = match self.try_allocate_ports(job.port_count) {
                Some(ports) => ports,
                None => {
                    log::debug!("not enough free ports to start waiting job (job: {})", job.id);
                    if job.resources.memory > 0 {
                        self.memory_tracker
                            .release(MemoryCategory::Jobs, job.resources.memory);
                    }
                    continue;
                }
            };

            {
                let mut runtime = job.runtime.lock().unwrap();
                runtime.state = JobState::Running;
                runtime.phase = JobPhase::Running;
                runtime.started_at = Some(Instant::now());
                runtime.ports = ports;
                runtime.memory_acquired = job.resources.memory;
            }

            log::info!("starting job (job: {})", job.id);
            let this = Arc::clone(self);
            let running = Arc::clone(&job);
            let handle = tokio::spawn(async move {
                let result = this.run_job(&running).await;
                this.complete_job(&running, result);
            });
            *job.task.lock().unwrap() = Some(handle);
        }
    }

    fn try_allocate_ports(&self, count: u16) -> Option<Vec<u16>> {
        if count == 0 {
            return Some(Vec::new());
        }
        let base = self.config.job_port_base?;
        let mut used = self.used_ports.lock().unwrap();
        let mut ports = Vec::with_capacity(count as usize);
        for port in base..=u16::MAX {
            if ports.len() == count as usize {
                break;
            }
            if !used.contains(&port) {
                ports.push(port);
            }
        }
        if ports.len() < count as usize {
            return None;
        }
        for &port in &ports {
            used.insert(port);
        }
        Some(ports)
    }

    async fn run_job(self: &Arc<Self>, job: &Arc<Job>) -> Result<(), Error> {
        match job.spec.clone() {
            JobSpec::RemoveChunk { chunk_id } => {
                let chunk = self.env.store.get_chunk(chunk_id)?;
                self.env.store.remove_chunk(chunk).await?;
                job.set_progress(JobPhase::Cleanup, 1.0);
                Ok(())
            }
            JobSpec::SealChunk { chunk_id, row_count } => {
                let chunk = self.env.store.get_chunk(chunk_id)?;
                if let Some(rows) = chunk.journal_row_count() {
                    if rows < row_count {
                        bail!(
                            "journal chunk {chunk_id} has only {rows} rows, {row_count} required to seal"
                        );
                    }
                }
                chunk.seal().await?;
                job.set_progress(JobPhase::Cleanup, 1.0);
                Ok(())
            }
            JobSpec::ReplicateChunk { chunk_id, targets } => {
                let chunk = self.env.store.get_chunk(chunk_id)?;
                let meta = chunk.get_meta(0, None).await?;
                let block_count = meta.block_count();
                let blocks = self
                    .env
                    .block_store
                    .find_blocks(chunk_id, 0, block_count, 0, WorkloadCategory::Replication)
                    .await?;

                let target_count = targets.len().max(1);
                for (index, target) in targets.iter().enumerate() {
                    self.env
                        .replication
                        .replicate_chunk(
                            chunk_id,
                            target,
                            blocks.clone(),
                            meta.as_ref().clone(),
                        )
                        .await?;
                    job.set_progress(
                        JobPhase::Running,
                        (index + 1) as f64 / target_count as f64,
                    );
                }
                Ok(())
            }
            JobSpec::RepairChunk {
                chunk_id,
                erasure_codec,
                missing_part_indexes,
                sources,
            } => {
                self.env
                    .repair
                    .repair_parts(chunk_id, erasure_codec, missing_part_indexes, sources)
                    .await?;
                job.set_progress(JobPhase::Cleanup, 1.0);
                Ok(())
            }
        }
    }

    fn complete_job(&self, job: &Arc<Job>, result: Result<(), Error>) {
        let state = match &result {
            Ok(()) => JobState::Completed,
            Err(_) => JobState::Failed,
        };
        let job_result = match result {
            Ok(()) => JobResult::success(),
            Err(err) => JobResult::failure(format!("{err:#}")),
        };
        self.finish_job(job, state, job_result);
    }

    /// Terminal transition: release memory and ports exactly once.
    fn finish_job(&self, job: &Arc<Job>, state: JobState, result: JobResult) {
        let released_memory;
        let released_ports;
        {
            let mut runtime = job.runtime.lock().unwrap();
            if runtime.state.is_terminal() {
                return;
            }
            runtime.state = state;
            runtime.phase = JobPhase::Finished;
            runtime.result = Some(result);
            runtime.statistics_pending = true;
            released_memory = std::mem::take(&mut runtime.memory_acquired);
            released_ports = std::mem::take(&mut runtime.ports);
        }

        if released_memory > 0 {
            self.memory_tracker
                .release(MemoryCategory::Jobs, released_memory);
        }
        if !released_ports.is_empty() {
            let mut used = self.used_ports.lock().unwrap();
            for port in released_ports {
                used.remove(&port);
            }
        }

        log::info!("job finished (job: {}, state: {state:?})", job.id);
    }

    pub fn abort_job(&self, job: &Arc<Job>, reason: Error) {
        log::info!("job abort requested (job: {}) - {reason:#}", job.id);
        if let Some(handle) = job.task.lock().unwrap().take() {
            handle.abort();
        }
        self.finish_job(job, JobState::Aborted, JobResult::failure(format!("{reason:#}")));
    }

    pub fn remove_job(&self, job_id: JobId) {
        let removed = self.jobs.lock().unwrap().remove(&job_id);
        match removed {
            Some(job) => {
                // the master must only remove terminal jobs
                if !job.state().is_terminal() {
                    self.abort_job(&job, format_err!("removed while still active"));
                }
                log::info!("job removed (job: {job_id})");
            }
            None => log::warn!("requested to remove a non-existing job (job: {job_id})"),
        }
    }

    /// Abort jobs stuck in `Waiting` past the configured timeout.
    pub fn check_waiting_timeouts(&self) {
        for job in self.jobs() {
            if job.state() != JobState::Waiting {
                continue;
            }
            if job.created_at.elapsed() > self.config.waiting_jobs_timeout {
                self.abort_job(
                    &job,
                    anyhow::Error::new(ErrorKind::WaitingJobTimeout(job.id)),
                );
            }
        }
    }

    /// Abort the newest running jobs while memory/cpu usage overdrafts
    /// the limits for longer than the overdraft timeout, or while mapped
    /// memory exceeds the configured reservation.
    pub fn check_overdraft(&self) {
        let limits = self.resource_limits();
        let usage = self.resource_usage(false);
        let overdrafted = usage.memory > limits.memory || usage.cpu > limits.cpu;

        let expired = {
            let mut since = self.overdraft_since.lock().unwrap();
            if !overdrafted {
                *since = None;
                false
            } else {
                let started = since.get_or_insert_with(Instant::now);
                started.elapsed() > self.config.overdraft_timeout
            }
        };

        let mapped_overdraft = match self.config.reserved_mapped_memory {
            Some(reserved) => match self.mapped_memory.mapped_bytes() {
                Ok(mapped) => mapped > reserved,
                Err(err) => {
                    log::warn!("mapped memory probe failed - {err:#}");
                    false
                }
            },
            None => false,
        };

        if !expired && !mapped_overdraft {
            return;
        }

        // newest first, until usage fits again
        let mut running: Vec<Arc<Job>> = self
            .jobs()
            .into_iter()
            .filter(|job| job.state() == JobState::Running)
            .collect();
        running.sort_by_key(|job| {
            std::cmp::Reverse(job.runtime.lock().unwrap().started_at)
        });

        for job in running {
            let usage = self.resource_usage(false);
            let fits = usage.memory <= limits.memory && usage.cpu <= limits.cpu;
            if fits && !mapped_overdraft {
                break;
            }
            self.abort_job(
                &job,
                anyhow::Error::new(ErrorKind::NodeResourceOvercommit)
                    .context("node resource usage overdrafted the limits"),
            );
            if mapped_overdraft {
                // one job per probe; re-evaluated next tick
                break;
            }
        }
    }

    // -- heartbeat plumbing -------------------------------------------------

    /// Statuses of this cell's jobs; statistics of terminal jobs go out
    /// under the throttler budget.
    pub fn prepare_heartbeat(&self, cell_tag: CellTag) -> JobHeartbeatRequest {
        let mut statuses = Vec::new();
        for job in self.jobs() {
            if job.id.cell_tag() != cell_tag {
                continue;
            }
            let mut status = job.status();
            if job.state().is_terminal() {
                let mut runtime = job.runtime.lock().unwrap();
                if runtime.statistics_pending {
                    let statistics = format!(
                        "{{\"progress\":{},\"type\":\"{:?}\"}}",
                        runtime.progress,
                        job.spec.job_type(),
                    );
                    if self.statistics_throttler.try_acquire(statistics.len() as u64) {
                        runtime.statistics_pending = false;
                        status.statistics = Some(statistics);
                    }
                }
            }
            statuses.push(status);
        }

        JobHeartbeatRequest {
            node_id: 0, // filled by the master connector
            cell_tag,
            resource_limits: self.resource_limits(),
            resource_usage: self.resource_usage(true),
            jobs: statuses,
        }
    }

    pub fn process_heartbeat_response(self: &Arc<Self>, response: JobHeartbeatResponse) {
        for job_id in response.jobs_to_remove {
            self.remove_job(job_id);
        }
        for job_id in response.jobs_to_abort {
            match self.find_job(job_id) {
                Some(job) => self.abort_job(&job, format_err!("job aborted by master")),
                None => log::warn!("requested to abort a non-existing job (job: {job_id})"),
            }
        }
        for job_id in response.jobs_to_interrupt {
            match self.find_job(job_id) {
                Some(job) => self.abort_job(&job, format_err!("job interrupted by master")),
                None => log::warn!("requested to interrupt a non-existing job (job: {job_id})"),
            }
        }
        for job_id in response.jobs_to_fail {
            match self.find_job(job_id) {
                Some(job) => self.finish_job(
                    &job,
                    JobState::Failed,
                    JobResult::failure("job failed by master request"),
                ),
                None => log::warn!("requested to fail a non-existing job (job: {job_id})"),
            }
        }
        // stored jobs just stay in the map until removed

        for info in response.jobs_to_start {
            let spec = match info.spec.clone() {
                Some(spec) => spec,
                None => {
                    // the spec must be fetched from a controller agent;
                    // without an agent client configured this is an error
                    log::error!(
                        "job {} came without an inline spec (agent: {:?})",
                        info.job_id,
                        info.spec_service_address,
                    );
                    continue;
                }
            };
            if let Err(err) = self.create_job(info, spec) {
                if error_kind(&err).is_some() {
                    log::warn!("failed to create job - {err:#}");
                } else {
                    log::error!("failed to create job - {err:#}");
                }
            }
        }
    }
}
