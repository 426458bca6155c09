//! Storage locations.
//!
//! A location owns one mount point: the chunk files fanned out into
//! `<hh>/` directories, the trash tree, the `cell_id` and `disabled`
//! marker files, per-location thread pools and the pending-I/O accounting.
//! Unrecoverable disk faults disable the location: the error is persisted
//! to the lock file and the process terminates so the operator restart
//! re-validates everything.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use anyhow::{bail, format_err, Error};

use dn_api_types::{
    CacheLocationConfig, CellId, ChunkDescriptor, ChunkId, HealthCheckConfig, IoCategory,
    IoDirection, ObjectType, StoreLocationConfig, WorkloadCategory,
};
use dn_tools::periodic::PeriodicTask;

use crate::disk_checker::{DiskHealthChecker, HEALTH_CHECK_FILE_NAME};
use crate::format::{
    with_suffix, ARTIFACT_META_SUFFIX, CHUNK_META_SUFFIX, JOURNAL_INDEX_SUFFIX, SEALED_SUFFIX,
};
use crate::io_pool::{FifoPool, PrioritizedPool};
use crate::journal::JournalFile;

pub const CELL_ID_FILE_NAME: &str = "cell_id";
pub const DISABLED_LOCK_FILE_NAME: &str = "disabled";
pub const TRASH_DIRECTORY: &str = "trash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Store,
    Cache,
}

/// Called after the disable lock file is written; the production hook
/// terminates the process, tests substitute their own.
pub type AbortHook = Arc<dyn Fn(&Error) + Send + Sync>;

pub fn exit_process_hook() -> AbortHook {
    Arc::new(|_err: &Error| {
        std::process::exit(1);
    })
}

struct LocationOptions {
    path: PathBuf,
    quota: Option<u64>,
    low_watermark: u64,
    high_watermark: u64,
    trash_cleanup_watermark: u64,
    max_trash_ttl: std::time::Duration,
    trash_check_period: std::time::Duration,
    enable_blobs: bool,
    enable_journals: bool,
    health_check: HealthCheckConfig,
}

#[derive(Debug, Clone)]
struct TrashEntry {
    chunk_id: ChunkId,
    disk_space: u64,
}

#[derive(Default)]
struct TrashState {
    entries: BTreeMap<(SystemTime, u64), TrashEntry>,
    seq: u64,
    disk_space: u64,
}

pub struct Location {
    id: String,
    kind: LocationKind,
    options: LocationOptions,

    enabled: AtomicBool,
    used_space: AtomicI64,
    session_count: AtomicI64,
    chunk_count: AtomicI64,
    pending_io: [[AtomicI64; 3]; 2],

    trash: Mutex<TrashState>,
    disable_alert: Mutex<Option<String>>,

    read_pool: Arc<PrioritizedPool>,
    meta_pool: Arc<PrioritizedPool>,
    write_pool: Arc<FifoPool>,

    abort_hook: AbortHook,
    background: Mutex<Vec<PeriodicTask>>,
}

impl Location {
    pub fn new_store(id: &str, config: &StoreLocationConfig, abort_hook: AbortHook) -> Arc<Self> {
        let options = LocationOptions {
            path: config.path.clone(),
            quota: config.quota,
            low_watermark: config.low_watermark,
            high_watermark: config.high_watermark,
            trash_cleanup_watermark: config.trash_cleanup_watermark,
            max_trash_ttl: config.max_trash_ttl,
            trash_check_period: config.trash_check_period,
            enable_blobs: config.enable_blobs,
            enable_journals: config.enable_journals,
            health_check: config.health_check.clone(),
        };
        Self::new(
            id,
            LocationKind::Store,
            options,
            config.read_thread_count,
            config.write_thread_count,
            abort_hook,
        )
    }

    pub fn new_cache(id: &str, config: &CacheLocationConfig, abort_hook: AbortHook) -> Arc<Self> {
        let options = LocationOptions {
            path: config.path.clone(),
            quota: config.quota,
            low_watermark: config.low_watermark,
            high_watermark: 0,
            trash_cleanup_watermark: 0,
            max_trash_ttl: std::time::Duration::ZERO,
            trash_check_period: std::time::Duration::from_secs(10),
            enable_blobs: true,
            enable_journals: false,
            health_check: config.health_check.clone(),
        };
        Self::new(
            id,
            LocationKind::Cache,
            options,
            config.read_thread_count,
            config.write_thread_count,
            abort_hook,
        )
    }

    fn new(
        id: &str,
        kind: LocationKind,
        options: LocationOptions,
        read_threads: usize,
        write_threads: usize,
        abort_hook: AbortHook,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_owned(),
            kind,
            read_pool: Arc::new(PrioritizedPool::new(&format!("dataread-{id}"), read_threads)),
            meta_pool: Arc::new(PrioritizedPool::new(&format!("metaread-{id}"), 1)),
            write_pool: Arc::new(FifoPool::new(&format!("datawrite-{id}"), write_threads)),
            options,
            enabled: AtomicBool::new(false),
            used_space: AtomicI64::new(0),
            session_count: AtomicI64::new(0),
            chunk_count: AtomicI64::new(0),
            pending_io: Default::default(),
            trash: Mutex::new(TrashState::default()),
            disable_alert: Mutex::new(None),
            abort_hook,
            background: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> LocationKind {
        self.kind
    }

    pub fn path(&self) -> &Path {
        &self.options.path
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn quota(&self) -> u64 {
        self.options.quota.unwrap_or(u64::MAX)
    }

    pub fn read_pool(&self) -> &Arc<PrioritizedPool> {
        &self.read_pool
    }

    pub fn meta_pool(&self) -> &Arc<PrioritizedPool> {
        &self.meta_pool
    }

    pub fn write_pool(&self) -> &Arc<FifoPool> {
        &self.write_pool
    }

    pub fn alert(&self) -> Option<String> {
        self.disable_alert.lock().unwrap().clone()
    }

    // -- space accounting ---------------------------------------------------

    pub fn update_used_space(&self, delta: i64) {
        if !self.is_enabled() {
            return;
        }
        self.used_space.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn used_space(&self) -> u64 {
        self.used_space.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn update_session_count(&self, delta: i64) {
        if !self.is_enabled() {
            return;
        }
        self.session_count.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> u64 {
        self.session_count.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn update_chunk_count(&self, delta: i64) {
        if !self.is_enabled() {
            return;
        }
        self.chunk_count.fetch_add(delta, Ordering::SeqCst);
    }

    pub fn chunk_count(&self) -> u64 {
        self.chunk_count.load(Ordering::SeqCst).max(0) as u64
    }

    /// Fresh available space: disk free space plus reclaimable trash,
    /// clamped by the remaining quota. A statvfs failure disables the
    /// location.
    pub fn available_space(self: &Arc<Self>) -> u64 {
        if !self.is_enabled() {
            return 0;
        }

        let mut available = match dn_tools::fs::disk_available_space(self.path()) {
            Ok(space) => space,
            Err(err) => {
                let err = format_err!("failed to compute available space - {err}");
                self.disable(&err);
                return 0;
            }
        };

        // trash is reclaimable on demand
        available += self.trash_disk_space();

        let remaining_quota = self.quota().saturating_sub(self.used_space());
        available.min(remaining_quota)
    }

    pub fn low_watermark_space(&self) -> u64 {
        self.options.low_watermark
    }

    pub fn is_full(self: &Arc<Self>) -> bool {
        self.available_space() < self.options.low_watermark
    }

    pub fn has_enough_space(self: &Arc<Self>, size: u64) -> bool {
        self.available_space().saturating_sub(size) >= self.options.high_watermark
    }

    pub fn load_factor(&self) -> f64 {
        let used = self.used_space();
        let quota = self.quota();
        if used >= quota {
            1.0
        } else {
            used as f64 / quota as f64
        }
    }

    pub fn accepts_chunk_type(self: &Arc<Self>, object_type: ObjectType) -> bool {
        if !self.is_enabled() || self.is_full() {
            return false;
        }
        match object_type {
            ObjectType::Blob | ObjectType::ErasureBlob => self.options.enable_blobs,
            ObjectType::Journal => self.options.enable_journals,
            ObjectType::Artifact => self.kind == LocationKind::Cache,
        }
    }

    // -- pending I/O --------------------------------------------------------

    pub fn pending_io_size(&self, direction: IoDirection, workload: WorkloadCategory) -> i64 {
        self.pending_io_counter(direction, workload.io_category())
            .load(Ordering::SeqCst)
    }

    pub fn total_pending_read_size(&self) -> i64 {
        self.pending_io[IoDirection::Read as usize]
            .iter()
            .map(|counter| counter.load(Ordering::SeqCst))
            .sum()
    }

    pub fn increase_pending_io_size(
        self: &Arc<Self>,
        direction: IoDirection,
        workload: WorkloadCategory,
        delta: i64,
    ) -> PendingIoGuard {
        debug_assert!(delta >= 0);
        let category = workload.io_category();
        self.update_pending_io_size(direction, category, delta);
        PendingIoGuard {
            owner: Some(Arc::clone(self)),
            direction,
            category,
            size: delta,
        }
    }

    fn pending_io_counter(&self, direction: IoDirection, category: IoCategory) -> &AtomicI64 {
        &self.pending_io[direction as usize][category as usize]
    }

    fn update_pending_io_size(&self, direction: IoDirection, category: IoCategory, delta: i64) {
        let result = self
            .pending_io_counter(direction, category)
            .fetch_add(delta, Ordering::SeqCst)
            + delta;
        log::trace!(
            "pending io size updated (location: {}, direction: {direction:?}, category: {category:?}, pending: {result}, delta: {delta})",
            self.id,
        );
    }

    // -- paths --------------------------------------------------------------

    fn relative_chunk_path(chunk_id: ChunkId) -> PathBuf {
        PathBuf::from(format!("{:02x}", chunk_id.hash_byte())).join(chunk_id.to_string())
    }

    pub fn chunk_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.options.path.join(Self::relative_chunk_path(chunk_id))
    }

    pub fn trash_path(&self) -> PathBuf {
        self.options.path.join(TRASH_DIRECTORY)
    }

    pub fn trash_chunk_path(&self, chunk_id: ChunkId) -> PathBuf {
        self.trash_path().join(Self::relative_chunk_path(chunk_id))
    }

    /// File names (within the chunk's hash directory) that may make up
    /// this chunk.
    pub fn chunk_part_names(&self, chunk_id: ChunkId) -> Vec<String> {
        let primary = chunk_id.to_string();
        match chunk_id.object_type() {
            Ok(ObjectType::Blob) | Ok(ObjectType::ErasureBlob) => vec![
                primary.clone(),
                format!("{primary}{CHUNK_META_SUFFIX}"),
            ],
            Ok(ObjectType::Journal) => vec![
                primary.clone(),
                format!("{primary}{JOURNAL_INDEX_SUFFIX}"),
                format!("{primary}{SEALED_SUFFIX}"),
            ],
            Ok(ObjectType::Artifact) => vec![
                primary.clone(),
                format!("{primary}{ARTIFACT_META_SUFFIX}"),
            ],
            Err(_) => vec![primary],
        }
    }

    fn force_hash_directories(root: &Path) -> Result<(), Error> {
        for hash_byte in 0..=0xffu32 {
            std::fs::create_dir_all(root.join(format!("{hash_byte:02x}")))?;
        }
        Ok(())
    }

    // -- lifecycle ----------------------------------------------------------

    /// Enumerate and repair chunks. On validation problems the location is
    /// softly disabled and an empty list is returned; an actual scan
    /// failure disables it hard.
    pub async fn scan(self: &Arc<Self>) -> Vec<ChunkDescriptor> {
        if let Err(err) = self.validate_before_scan().await {
            log::error!("location {} disabled - {err:#}", self.id);
            self.mark_disabled(&err);
            return Vec::new();
        }

        self.enabled.store(true, Ordering::SeqCst);

        match self.do_scan() {
            Ok(descriptors) => descriptors,
            Err(err) => {
                let err = format_err!("location scan failed - {err}");
                self.disable(&err);
                Vec::new()
            }
        }
    }

    async fn validate_before_scan(self: &Arc<Self>) -> Result<(), Error> {
        self.validate_lock_file()?;

        std::fs::create_dir_all(self.path())
            .map_err(|err| format_err!("unable to create location directory - {err}"))?;

        // run one health check up front to sort out read-only drives
        let checker = DiskHealthChecker::new(
            self.options.health_check.clone(),
            self.path(),
            Arc::clone(&self.write_pool),
        );
        checker.run_check().await
    }

    fn validate_lock_file(&self) -> Result<(), Error> {
        log::info!("checking lock file at {:?}", self.path());

        let lock_file_path = self.options.path.join(DISABLED_LOCK_FILE_NAME);
        if !lock_file_path.exists() {
            return Ok(());
        }

        let contents = dn_tools::fs::read_file_string(&lock_file_path)?;
        if contents.is_empty() {
            bail!("empty lock file found");
        }

        let document: serde_json::Value = serde_json::from_str(&contents)
            .map_err(|err| format_err!("error parsing lock file contents - {err}"))?;
        bail!(
            "location was disabled: {}",
            document
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or(&contents),
        );
    }

    fn do_scan(self: &Arc<Self>) -> Result<Vec<ChunkDescriptor>, Error> {
        log::info!("scanning storage location {}", self.id);

        Self::force_hash_directories(self.path())?;

        let mut chunk_ids = std::collections::HashSet::new();
        for entry in walkdir::WalkDir::new(self.path()).min_depth(2).max_depth(2) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().starts_with(self.trash_path()) {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            if self.should_skip_file_name(&file_name) {
                continue;
            }
            let bare_name = file_name.split('.').next().unwrap_or(&file_name);
            match bare_name.parse::<ChunkId>() {
                Ok(chunk_id) => {
                    chunk_ids.insert(chunk_id);
                }
                Err(_) => {
                    log::error!(
                        "unrecognized file {:?} in location directory",
                        entry.path()
                    );
                }
            }
        }

        // repair half-present chunks, collecting descriptors of complete ones
        let mut descriptors = Vec::new();
        for chunk_id in chunk_ids {
            if let Some(descriptor) = self.repair_chunk(chunk_id)? {
                descriptors.push(descriptor);
            }
        }

        if self.kind == LocationKind::Store {
            self.scan_trash()?;
        }

        log::info!("done, {} chunks found at {}", descriptors.len(), self.id);
        Ok(descriptors)
    }

    fn should_skip_file_name(&self, file_name: &str) -> bool {
        file_name == CELL_ID_FILE_NAME
            || file_name == DISABLED_LOCK_FILE_NAME
            || file_name == HEALTH_CHECK_FILE_NAME
            || file_name.ends_with('~')
    }

    fn repair_chunk(self: &Arc<Self>, chunk_id: ChunkId) -> Result<Option<ChunkDescriptor>, Error> {
        match chunk_id.object_type() {
            Ok(ObjectType::Blob) | Ok(ObjectType::ErasureBlob) => match self.kind {
                LocationKind::Store => self.repair_blob_chunk(chunk_id),
                LocationKind::Cache => self.repair_cache_chunk(chunk_id, CHUNK_META_SUFFIX),
            },
            Ok(ObjectType::Journal) if self.kind == LocationKind::Store => {
                self.repair_journal_chunk(chunk_id)
            }
            Ok(ObjectType::Artifact) if self.kind == LocationKind::Cache => {
                self.repair_cache_chunk(chunk_id, ARTIFACT_META_SUFFIX)
            }
            _ => {
                log::warn!("invalid type of chunk {chunk_id}, skipped");
                Ok(None)
            }
        }
    }

    fn repair_blob_chunk(
        self: &Arc<Self>,
        chunk_id: ChunkId,
    ) -> Result<Option<ChunkDescriptor>, Error> {
        let data_path = self.chunk_path(chunk_id);
        let meta_path = with_suffix(&data_path, CHUNK_META_SUFFIX);

        let has_data = data_path.exists();
        let has_meta = meta_path.exists();

        if has_data && has_meta {
            let data_size = dn_tools::fs::file_size(&data_path)?;
            let meta_size = dn_tools::fs::file_size(&meta_path)?;
            if meta_size > 0 {
                return Ok(Some(ChunkDescriptor {
                    id: chunk_id,
                    disk_space: data_size + meta_size,
                    row_count: None,
                    sealed: None,
                }));
            }
            // zero-length meta appears after certain crashed writes
            log::warn!("chunk meta file {meta_path:?} is empty, removing chunk files");
            std::fs::remove_file(&data_path)?;
            std::fs::remove_file(&meta_path)?;
        } else if has_data && !has_meta {
            log::warn!("chunk meta file {meta_path:?} is missing, moving data file to trash");
            self.move_part_to_trash(chunk_id, &data_path)?;
        } else if !has_data && has_meta {
            log::warn!("chunk data file {data_path:?} is missing, moving meta file to trash");
            self.move_part_to_trash(chunk_id, &meta_path)?;
        }
        Ok(None)
    }

    fn repair_journal_chunk(
        self: &Arc<Self>,
        chunk_id: ChunkId,
    ) -> Result<Option<ChunkDescriptor>, Error> {
        let data_path = self.chunk_path(chunk_id);
        let index_path = with_suffix(&data_path, JOURNAL_INDEX_SUFFIX);

        if data_path.exists() {
            // this also (re)creates the index if missing
            let journal = JournalFile::open(&data_path)?;
            return Ok(Some(ChunkDescriptor {
                id: chunk_id,
                disk_space: journal.data_size(),
                row_count: Some(journal.row_count()),
                sealed: Some(journal.is_sealed()),
            }));
        }

        if index_path.exists() {
            log::warn!("journal data file {data_path:?} is missing, moving index file to trash");
            self.move_part_to_trash(chunk_id, &index_path)?;
        }
        Ok(None)
    }

    fn repair_cache_chunk(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        meta_suffix: &str,
    ) -> Result<Option<ChunkDescriptor>, Error> {
        let data_path = self.chunk_path(chunk_id);
        let meta_path = with_suffix(&data_path, meta_suffix);

        let has_data = data_path.exists();
        let has_meta = meta_path.exists();

        if has_data && has_meta {
            let data_size = dn_tools::fs::file_size(&data_path)?;
            let meta_size = dn_tools::fs::file_size(&meta_path)?;
            if meta_size > 0 {
                return Ok(Some(ChunkDescriptor {
                    id: chunk_id,
                    disk_space: data_size + meta_size,
                    row_count: None,
                    sealed: None,
                }));
            }
            log::warn!("chunk meta file {meta_path:?} is empty, removing chunk files");
        } else if has_data {
            log::warn!("chunk meta file {meta_path:?} is missing, removing data file");
        } else if has_meta {
            log::warn!("chunk data file {data_path:?} is missing, removing meta file");
        }

        // cache locations never keep half-present chunks
        if has_data {
            std::fs::remove_file(&data_path)?;
        }
        if has_meta {
            std::fs::remove_file(&meta_path)?;
        }
        Ok(None)
    }

    fn scan_trash(self: &Arc<Self>) -> Result<(), Error> {
        log::info!("scanning storage trash at {}", self.id);

        Self::force_hash_directories(&self.trash_path())?;

        let mut trash_ids = std::collections::HashSet::new();
        for entry in walkdir::WalkDir::new(self.trash_path())
            .min_depth(2)
            .max_depth(2)
        {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let file_name = entry.file_name().to_string_lossy();
            let bare_name = file_name.split('.').next().unwrap_or(&file_name);
            match bare_name.parse::<ChunkId>() {
                Ok(chunk_id) => {
                    trash_ids.insert(chunk_id);
                }
                Err(_) => {
                    log::error!(
                        "unrecognized file {:?} in location trash directory",
                        entry.path()
                    );
                }
            }
        }

        for chunk_id in &trash_ids {
            // recover the removal time from file modification times
            let mut timestamp = SystemTime::UNIX_EPOCH;
            let directory = self
                .trash_chunk_path(*chunk_id)
                .parent()
                .map(Path::to_owned)
                .unwrap();
            for name in self.chunk_part_names(*chunk_id) {
                let path = directory.join(name);
                if let Ok(meta) = std::fs::metadata(&path) {
                    if let Ok(mtime) = meta.modified() {
                        timestamp = timestamp.max(mtime);
                    }
                }
            }
            self.register_trash_chunk(*chunk_id, timestamp)?;
        }

        log::info!("done, {} trash chunks found at {}", trash_ids.len(), self.id);
        Ok(())
    }

    /// Verify the cell id file (creating it on first start) and kick off
    /// the periodic health and trash checks.
    pub async fn start(self: &Arc<Self>, cell_id: CellId) -> Result<(), Error> {
        if !self.is_enabled() {
            return Ok(());
        }

        if let Err(err) = self.do_start(cell_id).await {
            self.disable(&format_err!("location start failed - {err}"));
        }
        Ok(())
    }

    async fn do_start(self: &Arc<Self>, cell_id: CellId) -> Result<(), Error> {
        let cell_id_path = self.options.path.join(CELL_ID_FILE_NAME);
        if cell_id_path.exists() {
            let contents = dn_tools::fs::read_file_string(&cell_id_path)?;
            let found: CellId = contents
                .parse()
                .map_err(|err| format_err!("failed to parse cell id - {err}"))?;
            if found != cell_id {
                bail!("wrong cell id: expected {cell_id}, found {found}");
            }
        } else {
            log::info!("cell id file is not found, creating");
            dn_tools::fs::replace_file(&cell_id_path, cell_id.to_string().as_bytes(), true)?;
        }

        let mut background = self.background.lock().unwrap();

        let checker = DiskHealthChecker::new(
            self.options.health_check.clone(),
            self.path(),
            Arc::clone(&self.write_pool),
        );
        let this = Arc::clone(self);
        background.push(checker.start(move |err| {
            this.disable(&err);
        }));

        if self.kind == LocationKind::Store {
            let this = Arc::clone(self);
            background.push(PeriodicTask::spawn(
                "trash-check",
                self.options.trash_check_period,
                move || {
                    let this = Arc::clone(&this);
                    async move {
                        this.on_check_trash();
                    }
                },
            ));
        }

        Ok(())
    }

    /// Hard disable: persist the error to the lock file and invoke the
    /// abort hook (which exits the process in production). Only the first
    /// caller writes the file.
    pub fn disable(self: &Arc<Self>, error: &Error) {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            // somebody else is already tearing the process down
            return;
        }

        log::error!("disabling location {} - {error:#}", self.id);
        *self.disable_alert.lock().unwrap() = Some(format!("{error:#}"));

        let lock_file_path = self.options.path.join(DISABLED_LOCK_FILE_NAME);
        let document = serde_json::json!({ "message": format!("{error:#}") });
        if let Err(err) = dn_tools::fs::replace_file(
            &lock_file_path,
            document.to_string().as_bytes(),
            true,
        ) {
            log::error!("error creating location lock file - {err:#}");
            // fall through to the abort hook anyway
        }

        (self.abort_hook)(error);
    }

    /// Soft disable used during scan validation: no lock file, no exit,
    /// just an alert and zeroed counters.
    pub fn mark_disabled(&self, error: &Error) {
        *self.disable_alert.lock().unwrap() =
            Some(format!("chunk location at {:?} is disabled - {error:#}", self.path()));
        self.enabled.store(false, Ordering::SeqCst);
        self.used_space.store(0, Ordering::SeqCst);
        self.session_count.store(0, Ordering::SeqCst);
        self.chunk_count.store(0, Ordering::SeqCst);
    }

    // -- chunk file removal and trash ---------------------------------------

    /// Remove the chunk's files. Store locations move them to trash unless
    /// `force` is set; cache locations always delete. I/O failures disable
    /// the location.
    pub fn remove_chunk_files(self: &Arc<Self>, chunk_id: ChunkId, force: bool) {
        let result = if force || self.kind == LocationKind::Cache {
            self.remove_chunk_files_permanently(chunk_id)
        } else {
            self.move_chunk_files_to_trash(chunk_id)
        };

        if let Err(err) = result {
            self.disable(&format_err!("error removing chunk {chunk_id} - {err}"));
        }
    }

    fn remove_chunk_files_permanently(&self, chunk_id: ChunkId) -> Result<(), Error> {
        log::debug!("started removing chunk files (chunk: {chunk_id})");

        let directory = self.chunk_path(chunk_id).parent().map(Path::to_owned).unwrap();
        for name in self.chunk_part_names(chunk_id) {
            let path = directory.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => bail!("unable to remove {path:?} - {err}"),
            }
        }

        log::debug!("finished removing chunk files (chunk: {chunk_id})");
        Ok(())
    }

    fn move_chunk_files_to_trash(self: &Arc<Self>, chunk_id: ChunkId) -> Result<(), Error> {
        log::debug!("started moving chunk files to trash (chunk: {chunk_id})");

        let directory = self.chunk_path(chunk_id).parent().map(Path::to_owned).unwrap();
        let trash_directory = self
            .trash_chunk_path(chunk_id)
            .parent()
            .map(Path::to_owned)
            .unwrap();
        std::fs::create_dir_all(&trash_directory)?;

        for name in self.chunk_part_names(chunk_id) {
            let src = directory.join(&name);
            let dst = trash_directory.join(&name);
            match std::fs::rename(&src, &dst) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => bail!("unable to move {src:?} to trash - {err}"),
            }
        }

        log::debug!("finished moving chunk files to trash (chunk: {chunk_id})");
        self.register_trash_chunk(chunk_id, SystemTime::now())?;
        Ok(())
    }

    fn move_part_to_trash(&self, chunk_id: ChunkId, path: &Path) -> Result<(), Error> {
        let trash_directory = self
            .trash_chunk_path(chunk_id)
            .parent()
            .map(Path::to_owned)
            .unwrap();
        std::fs::create_dir_all(&trash_directory)?;
        let dst = trash_directory.join(path.file_name().unwrap());
        std::fs::rename(path, &dst)
            .map_err(|err| format_err!("unable to move {path:?} to trash - {err}"))?;
        Ok(())
    }

    fn register_trash_chunk(&self, chunk_id: ChunkId, timestamp: SystemTime) -> Result<(), Error> {
        let mut disk_space = 0;
        let trash_directory = self
            .trash_chunk_path(chunk_id)
            .parent()
            .map(Path::to_owned)
            .unwrap();
        for name in self.chunk_part_names(chunk_id) {
            let path = trash_directory.join(name);
            if let Ok(meta) = std::fs::metadata(&path) {
                disk_space += meta.len();
            }
        }

        {
            let mut trash = self.trash.lock().unwrap();
            let seq = trash.seq;
            trash.seq += 1;
            trash.entries.insert(
                (timestamp, seq),
                TrashEntry {
                    chunk_id,
                    disk_space,
                },
            );
            trash.disk_space += disk_space;
        }

        log::debug!(
            "trash chunk registered (chunk: {chunk_id}, disk space: {disk_space})",
        );
        Ok(())
    }

    pub fn trash_disk_space(&self) -> u64 {
        self.trash.lock().unwrap().disk_space
    }

    /// One trash maintenance pass: expire old entries, then free space
    /// down to the cleanup watermark. Runs periodically; exposed for
    /// tests.
    pub fn on_check_trash(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }

        let result = self
            .check_trash_ttl()
            .and_then(|_| self.check_trash_watermark());
        if let Err(err) = result {
            self.disable(&format_err!("error checking trash - {err}"));
        }
    }

    fn check_trash_ttl(self: &Arc<Self>) -> Result<(), Error> {
        let deadline = SystemTime::now()
            .checked_sub(self.options.max_trash_ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        loop {
            let entry = {
                let mut trash = self.trash.lock().unwrap();
                let Some((&key, _)) = trash.entries.iter().next() else {
                    break;
                };
                if key.0 >= deadline {
                    break;
                }
                let entry = trash.entries.remove(&key).unwrap();
                trash.disk_space -= entry.disk_space;
                entry
            };
            self.remove_trash_files(&entry)?;
        }
        Ok(())
    }

    fn check_trash_watermark(self: &Arc<Self>) -> Result<(), Error> {
        let needs_cleanup = |this: &Arc<Self>| {
            let trash_space = this.trash_disk_space();
            let available = this.available_space().saturating_sub(trash_space);
            available < this.options.trash_cleanup_watermark && trash_space > 0
        };

        if !needs_cleanup(self) {
            return Ok(());
        }

        log::info!(
            "low available disk space, starting trash cleanup (location: {})",
            self.id,
        );

        while needs_cleanup(self) {
            let entry = {
                let mut trash = self.trash.lock().unwrap();
                let Some((&key, _)) = trash.entries.iter().next() else {
                    break;
                };
                let entry = trash.entries.remove(&key).unwrap();
                trash.disk_space -= entry.disk_space;
                entry
            };
            self.remove_trash_files(&entry)?;
        }

        log::info!("finished trash cleanup (location: {})", self.id);
        Ok(())
    }

    fn remove_trash_files(&self, entry: &TrashEntry) -> Result<(), Error> {
        let trash_directory = self
            .trash_chunk_path(entry.chunk_id)
            .parent()
            .map(Path::to_owned)
            .unwrap();
        for name in self.chunk_part_names(entry.chunk_id) {
            let path = trash_directory.join(name);
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => bail!("unable to remove trash file {path:?} - {err}"),
            }
        }
        log::debug!(
            "trash chunk removed (chunk: {}, disk space: {})",
            entry.chunk_id,
            entry.disk_space,
        );
        Ok(())
    }
}

/// Scoped handle decrementing the pending-I/O counter on destruction.
pub struct PendingIoGuard {
    owner: Option<Arc<Location>>,
    direction: IoDirection,
    category: IoCategory,
    size: i64,
}

impl PendingIoGuard {
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn release(&mut self) {
        if let Some(owner) = self.owner.take() {
            owner.update_pending_io_size(self.direction, self.category, -self.size);
        }
    }
}

impl Drop for PendingIoGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
pub(crate) mod test_util {
    use super::*;

    /// Abort hook for tests: records the error instead of exiting.
    pub fn panic_on_disable_hook() -> AbortHook {
        Arc::new(|err: &Error| {
            panic!("location disabled in test: {err:#}");
        })
    }

    pub fn recording_hook() -> (AbortHook, Arc<Mutex<Option<String>>>) {
        let seen = Arc::new(Mutex::new(None));
        let seen2 = Arc::clone(&seen);
        let hook: AbortHook = Arc::new(move |err: &Error| {
            *seen2.lock().unwrap() = Some(format!("{err:#}"));
        });
        (hook, seen)
    }

    pub fn test_store_config(path: &Path) -> StoreLocationConfig {
        let mut config = StoreLocationConfig::new(path);
        config.health_check.use_direct_io = false;
        config.health_check.test_size = 4096;
        // tiny watermarks so temp dirs do not look full
        config.low_watermark = 0;
        config.high_watermark = 0;
        config.trash_cleanup_watermark = 0;
        config
    }
}

#[cfg(test)]
mod test {
    use super::test_util::*;
    use super::*;
    use dn_api_types::ObjectType;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "dn-location-test-{tag}-{}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_scan_repairs_half_present_blobs() {
        let dir = temp_dir("repair");
        let config = test_store_config(&dir);
        let location = Location::new_store("loc0", &config, panic_on_disable_hook());

        // lay out one complete chunk, one data-only, one meta-only
        Location::force_hash_directories(&dir).unwrap();
        let complete = ChunkId::new(ObjectType::Blob, 1, 0x01);
        let data_only = ChunkId::new(ObjectType::Blob, 1, 0x02);
        let meta_only = ChunkId::new(ObjectType::Blob, 1, 0x03);

        let complete_path = location.chunk_path(complete);
        std::fs::write(&complete_path, b"data").unwrap();
        std::fs::write(with_suffix(&complete_path, CHUNK_META_SUFFIX), b"{}").unwrap();

        std::fs::write(location.chunk_path(data_only), b"orphan").unwrap();
        std::fs::write(
            with_suffix(&location.chunk_path(meta_only), CHUNK_META_SUFFIX),
            b"{}",
        )
        .unwrap();

        let descriptors = location.scan().await;
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].id, complete);
        assert_eq!(descriptors[0].disk_space, 4 + 2);

        // orphans were moved to trash and registered
        assert!(!location.chunk_path(data_only).exists());
        assert!(location.trash_chunk_path(data_only).exists());
        assert!(location.trash_disk_space() > 0);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_lock_file_disables_scan() {
        let dir = temp_dir("lockfile");
        std::fs::write(
            dir.join(DISABLED_LOCK_FILE_NAME),
            serde_json::json!({ "message": "previous fault" }).to_string(),
        )
        .unwrap();

        let config = test_store_config(&dir);
        let location = Location::new_store("loc1", &config, panic_on_disable_hook());
        let descriptors = location.scan().await;
        assert!(descriptors.is_empty());
        assert!(!location.is_enabled());
        assert!(location.alert().unwrap().contains("previous fault"));

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_trash_ttl_sweep() {
        let dir = temp_dir("trash");
        let mut config = test_store_config(&dir);
        config.max_trash_ttl = std::time::Duration::from_secs(1);
        let location = Location::new_store("loc2", &config, panic_on_disable_hook());
        location.scan().await;
        assert!(location.is_enabled());

        let chunk_id = ChunkId::new(ObjectType::Blob, 1, 0x11);
        let data_path = location.chunk_path(chunk_id);
        std::fs::write(&data_path, b"1234567890").unwrap();
        std::fs::write(with_suffix(&data_path, CHUNK_META_SUFFIX), b"{}").unwrap();

        location.remove_chunk_files(chunk_id, false);
        assert!(location.trash_chunk_path(chunk_id).exists());
        assert_eq!(location.trash_disk_space(), 12);

        // entry is younger than the TTL: nothing happens
        location.on_check_trash();
        assert_eq!(location.trash_disk_space(), 12);

        // backdate the entry past the TTL
        {
            let mut trash = location.trash.lock().unwrap();
            let (key, entry) = trash.entries.iter().next().map(|(k, v)| (*k, v.clone())).unwrap();
            trash.entries.remove(&key).unwrap();
            let old = SystemTime::now() - std::time::Duration::from_secs(5);
            trash.entries.insert((old, key.1), entry);
        }
        location.on_check_trash();
        assert_eq!(location.trash_disk_space(), 0);
        assert!(!location.trash_chunk_path(chunk_id).exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_pending_io_guard_accounting() {
        let dir = temp_dir("pending");
        let config = test_store_config(&dir);
        let location = Location::new_store("loc3", &config, panic_on_disable_hook());
        location.scan().await;

        let before = location.pending_io_size(IoDirection::Read, WorkloadCategory::Repair);
        {
            let _guard = location.increase_pending_io_size(
                IoDirection::Read,
                WorkloadCategory::Repair,
                1024,
            );
            assert_eq!(
                location.pending_io_size(IoDirection::Read, WorkloadCategory::Repair),
                before + 1024,
            );
            // batch workloads account separately
            assert_eq!(
                location.pending_io_size(IoDirection::Read, WorkloadCategory::Batch),
                0,
            );
        }
        assert_eq!(
            location.pending_io_size(IoDirection::Read, WorkloadCategory::Repair),
            before,
        );

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_disable_writes_lock_file_once() {
        let dir = temp_dir("disable");
        let config = test_store_config(&dir);
        let (hook, seen) = recording_hook();
        let location = Location::new_store("loc4", &config, hook);
        location.scan().await;
        assert!(location.is_enabled());

        location.disable(&format_err!("injected fault"));
        assert!(!location.is_enabled());
        assert!(seen.lock().unwrap().as_deref().unwrap().contains("injected fault"));

        let contents = std::fs::read_to_string(dir.join(DISABLED_LOCK_FILE_NAME)).unwrap();
        assert!(contents.contains("injected fault"));

        // second disable is a no-op
        location.disable(&format_err!("another fault"));
        let contents2 = std::fs::read_to_string(dir.join(DISABLED_LOCK_FILE_NAME)).unwrap();
        assert_eq!(contents, contents2);

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
