//! Chunk handles and the read-lock / removal state machine.
//!
//! A chunk may be read-locked by any number of concurrent readers. Once a
//! removal is scheduled no new read lock can be acquired; the actual file
//! removal starts when the last read lock is released and the returned
//! future resolves strictly after the background remove finished.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Error};
use bytes::Bytes;
use tokio::sync::oneshot;

use dn_api_types::{
    ChunkDescriptor, ChunkId, ChunkMeta, ErrorKind, IoDirection, MiscExt, WorkloadCategory,
};
use dn_tools::broadcast_future::BroadcastFuture;
use dn_tools::memory_tracker::{MemoryCategory, MemoryTracker};

use crate::block_store::PendingReadTracker;
use crate::journal::JournalFile;
use crate::location::Location;
use crate::reader_cache::BlobReaderCache;

/// Shared collaborators handed to every chunk.
pub struct ChunkContext {
    pub memory_tracker: Arc<MemoryTracker>,
    pub reader_cache: Arc<BlobReaderCache>,
    pub pending_read_tracker: Arc<PendingReadTracker>,
    pub max_blocks_per_read: u32,
    pub max_bytes_per_read: u64,
}

enum ChunkBody {
    Blob,
    Journal(Mutex<JournalFile>),
}

#[derive(Default)]
struct LockState {
    read_lock_count: u32,
    removing: bool,
    removal: Option<BroadcastFuture<()>>,
    remove_trigger: Option<oneshot::Sender<Result<(), Error>>>,
}

pub struct Chunk {
    ctx: Arc<ChunkContext>,
    id: ChunkId,
    location: Arc<Location>,
    disk_space: AtomicU64,
    version: AtomicU64,
    lock_state: Mutex<LockState>,
    cached_meta: Mutex<Option<Arc<ChunkMeta>>>,
    body: ChunkBody,
}

impl Chunk {
    pub fn new_blob(
        ctx: Arc<ChunkContext>,
        location: Arc<Location>,
        descriptor: &ChunkDescriptor,
        meta: Option<ChunkMeta>,
    ) -> Arc<Self> {
        let chunk = Arc::new(Self {
            ctx,
            id: descriptor.id,
            location,
            disk_space: AtomicU64::new(descriptor.disk_space),
            version: AtomicU64::new(0),
            lock_state: Mutex::new(LockState::default()),
            cached_meta: Mutex::new(None),
            body: ChunkBody::Blob,
        });
        if let Some(meta) = meta {
            chunk.initialize_cached_meta(meta);
        }
        chunk
    }

    pub fn new_journal(
        ctx: Arc<ChunkContext>,
        location: Arc<Location>,
        descriptor: &ChunkDescriptor,
        journal: JournalFile,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            id: descriptor.id,
            location,
            disk_space: AtomicU64::new(descriptor.disk_space),
            version: AtomicU64::new(0),
            lock_state: Mutex::new(LockState::default()),
            cached_meta: Mutex::new(None),
            body: ChunkBody::Journal(Mutex::new(journal)),
        })
    }

    pub fn id(&self) -> ChunkId {
        self.id
    }

    pub fn location(&self) -> &Arc<Location> {
        &self.location
    }

    pub fn data_path(&self) -> PathBuf {
        self.location.chunk_path(self.id)
    }

    pub fn disk_space(&self) -> u64 {
        self.disk_space.load(Ordering::SeqCst)
    }

    /// Monotone counter bumped whenever the chunk's meta mutates; the
    /// master connector uses it to prune reported heartbeat deltas.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    pub fn increment_version(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_journal(&self) -> bool {
        matches!(self.body, ChunkBody::Journal(_))
    }

    /// An active chunk is still being written to; journals stay active
    /// until sealed, blobs are complete by construction.
    pub fn is_active(&self) -> bool {
        match &self.body {
            ChunkBody::Blob => false,
            ChunkBody::Journal(journal) => !journal.lock().unwrap().is_sealed(),
        }
    }

    pub fn is_sealed(&self) -> bool {
        match &self.body {
            ChunkBody::Blob => true,
            ChunkBody::Journal(journal) => journal.lock().unwrap().is_sealed(),
        }
    }

    pub fn journal_row_count(&self) -> Option<u64> {
        match &self.body {
            ChunkBody::Blob => None,
            ChunkBody::Journal(journal) => Some(journal.lock().unwrap().row_count()),
        }
    }

    // -- read locks and removal ---------------------------------------------

    pub fn try_acquire_read_lock(self: &Arc<Self>) -> bool {
        let lock_count;
        {
            let mut state = self.lock_state.lock().unwrap();
            if state.removal.is_some() {
                log::debug!(
                    "chunk read lock cannot be acquired since removal is already pending (chunk: {})",
                    self.id,
                );
                return false;
            }
            state.read_lock_count += 1;
            lock_count = state.read_lock_count;
        }

        log::debug!(
            "chunk read lock acquired (chunk: {}, locks: {lock_count})",
            self.id,
        );
        true
    }

    pub fn release_read_lock(self: &Arc<Self>) {
        let start_remove;
        let lock_count;
        {
            let mut state = self.lock_state.lock().unwrap();
            assert!(state.read_lock_count > 0, "read lock underflow");
            state.read_lock_count -= 1;
            lock_count = state.read_lock_count;
            start_remove =
                state.read_lock_count == 0 && !state.removing && state.removal.is_some();
            if start_remove {
                state.removing = true;
            }
        }

        log::debug!(
            "chunk read lock released (chunk: {}, locks: {lock_count})",
            self.id,
        );

        if start_remove {
            self.start_async_remove();
        }
    }

    pub fn is_read_lock_acquired(&self) -> bool {
        self.lock_state.lock().unwrap().read_lock_count > 0
    }

    pub fn is_remove_scheduled(&self) -> bool {
        self.lock_state.lock().unwrap().removal.is_some()
    }

    /// Schedule background removal. Idempotent: all callers share one
    /// future which resolves after the files are gone.
    pub fn schedule_remove(
        self: &Arc<Self>,
    ) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        log::info!("chunk remove scheduled (chunk: {})", self.id);

        let start_remove;
        let listener;
        {
            let mut state = self.lock_state.lock().unwrap();
            if let Some(removal) = &state.removal {
                return removal.listen();
            }

            let (removal, trigger) = BroadcastFuture::new_oneshot();
            listener = removal.listen();
            state.removal = Some(removal);
            state.remove_trigger = Some(trigger);
            start_remove = state.read_lock_count == 0 && !state.removing;
            if start_remove {
                state.removing = true;
            }
        }

        if start_remove {
            self.start_async_remove();
        }

        listener
    }

    fn start_async_remove(self: &Arc<Self>) {
        let this = Arc::clone(self);
        self.location.write_pool().spawn(Box::new(move || {
            this.ctx.reader_cache.evict_reader(this.id);
            this.release_cached_meta();
            this.location.remove_chunk_files(this.id, false);

            let trigger = this.lock_state.lock().unwrap().remove_trigger.take();
            if let Some(trigger) = trigger {
                let _ = trigger.send(Ok(()));
            }
        }));
    }

    // -- meta ---------------------------------------------------------------

    fn initialize_cached_meta(&self, meta: ChunkMeta) {
        let mut cached = self.cached_meta.lock().unwrap();
        // readers may race here; the first meta wins
        if cached.is_some() {
            return;
        }
        self.ctx
            .memory_tracker
            .acquire(MemoryCategory::ChunkMeta, meta.memory_usage() as u64);
        *cached = Some(Arc::new(meta));
    }

    fn release_cached_meta(&self) {
        let mut cached = self.cached_meta.lock().unwrap();
        if let Some(meta) = cached.take() {
            self.ctx
                .memory_tracker
                .release(MemoryCategory::ChunkMeta, meta.memory_usage() as u64);
        }
    }

    pub fn cached_meta(&self) -> Option<Arc<ChunkMeta>> {
        self.cached_meta.lock().unwrap().clone()
    }

    fn filtered_meta(meta: &Arc<ChunkMeta>, extension_tags: Option<&[u32]>) -> Arc<ChunkMeta> {
        match extension_tags {
            Some(tags) => Arc::new(meta.filter_extensions(tags)),
            None => Arc::clone(meta),
        }
    }

    /// Chunk meta, loading and caching it on first demand. The load runs
    /// on the location's dedicated meta thread at the given priority.
    pub fn get_meta(
        self: &Arc<Self>,
        priority: i64,
        extension_tags: Option<Vec<u32>>,
    ) -> impl Future<Output = Result<Arc<ChunkMeta>, Error>> + Send + 'static {
        let this = Arc::clone(self);
        async move {
            if let Some(meta) = this.cached_meta() {
                log::debug!("meta cache hit (chunk: {})", this.id);
                return Ok(Self::filtered_meta(&meta, extension_tags.as_deref()));
            }

            if let ChunkBody::Journal(journal) = &this.body {
                // journal meta is synthesized from the live journal state
                let journal = journal.lock().unwrap();
                let meta = ChunkMeta {
                    blocks: Vec::new(),
                    misc: MiscExt {
                        row_count: journal.row_count(),
                        sealed: journal.is_sealed(),
                        uncompressed_data_size: journal.data_size(),
                        ..Default::default()
                    },
                    extensions: Default::default(),
                };
                return Ok(Arc::new(meta));
            }

            log::debug!("meta cache miss (chunk: {})", this.id);

            let guard = ChunkReadGuard::try_acquire(&this).ok_or_else(|| {
                anyhow::Error::new(ErrorKind::NoSuchChunk(this.id)).context(format!(
                    "cannot read meta of chunk {}: chunk is scheduled for removal",
                    this.id,
                ))
            })?;

            let loader = Arc::clone(&this);
            let data_path = this.data_path();
            this.location
                .meta_pool()
                .submit(priority, move || {
                    let _guard = guard;
                    let reader = loader
                        .ctx
                        .reader_cache
                        .get_reader(loader.id, &data_path)?;
                    loader.initialize_cached_meta(reader.meta().as_ref().clone());
                    Ok(())
                })
                .await?;

            let meta = this.cached_meta().expect("meta was just initialized");
            Ok(Self::filtered_meta(&meta, extension_tags.as_deref()))
        }
    }

    // -- block reads --------------------------------------------------------

    /// Read a run of blocks on the location's prioritized read pool.
    ///
    /// The range is clamped by `max_blocks_per_read` / `max_bytes_per_read`
    /// and the read is accounted against both the node-wide pending read
    /// size and the location's pending-I/O counters. An unrecoverable disk
    /// error disables the location.
    pub fn read_blocks(
        self: &Arc<Self>,
        first_block_index: u32,
        block_count: u32,
        priority: i64,
        workload: WorkloadCategory,
    ) -> impl Future<Output = Result<Vec<Bytes>, Error>> + Send + 'static {
        let this = Arc::clone(self);
        async move {
            match &this.body {
                ChunkBody::Blob => {
                    let reader = Arc::clone(&this);
                    this.location
                        .read_pool()
                        .submit(priority, move || {
                            reader.do_read_blob_blocks(first_block_index, block_count, workload)
                        })
                        .await
                }
                ChunkBody::Journal(_) => {
                    let reader = Arc::clone(&this);
                    this.location
                        .read_pool()
                        .submit(priority, move || {
                            reader.do_read_journal_blocks(first_block_index, block_count)
                        })
                        .await
                }
            }
        }
    }

    fn do_read_blob_blocks(
        self: &Arc<Self>,
        first_block_index: u32,
        block_count: u32,
        workload: WorkloadCategory,
    ) -> Result<Vec<Bytes>, Error> {
        let data_path = self.data_path();
        let reader = match self.ctx.reader_cache.get_reader(self.id, &data_path) {
            Ok(reader) => reader,
            Err(err) => {
                let err = err.context(ErrorKind::IoError(format!(
                    "error opening blob chunk {}",
                    self.id
                )));
                self.location.disable(&err);
                return Err(err);
            }
        };

        if self.cached_meta().is_none() {
            self.initialize_cached_meta(reader.meta().as_ref().clone());
        }

        let (first, count, pending_size) = self.adjust_read_range(first_block_index, block_count);
        if count == 0 {
            return Ok(Vec::new());
        }
        let _pending_read_guard = self.ctx.pending_read_tracker.increase(pending_size as i64);
        let _pending_io_guard = self.location.increase_pending_io_size(
            IoDirection::Read,
            workload,
            pending_size as i64,
        );

        log::debug!(
            "started reading blob chunk blocks (blocks: {}:{}-{}, location: {})",
            self.id,
            first,
            first + count.max(1) - 1,
            self.location.id(),
        );

        let blocks = match reader.read_blocks(first, count) {
            Ok(blocks) => blocks,
            Err(err) => {
                let err = err.context(ErrorKind::IoError(format!(
                    "error reading blob chunk {}",
                    self.id
                )));
                self.location.disable(&err);
                return Err(err);
            }
        };

        log::debug!(
            "finished reading blob chunk blocks (blocks: {}:{}-{}, location: {})",
            self.id,
            first,
            first + count.max(1) - 1,
            self.location.id(),
        );

        Ok(blocks)
    }

    /// Clamp `(first, count)` against the block table and the configured
    /// read limits; also returns the number of payload bytes covered.
    fn adjust_read_range(&self, first_block_index: u32, block_count: u32) -> (u32, u32, u64) {
        let meta = self.cached_meta().expect("blob meta must be cached here");
        let total_blocks = meta.block_count();

        let mut count = block_count.min(self.ctx.max_blocks_per_read);
        let mut data_size = 0u64;
        let mut index = first_block_index;
        while index < first_block_index + count
            && index < total_blocks
            && data_size <= self.ctx.max_bytes_per_read
        {
            data_size += meta.blocks[index as usize].size as u64;
            index += 1;
        }
        count = index.saturating_sub(first_block_index);
        (first_block_index, count, data_size)
    }

    fn do_read_journal_blocks(
        self: &Arc<Self>,
        first_block_index: u32,
        block_count: u32,
    ) -> Result<Vec<Bytes>, Error> {
        let ChunkBody::Journal(journal) = &self.body else {
            unreachable!("journal read on a blob chunk");
        };
        let journal = journal.lock().unwrap();
        let available = journal.row_count();
        if first_block_index as u64 >= available {
            return Ok(Vec::new());
        }
        let count = (block_count as u64).min(available - first_block_index as u64);
        journal.read_records(first_block_index as u64, count)
    }

    // -- journal mutation ---------------------------------------------------

    pub fn append_journal_records(
        self: &Arc<Self>,
        records: Vec<Bytes>,
    ) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        let this = Arc::clone(self);
        async move {
            let writer = Arc::clone(&this);
            this.location
                .write_pool()
                .submit(move || {
                    let ChunkBody::Journal(journal) = &writer.body else {
                        bail!("chunk {} is not a journal", writer.id);
                    };
                    let mut journal = journal.lock().unwrap();
                    journal.append_records(&records)?;
                    journal.flush()?;
                    writer
                        .disk_space
                        .store(journal.data_size(), Ordering::SeqCst);
                    Ok(())
                })
                .await?;
            this.increment_version();
            Ok(())
        }
    }

    /// Seal the journal; the chunk stops being active.
    pub fn seal(self: &Arc<Self>) -> impl Future<Output = Result<(), Error>> + Send + 'static {
        let this = Arc::clone(self);
        async move {
            let writer = Arc::clone(&this);
            this.location
                .write_pool()
                .submit(move || {
                    let ChunkBody::Journal(journal) = &writer.body else {
                        bail!("cannot seal chunk {}: not a journal", writer.id);
                    };
                    journal.lock().unwrap().seal()
                })
                .await?;
            this.increment_version();
            log::info!("journal chunk sealed (chunk: {})", this.id);
            Ok(())
        }
    }
}

impl Drop for Chunk {
    fn drop(&mut self) {
        let mut cached = self.cached_meta.lock().unwrap();
        if let Some(meta) = cached.take() {
            self.ctx
                .memory_tracker
                .release(MemoryCategory::ChunkMeta, meta.memory_usage() as u64);
        }
    }
}

/// Scoped read lock; releasing may kick off a pending removal.
pub struct ChunkReadGuard {
    chunk: Option<Arc<Chunk>>,
}

impl ChunkReadGuard {
    pub fn try_acquire(chunk: &Arc<Chunk>) -> Option<Self> {
        if chunk.try_acquire_read_lock() {
            Some(Self {
                chunk: Some(Arc::clone(chunk)),
            })
        } else {
            None
        }
    }
}

impl Drop for ChunkReadGuard {
    fn drop(&mut self) {
        if let Some(chunk) = self.chunk.take() {
            chunk.release_read_lock();
        }
    }
}
