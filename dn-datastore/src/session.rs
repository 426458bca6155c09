//! Write sessions.
//!
//! A session is the stateful write pipeline for one new chunk: blocks are
//! put in program order, optionally forwarded down a replication chain,
//! flushed, and committed by `finish` which registers the finished chunk.
//! At most one session exists per chunk id; idle sessions are cancelled by
//! a periodic sweep.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use async_trait::async_trait;
use bytes::Bytes;

use dn_api_types::{
    BlockId, ChunkDescriptor, ChunkId, ChunkMeta, ErrorKind, IoDirection, NodeDescriptor,
    ObjectType, SessionType,
};
use dn_tools::periodic::PeriodicTask;

use crate::block_store::BlockStore;
use crate::chunk::Chunk;
use crate::chunk_store::ChunkStore;
use crate::format::{with_suffix, BlobWriter, CHUNK_META_SUFFIX};
use crate::journal::JournalFile;
use crate::location::Location;

/// Client used to forward blocks to the next node of a write pipeline.
#[async_trait]
pub trait ReplicationClient: Send + Sync {
    async fn put_blocks(
        &self,
        target: &NodeDescriptor,
        chunk_id: ChunkId,
        first_block_index: u32,
        blocks: Vec<Bytes>,
    ) -> Result<(), Error>;
}

#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub session_type: SessionType,
    pub sync_on_close: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Open,
    Finishing,
    Closed,
    Cancelled,
}

enum WriterBody {
    Blob(BlobWriter),
    Journal(JournalFile),
}

struct SessionInner {
    state: SessionState,
    next_block_index: u32,
    window: BTreeMap<u32, Bytes>,
}

pub struct Session {
    chunk_id: ChunkId,
    options: SessionOptions,
    location: Arc<Location>,
    manager: Weak<SessionManager>,
    inner: Mutex<SessionInner>,
    writer: Arc<Mutex<Option<WriterBody>>>,
    last_ping: Mutex<Instant>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("chunk_id", &self.chunk_id)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Session {
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    pub fn session_type(&self) -> SessionType {
        self.options.session_type
    }

    pub fn ping(&self) {
        *self.last_ping.lock().unwrap() = Instant::now();
    }

    fn idle_for(&self) -> Duration {
        self.last_ping.lock().unwrap().elapsed()
    }

    fn manager(&self) -> Result<Arc<SessionManager>, Error> {
        self.manager
            .upgrade()
            .ok_or_else(|| format_err!("session manager is gone"))
    }

    /// Append `blocks` starting at `first_block_index`. Blocks must arrive
    /// in program order; the write happens on the location's write pool
    /// and the returned future resolves once it is on disk.
    pub async fn put_blocks(
        self: &Arc<Self>,
        first_block_index: u32,
        blocks: Vec<Bytes>,
        enable_caching: bool,
    ) -> Result<(), Error> {
        self.ping();
        if blocks.is_empty() {
            return Ok(());
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Open {
                bail!(
                    "session for chunk {} is {:?}, cannot put blocks",
                    self.chunk_id,
                    inner.state,
                );
            }
            if first_block_index != inner.next_block_index {
                bail!(
                    "out of order block put for chunk {}: expected index {}, got {}",
                    self.chunk_id,
                    inner.next_block_index,
                    first_block_index,
                );
            }
            for (offset, block) in blocks.iter().enumerate() {
                inner.window.insert(first_block_index + offset as u32, block.clone());
            }
            inner.next_block_index += blocks.len() as u32;
        }

        if enable_caching {
            let manager = self.manager()?;
            for (offset, block) in blocks.iter().enumerate() {
                manager.block_store.put_block(
                    BlockId::new(self.chunk_id, first_block_index + offset as u32),
                    block.clone(),
                    None,
                );
            }
        }

        let total_size: u64 = blocks.iter().map(|b| b.len() as u64).sum();
        let io_guard = self.location.increase_pending_io_size(
            IoDirection::Write,
            self.options.session_type.workload(),
            total_size as i64,
        );

        let writer = Arc::clone(&self.writer);
        let chunk_id = self.chunk_id;
        self.location
            .write_pool()
            .submit(move || {
                let _io_guard = io_guard;
                let mut writer = writer.lock().unwrap();
                match writer.as_mut() {
                    Some(WriterBody::Blob(blob)) => {
                        for block in &blocks {
                            blob.append_block(block)?;
                        }
                        Ok(())
                    }
                    Some(WriterBody::Journal(journal)) => journal.append_records(&blocks),
                    None => bail!("session writer for chunk {chunk_id} is closed"),
                }
            })
            .await
    }

    /// Forward already-buffered blocks to the next replication target.
    pub async fn send_blocks(
        self: &Arc<Self>,
        first_block_index: u32,
        block_count: u32,
        target: NodeDescriptor,
    ) -> Result<(), Error> {
        self.ping();

        let blocks = {
            let inner = self.inner.lock().unwrap();
            let mut blocks = Vec::with_capacity(block_count as usize);
            for index in first_block_index..first_block_index + block_count {
                match inner.window.get(&index) {
                    Some(block) => blocks.push(block.clone()),
                    None => bail!(
                        "block {}:{} is not in the session window",
                        self.chunk_id,
                        index,
                    ),
                }
            }
            blocks
        };

        let manager = self.manager()?;
        manager
            .replication_client
            .put_blocks(&target, self.chunk_id, first_block_index, blocks)
            .await
            .map_err(|err| {
                err.context(ErrorKind::PipelineFailed(target.address.clone()))
            })
    }

    /// Make everything up to `block_index` durable.
    pub async fn flush_blocks(self: &Arc<Self>, block_index: u32) -> Result<(), Error> {
        self.ping();

        {
            let inner = self.inner.lock().unwrap();
            if block_index >= inner.next_block_index {
                bail!(
                    "cannot flush chunk {} through block {}: only {} blocks were put",
                    self.chunk_id,
                    block_index,
                    inner.next_block_index,
                );
            }
        }

        let writer = Arc::clone(&self.writer);
        self.location
            .write_pool()
            .submit(move || {
                let mut writer = writer.lock().unwrap();
                match writer.as_mut() {
                    Some(WriterBody::Blob(blob)) => blob.flush(),
                    Some(WriterBody::Journal(journal)) => journal.flush(),
                    None => Ok(()),
                }
            })
            .await
    }

    /// Commit the session: seal the files, register the chunk, drop the
    /// session. `meta` carries the client-side misc counters and
    /// extensions; the block table comes from what was actually written.
    pub async fn finish(
        self: &Arc<Self>,
        meta: ChunkMeta,
        block_count: Option<u32>,
    ) -> Result<Arc<Chunk>, Error> {
        let manager = self.manager()?;

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != SessionState::Open {
                bail!(
                    "session for chunk {} is {:?}, cannot finish",
                    self.chunk_id,
                    inner.state,
                );
            }
            if let Some(expected) = block_count {
                if expected != inner.next_block_index {
                    bail!(
                        "block count mismatch for chunk {}: session has {}, request says {expected}",
                        self.chunk_id,
                        inner.next_block_index,
                    );
                }
            }
            inner.state = SessionState::Finishing;
            inner.window.clear();
        }

        let writer = Arc::clone(&self.writer);
        let chunk_id = self.chunk_id;
        let body = self
            .location
            .write_pool()
            .submit(move || {
                let mut writer = writer.lock().unwrap();
                match writer.take() {
                    Some(WriterBody::Blob(blob)) => {
                        let final_meta = blob.finish(meta)?;
                        Ok(FinishedBody::Blob(final_meta))
                    }
                    Some(WriterBody::Journal(mut journal)) => {
                        journal.flush()?;
                        Ok(FinishedBody::Journal(journal))
                    }
                    None => bail!("session writer for chunk {chunk_id} is closed"),
                }
            })
            .await?;

        let ctx = manager.store.context();
        let chunk = match body {
            FinishedBody::Blob(final_meta) => {
                let data_path = self.location.chunk_path(self.chunk_id);
                let disk_space = dn_tools::fs::file_size(&data_path)?
                    + dn_tools::fs::file_size(with_suffix(&data_path, CHUNK_META_SUFFIX))?;
                let descriptor = ChunkDescriptor {
                    id: self.chunk_id,
                    disk_space,
                    row_count: None,
                    sealed: None,
                };
                Chunk::new_blob(
                    Arc::clone(ctx),
                    Arc::clone(&self.location),
                    &descriptor,
                    Some(final_meta),
                )
            }
            FinishedBody::Journal(journal) => {
                let descriptor = ChunkDescriptor {
                    id: self.chunk_id,
                    disk_space: journal.data_size(),
                    row_count: Some(journal.row_count()),
                    sealed: Some(journal.is_sealed()),
                };
                Chunk::new_journal(
                    Arc::clone(ctx),
                    Arc::clone(&self.location),
                    &descriptor,
                    journal,
                )
            }
        };

        manager.store.register_new_chunk(Arc::clone(&chunk))?;

        self.inner.lock().unwrap().state = SessionState::Closed;
        manager.release_session(self.chunk_id);

        log::info!(
            "session finished (chunk: {}, disk space: {})",
            self.chunk_id,
            chunk.disk_space(),
        );
        Ok(chunk)
    }

    /// Abort the session and drop any partially written files.
    pub fn cancel(self: &Arc<Self>, reason: &Error) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.state, SessionState::Closed | SessionState::Cancelled) {
                return;
            }
            inner.state = SessionState::Cancelled;
            inner.window.clear();
        }

        log::info!("session cancelled (chunk: {}) - {reason:#}", self.chunk_id);

        let writer = Arc::clone(&self.writer);
        let location = Arc::clone(&self.location);
        let chunk_id = self.chunk_id;
        self.location.write_pool().spawn(Box::new(move || {
            match writer.lock().unwrap().take() {
                Some(WriterBody::Blob(blob)) => blob.abort(),
                Some(WriterBody::Journal(journal)) => {
                    drop(journal);
                    location.remove_chunk_files(chunk_id, true);
                }
                None => {}
            }
        }));

        if let Ok(manager) = self.manager() {
            manager.release_session(self.chunk_id);
        }
    }
}

enum FinishedBody {
    Blob(ChunkMeta),
    Journal(JournalFile),
}

pub struct SessionManager {
    sessions: RwLock<HashMap<ChunkId, Arc<Session>>>,
    store: Arc<ChunkStore>,
    block_store: Arc<BlockStore>,
    replication_client: Arc<dyn ReplicationClient>,
    session_timeout: Duration,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl SessionManager {
    pub fn new(
        store: Arc<ChunkStore>,
        block_store: Arc<BlockStore>,
        replication_client: Arc<dyn ReplicationClient>,
        session_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            block_store,
            replication_client,
            session_timeout,
            sweeper: Mutex::new(None),
        })
    }

    /// Start the idle-session sweep; call once at node startup.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let period = (self.session_timeout / 4).max(Duration::from_secs(1));
        let task = PeriodicTask::spawn("session-timeout", period, move || {
            let this = Arc::clone(&this);
            async move {
                this.sweep_expired_sessions();
            }
        });
        *self.sweeper.lock().unwrap() = Some(task);
    }

    pub fn start_session(
        self: &Arc<Self>,
        chunk_id: ChunkId,
        options: SessionOptions,
    ) -> Result<Arc<Session>, Error> {
        if self.store.find_chunk(chunk_id).is_some() {
            bail!(ErrorKind::ChunkAlreadyExists(chunk_id));
        }

        let object_type = chunk_id.object_type()?;
        let location = self.store.place_chunk(object_type)?;

        let mut sessions = self.sessions.write().unwrap();
        if sessions.contains_key(&chunk_id) {
            bail!(ErrorKind::SessionAlreadyExists(chunk_id));
        }

        let data_path = location.chunk_path(chunk_id);
        let writer = match object_type {
            ObjectType::Journal => WriterBody::Journal(JournalFile::create(&data_path)?),
            _ => WriterBody::Blob(BlobWriter::create(&data_path)?),
        };

        let session = Arc::new(Session {
            chunk_id,
            options,
            location: Arc::clone(&location),
            manager: Arc::downgrade(self),
            inner: Mutex::new(SessionInner {
                state: SessionState::Open,
                next_block_index: 0,
                window: BTreeMap::new(),
            }),
            writer: Arc::new(Mutex::new(Some(writer))),
            last_ping: Mutex::new(Instant::now()),
        });

        sessions.insert(chunk_id, Arc::clone(&session));
        location.update_session_count(1);

        log::info!(
            "session started (chunk: {chunk_id}, type: {:?}, location: {})",
            options.session_type,
            location.id(),
        );
        Ok(session)
    }

    pub fn find_session(&self, chunk_id: ChunkId) -> Option<Arc<Session>> {
        self.sessions.read().unwrap().get(&chunk_id).cloned()
    }

    pub fn get_session(&self, chunk_id: ChunkId) -> Result<Arc<Session>, Error> {
        self.find_session(chunk_id).ok_or_else(|| {
            anyhow::Error::new(ErrorKind::NoSuchChunk(chunk_id))
                .context(format!("no active session for chunk {chunk_id}"))
        })
    }

    pub fn session_count(&self, session_type: SessionType) -> usize {
        self.sessions
            .read()
            .unwrap()
            .values()
            .filter(|session| session.session_type() == session_type)
            .count()
    }

    fn release_session(&self, chunk_id: ChunkId) {
        if let Some(session) = self.sessions.write().unwrap().remove(&chunk_id) {
            session.location.update_session_count(-1);
        }
    }

    fn sweep_expired_sessions(self: &Arc<Self>) {
        let expired: Vec<Arc<Session>> = {
            let sessions = self.sessions.read().unwrap();
            sessions
                .values()
                .filter(|session| session.idle_for() > self.session_timeout)
                .cloned()
                .collect()
        };

        for session in expired {
            session.cancel(&format_err!(
                "session timed out after {:?} without a keepalive",
                self.session_timeout,
            ));
        }
    }
}
