use crate::{BlockId, ChunkId, JobId};

/// Error kinds surfaced at data node interfaces.
///
/// Errors are passed around as `anyhow::Error`; fallible operations that
/// need to signal one of these kinds attach it as the error source so that
/// callers can recover it with [`error_kind`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    #[error("I/O error: {0}")]
    IoError(String),

    #[error("no such chunk {0}")]
    NoSuchChunk(ChunkId),

    #[error("no such block {0}")]
    NoSuchBlock(BlockId),

    #[error("session for chunk {0} already exists")]
    SessionAlreadyExists(ChunkId),

    #[error("chunk {0} already exists")]
    ChunkAlreadyExists(ChunkId),

    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("write pipeline to {0} failed")]
    PipelineFailed(String),

    #[error("job {0} resource overdraft")]
    ResourceOverdraft(JobId),

    #[error("node resources overcommitted")]
    NodeResourceOvercommit,

    #[error("job {0} timed out in the waiting state")]
    WaitingJobTimeout(JobId),

    #[error("incarnation mismatch: expected {expected}, got {actual}")]
    IncarnationMismatch { expected: u64, actual: u64 },
}

impl ErrorKind {
    /// Whether a master RPC failing with this kind may simply be retried.
    /// Anything else forces the connector to re-register.
    pub fn is_retriable(&self) -> bool {
        matches!(self, ErrorKind::Unavailable(_) | ErrorKind::IoError(_))
    }
}

/// Extract the [`ErrorKind`] from an error chain, if any. Kinds may sit at
/// the root of the chain or be attached as context.
pub fn error_kind(err: &anyhow::Error) -> Option<&ErrorKind> {
    err.downcast_ref::<ErrorKind>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref()))
}
