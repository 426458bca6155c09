//! Low level chunk storage for the data node.
//!
//! A [`location::Location`] owns one storage mount point with its thread
//! pools, trash directory and health probe. Chunks living there are
//! represented by [`chunk::Chunk`] handles registered in the
//! [`chunk_store::ChunkStore`]. Reads flow through the
//! [`block_store::BlockStore`] cache, writes through
//! [`session::SessionManager`] sessions.

pub mod block_store;
pub mod chunk;
pub mod chunk_store;
pub mod disk_checker;
pub mod format;
pub mod io_pool;
pub mod journal;
pub mod location;
pub mod peer_table;
pub mod reader_cache;
pub mod session;

pub use block_store::BlockStore;
pub use chunk::{Chunk, ChunkReadGuard};
pub use chunk_store::{ChunkEvent, ChunkStore};
pub use location::Location;
pub use session::SessionManager;
