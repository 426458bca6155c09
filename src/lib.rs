//! Chunk data node: the per-node execution substrate of the distributed
//! chunk storage.
//!
//! The storage primitives live in the member crates (`dn-datastore` for
//! locations, chunks, block store and sessions; `dn-table` for the
//! versioned reader core); this crate binds them together with the
//! request surface, the job controller and the master connector.

pub mod jobs;
pub mod master;
pub mod node;
pub mod service;
pub mod table_access;

pub use node::{DataNode, NodeEnvironment};
