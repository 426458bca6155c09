//! Shared types for the chunk data node: identifiers, configuration,
//! chunk meta documents and error kinds. Everything here is plain data,
//! serializable with serde.

mod id;
pub use id::*;

mod error;
pub use error::*;

mod config;
pub use config::*;

mod chunk_meta;
pub use chunk_meta::*;

mod jobs;
pub use jobs::*;

mod node;
pub use node::*;
