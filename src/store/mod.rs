//! Persistence layer: ingestion dedup, run checkpoints, and run history.

pub mod libsql_backend;
pub mod memory;
mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::InMemoryStore;
pub use traits::{Checkpoint, CheckpointStore, DedupStore, RunHistory};
