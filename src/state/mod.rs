//! Persistent checkpoint state.
//!
//! SQLite backed record of every listed asset and its download status, plus
//! a per-album scan offset. The producer writes here and the download
//! scheduler drains from here, so an interrupted backlog survives restarts.

pub mod db;
pub mod error;
pub mod schema;
pub mod types;

pub use db::{CheckpointStore, SqliteCheckpointStore, DEFAULT_OFFSET_TTL};
pub use error::StateError;
