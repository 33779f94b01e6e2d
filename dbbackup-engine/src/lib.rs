//! Database backup engine library
//!
//! Orchestrates PostgreSQL and MySQL client tools into streaming backup and
//! restore pipelines, and manages incremental archives, WAL archiving and
//! point-in-time recovery configuration.

pub mod adapter;
pub mod archive;
pub mod audit;
pub mod backup;
pub mod checksum;
pub mod cluster;
pub mod compress;
pub mod config;
pub mod crypto;
pub mod diskspace;
pub mod executor;
pub mod fs;
pub mod incremental;
pub mod metadata;
pub mod pitr;
pub mod progress;
pub mod ratelimit;
pub mod retention;
pub mod runtime;
pub mod state;
pub mod utils;
pub mod verify;
pub mod wal;

#[cfg(all(test, unix))]
pub(crate) mod testutil;

// Re-export commonly used types
pub use config::Config;
pub use state::EngineState;
pub use utils::errors::{EngineError, Result};
