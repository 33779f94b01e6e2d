//! Cancellation scopes and process-level signal handling.

pub mod scope;
pub mod shutdown;

pub use scope::{CancelScope, Interruption};
pub use shutdown::ShutdownCoordinator;

use crate::utils::errors::{EngineError, Result};

/// Run filesystem or codec work on the blocking pool
pub async fn run_blocking<F, T>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| EngineError::Io(std::io::Error::other(e)))?
}
