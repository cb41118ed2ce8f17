//! Single-threaded I/O runtime owned by a worker

use crate::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

/// Runtime manager for the blocking I/O of a worker.
///
/// Every worker runs one control loop on one thread. Network collectives and
/// checkpoint storage are async, so they are driven to completion on a
/// current-thread Tokio runtime through [`RuntimeManager::block_on`]; no
/// thread pool is ever started.
pub struct RuntimeManager {
    runtime: Runtime,
}

impl RuntimeManager {
    /// Create a new current-thread runtime
    pub fn new() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Internal {
                message: format!("Failed to build Tokio runtime: {}", e),
            })?;

        debug!("Current-thread runtime created");
        Ok(Self { runtime })
    }

    /// Create a shareable runtime handle
    pub fn shared() -> Result<RuntimeHandle> {
        Ok(Arc::new(Self::new()?))
    }

    /// Get a reference to the Tokio runtime
    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Block on a future until completion
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.runtime.block_on(future)
    }
}

/// Shared handle to a worker's runtime
pub type RuntimeHandle = Arc<RuntimeManager>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_on() {
        let manager = RuntimeManager::new().unwrap();
        let result = manager.block_on(async { 40 + 2 });
        assert_eq!(result, 42);
    }

    #[test]
    fn test_shared_handle_drives_io() {
        let handle = RuntimeManager::shared().unwrap();
        let dir = std::env::temp_dir();
        let exists = handle.block_on(async { tokio::fs::metadata(&dir).await.is_ok() });
        assert!(exists);
    }
}
