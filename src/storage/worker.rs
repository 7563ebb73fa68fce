//! Cleanup Worker
//!
//! Background worker that periodically purges expired tokens from any
//! backend. The in-memory backend owns its own task; external backends are
//! driven by this worker (or by the `--cleanup` one-shot of the binary).

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use super::TokenStorage;
use super::error::StorageError;
use crate::cancel::CancelSignal;

/// Configuration for the cleanup worker
#[derive(Debug, Clone)]
pub struct CleanupWorkerConfig {
    /// How often to purge expired tokens
    pub interval: Duration,
}

impl Default for CleanupWorkerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

pub struct CleanupWorker {
    storage: Arc<dyn TokenStorage>,
    config: CleanupWorkerConfig,
}

impl CleanupWorker {
    pub fn new(storage: Arc<dyn TokenStorage>, config: CleanupWorkerConfig) -> Self {
        Self { storage, config }
    }

    pub fn with_defaults(storage: Arc<dyn TokenStorage>) -> Self {
        Self::new(storage, CleanupWorkerConfig::default())
    }

    /// Run until `cancel` fires. Failed passes are logged and retried next tick.
    pub async fn run(&self, cancel: CancelSignal) {
        info!(
            backend = self.storage.backend_name(),
            interval_secs = self.config.interval.as_secs(),
            "Starting cleanup worker"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            if let Err(e) = self.run_once().await {
                error!(error = %e, code = e.code(), "Cleanup pass failed");
            }
        }

        info!(backend = self.storage.backend_name(), "Cleanup worker stopped");
    }

    /// Run a single purge pass
    pub async fn run_once(&self) -> Result<u64, StorageError> {
        let removed = self.storage.cleanup_expired().await?;
        if removed > 0 {
            info!(
                backend = self.storage.backend_name(),
                removed, "Purged expired tokens"
            );
        } else {
            debug!(backend = self.storage.backend_name(), "No expired tokens");
        }
        Ok(removed)
    }
}
