//! Cleanup Loop (§4.H): periodic eviction of expired requests, metrics, and
//! discussions.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::storage::Storage;

/// TTLs (in hours) for each record family the cleanup loop evicts.
#[derive(Debug, Clone, Copy)]
pub struct CleanupConfig {
    pub request_ttl_hours: u64,
    pub metrics_ttl_hours: u64,
    pub discussions_ttl_hours: u64,
    pub interval: Duration,
}

/// Periodic task that calls each of the store's three cleanup operations in
/// turn. Runs independently of the dispatch workers; never holds a worker
/// slot.
pub struct CleanupLoop<S: Storage> {
    storage: Arc<S>,
    config: CleanupConfig,
}

impl<S: Storage> CleanupLoop<S> {
    pub fn new(storage: Arc<S>, config: CleanupConfig) -> Self {
        Self { storage, config }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("cleanup loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.sweep().await;
                }
            }
        }
    }

    #[tracing::instrument(skip(self))]
    async fn sweep(&self) {
        match self.storage.cleanup_old_requests(self.config.request_ttl_hours as i64).await {
            Ok(n) if n > 0 => tracing::info!(deleted = n, "evicted expired requests"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "request cleanup failed"),
        }
        match self.storage.cleanup_old_metrics(self.config.metrics_ttl_hours as i64).await {
            Ok(n) if n > 0 => tracing::info!(deleted = n, "evicted expired metrics"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "metrics cleanup failed"),
        }
        match self.storage.cleanup_old_discussions(self.config.discussions_ttl_hours as i64).await {
            Ok(n) if n > 0 => tracing::info!(deleted = n, "evicted expired discussions"),
            Ok(_) => {}
            Err(e) => tracing::warn!(error = %e, "discussion cleanup failed"),
        }
    }
}
