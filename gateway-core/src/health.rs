//! Provider Health Monitor (§4.D): a periodic liveness probe per backend.
//!
//! Each provider is probed independently so a slow probe for one provider
//! never delays another's, or the dispatch loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::backend::Backend;
use crate::model::{BackendKind, ProviderHealth, ProviderStatus};
use crate::queue::RequestQueue;
use crate::storage::Storage;

/// Consecutive-failure window used to classify `degraded` (success rate
/// below half) vs `unavailable` (probe threw or returned false outright).
const ROLLING_WINDOW: usize = 10;

struct ProviderState {
    backend: Arc<dyn Backend>,
    backend_kind: BackendKind,
    enabled: bool,
    priority: i32,
    rate_limit_rpm: Option<u32>,
    timeout_s: u64,
    recent: Vec<bool>,
}

/// Periodic task driving §4.D. Owns no mutable state shared with the
/// dispatch loop other than the store row each provider writes to.
pub struct HealthMonitor<S: Storage> {
    storage: Arc<S>,
    providers: Vec<(String, ProviderState)>,
    interval: Duration,
}

impl<S: Storage> HealthMonitor<S> {
    pub fn new(storage: Arc<S>, backends: &[(String, Arc<dyn Backend>)], provider_meta: &HashMap<String, crate::config::ProviderConfig>, interval: Duration) -> Self {
        let providers = backends
            .iter()
            .map(|(name, backend)| {
                let meta = provider_meta.get(name);
                let state = ProviderState {
                    backend: backend.clone(),
                    backend_kind: backend.kind(),
                    enabled: meta.map(|m| m.enabled).unwrap_or(true),
                    priority: meta.map(|m| m.priority).unwrap_or(50),
                    rate_limit_rpm: meta.and_then(|m| m.rate_limit_rpm),
                    timeout_s: meta.map(|m| m.timeout_s).unwrap_or(300),
                    recent: Vec::with_capacity(ROLLING_WINDOW),
                };
                (name.clone(), state)
            })
            .collect();
        Self { storage, providers, interval }
    }

    /// Runs until `cancel` fires. Each tick probes every provider
    /// concurrently so one slow backend cannot delay another's update.
    pub async fn run(mut self, queue: Arc<RequestQueue<S>>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("health monitor shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick(&queue).await;
                }
            }
        }
    }

    async fn tick(&mut self, queue: &Arc<RequestQueue<S>>) {
        let stats = queue.stats().await;
        let checks = futures::future::join_all(self.providers.iter().map(|(name, state)| {
            let backend = state.backend.clone();
            let name = name.clone();
            async move {
                let ok = backend.health_check().await;
                (name, ok)
            }
        }))
        .await;

        let results: HashMap<String, bool> = checks.into_iter().collect();

        for (name, state) in self.providers.iter_mut() {
            let ok = results.get(name).copied().unwrap_or(false);
            if state.recent.len() == ROLLING_WINDOW {
                state.recent.remove(0);
            }
            state.recent.push(ok);

            let success_rate = if state.recent.is_empty() {
                1.0
            } else {
                state.recent.iter().filter(|x| **x).count() as f64 / state.recent.len() as f64
            };

            let status = if !ok {
                ProviderHealth::Unavailable
            } else if success_rate < 0.5 {
                ProviderHealth::Degraded
            } else {
                ProviderHealth::Healthy
            };

            let queue_depth = stats.by_provider.get(name).copied().unwrap_or(0);
            let avg_latency_ms = match self.storage.get_provider_metrics(name, 1).await {
                Ok(summary) => summary.avg_latency_ms,
                Err(_) => 0.0,
            };

            let row = ProviderStatus {
                name: name.clone(),
                backend_kind: state.backend_kind,
                status,
                queue_depth,
                avg_latency_ms,
                success_rate,
                last_check: Some(Utc::now()),
                enabled: state.enabled,
                priority: state.priority,
                rate_limit_rpm: state.rate_limit_rpm,
                timeout_s: state.timeout_s,
            };

            if let Err(e) = self.storage.update_provider_status(&row).await {
                tracing::warn!(provider = %name, error = %e, "failed to persist provider health status");
            }
        }
    }
}
