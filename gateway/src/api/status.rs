//! `/api/status`, `/api/queue`, `/api/providers`, `/api/health`.

use axum::extract::State;
use axum::response::Json;
use gateway_core::model::{BackendKind, ProviderHealth, ProviderStatus, QueueStats};
use gateway_core::storage::Storage;
use serde::Serialize;

use crate::errors::Result;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct GatewayBlock {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub queue_depth: u64,
    pub processing_count: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub gateway: GatewayBlock,
    pub providers: Vec<ProviderStatus>,
}

/// `GET /api/status`: a single combined snapshot of gateway health and
/// every configured provider's standing — enabled or not.
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>> {
    let stats = state.engine.queue.stats().await;
    let providers = provider_statuses(&state).await?;

    Ok(Json(StatusResponse {
        gateway: GatewayBlock {
            version: env!("CARGO_PKG_VERSION"),
            uptime_seconds: state.uptime_seconds(),
            queue_depth: stats.queue_depth,
            processing_count: stats.processing_count,
        },
        providers,
    }))
}

/// `GET /api/queue`: queue depth and in-flight count, broken out by
/// provider.
pub async fn queue(State(state): State<AppState>) -> Json<QueueStats> {
    let stats = state.engine.queue.stats().await;
    Json(QueueStats { queue_depth: stats.queue_depth, processing_count: stats.processing_count, by_provider: stats.by_provider })
}

/// `GET /api/providers`: every configured provider, including disabled ones
/// the health monitor never probes (they have no store row, so a synthetic
/// `unknown` entry is synthesized from configuration instead).
pub async fn providers(State(state): State<AppState>) -> Result<Json<Vec<ProviderStatus>>> {
    Ok(Json(provider_statuses(&state).await?))
}

async fn provider_statuses(state: &AppState) -> Result<Vec<ProviderStatus>> {
    let known = state.engine.storage.list_provider_statuses().await?;
    let mut by_name: std::collections::HashMap<String, ProviderStatus> = known.into_iter().map(|s| (s.name.clone(), s)).collect();

    let mut out = Vec::with_capacity(state.engine.config().providers.len());
    for (name, cfg) in &state.engine.config().providers {
        if let Some(existing) = by_name.remove(name) {
            out.push(existing);
            continue;
        }
        out.push(ProviderStatus {
            name: name.clone(),
            backend_kind: match &cfg.backend {
                gateway_core::config::BackendConfig::Http(_) => BackendKind::Http,
                gateway_core::config::BackendConfig::Cli(c) if c.interactive => BackendKind::CliInteractive,
                gateway_core::config::BackendConfig::Cli(_) => BackendKind::Cli,
            },
            status: ProviderHealth::Unknown,
            queue_depth: 0,
            avg_latency_ms: 0.0,
            success_rate: 0.0,
            last_check: None,
            enabled: cfg.enabled,
            priority: cfg.priority,
            rate_limit_rpm: cfg.rate_limit_rpm,
            timeout_s: cfg.timeout_s,
        });
    }
    out.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(out)
}

/// `GET /api/health`: a cheap liveness probe for load balancers. Does not
/// touch the store or any backend.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}
