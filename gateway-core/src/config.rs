//! Engine-level configuration: provider registration and queue/loop tuning.
//!
//! The owning binary's configuration layer (file + environment, validated
//! via `figment`) builds these types; this crate only describes their
//! shape and defaults so it stays independent of any config-loading crate.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::model::BackendKind;

/// HTTP-backend-specific provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpProviderConfig {
    pub endpoint: String,
    pub auth_header: Option<String>,
    pub model: Option<String>,
}

/// CLI-backend-specific provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliProviderConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// When true, a single long-lived child process is kept per backend
    /// instead of spawning one process per call.
    #[serde(default)]
    pub interactive: bool,
}

/// The backend-specific half of a provider's configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendConfig {
    Http(HttpProviderConfig),
    Cli(CliProviderConfig),
}

impl BackendConfig {
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Http(_) => BackendKind::Http,
            BackendConfig::Cli(c) if c.interactive => BackendKind::CliInteractive,
            BackendConfig::Cli(_) => BackendKind::Cli,
        }
    }
}

/// One entry of the `providers` map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_priority")]
    pub priority: i32,
    #[serde(default = "default_timeout_s")]
    pub timeout_s: u64,
    pub rate_limit_rpm: Option<u32>,
    #[serde(flatten)]
    pub backend: BackendConfig,
}

fn default_true() -> bool {
    true
}

fn default_priority() -> i32 {
    50
}

fn default_timeout_s() -> u64 {
    300
}

/// Tuning knobs for the queue, dispatch, health, and cleanup loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,
    #[serde(default = "default_request_ttl_hours")]
    pub request_ttl_hours: u64,
    #[serde(default = "default_metrics_ttl_hours")]
    pub metrics_ttl_hours: u64,
    #[serde(default = "default_discussions_ttl_hours")]
    pub discussions_ttl_hours: u64,
    pub default_provider: Option<String>,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default = "default_health_check_interval", with = "humantime_serde")]
    pub health_check_interval: Duration,
    #[serde(default = "default_cleanup_interval", with = "humantime_serde")]
    pub cleanup_interval: Duration,
}

fn default_max_queue_size() -> usize {
    1000
}

fn default_max_concurrent_requests() -> usize {
    10
}

fn default_request_ttl_hours() -> u64 {
    24
}

fn default_metrics_ttl_hours() -> u64 {
    24 * 7
}

fn default_discussions_ttl_hours() -> u64 {
    24 * 7
}

fn default_health_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_cleanup_interval() -> Duration {
    Duration::from_secs(3600)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_queue_size: default_max_queue_size(),
            max_concurrent_requests: default_max_concurrent_requests(),
            request_ttl_hours: default_request_ttl_hours(),
            metrics_ttl_hours: default_metrics_ttl_hours(),
            discussions_ttl_hours: default_discussions_ttl_hours(),
            default_provider: None,
            providers: HashMap::new(),
            health_check_interval: default_health_check_interval(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}
