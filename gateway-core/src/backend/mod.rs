//! Backend Abstraction (§4.C): a uniform contract over HTTP and CLI-subprocess
//! providers.
//!
//! A [`Backend`] executes exactly one prompt against exactly one configured
//! provider and reports a [`BackendResult`] rather than failing the call:
//! `success` is the only bit the queue and dispatch loop act on, everything
//! else (`error`, the advisory [`FailureKind`]) is diagnostic.

pub mod cli;
pub mod http;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::{BackendConfig, EngineConfig};
use crate::model::Request;

/// Advisory classification of why a backend call did not succeed. Never
/// drives queue behavior by itself — only `BackendResult::success` does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Timeout,
    SpawnFailure,
    NonZeroExit,
    UnreachableEndpoint,
    ProtocolError,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Timeout => "timeout",
            FailureKind::SpawnFailure => "spawn_failure",
            FailureKind::NonZeroExit => "non_zero_exit",
            FailureKind::UnreachableEndpoint => "unreachable_endpoint",
            FailureKind::ProtocolError => "protocol_error",
        };
        f.write_str(s)
    }
}

/// The outcome of one `Backend::execute` call.
#[derive(Debug, Clone)]
pub struct BackendResult {
    pub success: bool,
    pub response: Option<String>,
    pub error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub latency_ms: f64,
    pub tokens_used: Option<u64>,
    pub metadata: Option<Value>,
}

impl BackendResult {
    pub fn ok(response: impl Into<String>, latency_ms: f64) -> Self {
        Self {
            success: true,
            response: Some(response.into()),
            error: None,
            failure_kind: None,
            latency_ms,
            tokens_used: None,
            metadata: None,
        }
    }

    pub fn err(error: impl Into<String>, kind: FailureKind, latency_ms: f64) -> Self {
        Self {
            success: false,
            response: None,
            error: Some(error.into()),
            failure_kind: Some(kind),
            latency_ms,
            tokens_used: None,
            metadata: None,
        }
    }
}

/// Uniform contract satisfied by every provider-facing backend (§4.C).
///
/// Implementations must honor `request.timeout_s` as a hard deadline on the
/// whole call, including connect/spawn. The dispatch loop additionally wraps
/// every call in its own deadline (§4.F step 4), so a backend that ignores
/// its own timeout is still bounded from the outside — but must still try,
/// since the backend's deadline may legitimately be shorter than the
/// dispatcher's.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn execute(&self, request: &Request) -> BackendResult;

    /// Cheap liveness probe, invoked by the health monitor (§4.D).
    async fn health_check(&self) -> bool;

    /// Idempotent teardown, e.g. killing an owned long-lived child.
    async fn shutdown(&self);

    fn kind(&self) -> crate::model::BackendKind;
}

/// Builds one [`Backend`] per enabled, constructible provider in `config`.
/// A provider whose backend fails to construct (e.g. a CLI command that
/// cannot be resolved on `$PATH`) is logged and skipped rather than
/// aborting startup — the gateway continues serving the remaining
/// providers.
pub async fn build_registry(config: &EngineConfig) -> Vec<(String, Arc<dyn Backend>)> {
    let mut backends = Vec::new();
    for (name, provider) in &config.providers {
        if !provider.enabled {
            continue;
        }
        let built = match &provider.backend {
            BackendConfig::Http(http_cfg) => {
                Some(Arc::new(http::HttpBackend::new(name.clone(), http_cfg.clone())) as Arc<dyn Backend>)
            }
            BackendConfig::Cli(cli_cfg) if cli_cfg.interactive => {
                match cli::InteractiveCliBackend::new(name.clone(), cli_cfg.clone()).await {
                    Ok(b) => Some(Arc::new(b) as Arc<dyn Backend>),
                    Err(e) => {
                        tracing::warn!(provider = %name, error = %e, "failed to start interactive CLI backend, skipping");
                        None
                    }
                }
            }
            BackendConfig::Cli(cli_cfg) => match cli::CliBackend::new(name.clone(), cli_cfg.clone()) {
                Ok(b) => Some(Arc::new(b) as Arc<dyn Backend>),
                Err(e) => {
                    tracing::warn!(provider = %name, error = %e, "failed to resolve CLI backend command, skipping");
                    None
                }
            },
        };
        if let Some(backend) = built {
            backends.push((name.clone(), backend));
        }
    }
    backends
}

/// Lines stripped from CLI stdout before the first line is treated as the
/// response (§11 of the supplemented feature list): known progress/status
/// chatter some CLI tools print to stdout ahead of their actual answer.
pub const CLI_NOISE_PHRASES: &[&str] = &["loading", "initializing", "connecting", "thinking...", "processing..."];

/// Strips leading lines that match (case-insensitively, as a substring) one
/// of [`CLI_NOISE_PHRASES`], returning the remaining content joined back with
/// newlines. Mirrors the source's `_clean_output`.
pub fn clean_cli_output(raw: &str) -> String {
    let mut lines = raw.lines();
    let mut cleaned: Vec<&str> = Vec::new();
    let mut still_stripping = true;
    for line in &mut lines {
        if still_stripping {
            let lower = line.to_lowercase();
            if line.trim().is_empty() || CLI_NOISE_PHRASES.iter().any(|p| lower.contains(p)) {
                continue;
            }
            still_stripping = false;
        }
        cleaned.push(line);
    }
    cleaned.join("\n").trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clean_output_strips_known_noise_phrases() {
        let raw = "Loading...\nConnecting to provider\nThinking...\nActual answer here";
        assert_eq!(clean_cli_output(raw), "Actual answer here");
    }

    #[test]
    fn clean_output_keeps_noise_phrase_text_inside_the_real_answer() {
        let raw = "hello\nthis mentions loading bridges";
        assert_eq!(clean_cli_output(raw), "hello\nthis mentions loading bridges");
    }

    #[test]
    fn clean_output_is_case_insensitive() {
        let raw = "INITIALIZING\nreal content";
        assert_eq!(clean_cli_output(raw), "real content");
    }
}
