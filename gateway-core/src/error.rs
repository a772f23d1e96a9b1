//! Engine-level error taxonomy.
//!
//! These variants are the semantic classification described by the gateway's
//! error handling design: client mistakes, capacity limits, backend and
//! store failures. The HTTP-facing crate maps each variant to a status code;
//! this crate stays framework-agnostic.

use thiserror::Error;

use crate::ids::RequestId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("request {0} already exists")]
    Duplicate(RequestId),

    #[error("request {0} not found")]
    RequestNotFound(RequestId),

    #[error("discussion session {0} not found")]
    SessionNotFound(uuid::Uuid),

    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("provider {0} is disabled")]
    ProviderDisabled(String),

    #[error("queue is full (max_queue_size = {0})")]
    QueueFull(usize),

    #[error("request timed out after {0}s")]
    Timeout(u64),

    #[error("backend failure: {0}")]
    BackendFailure(String),

    #[error("discussion parent session {0} is not completed")]
    ParentSessionNotCompleted(uuid::Uuid),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Persistence-layer failures. Kept distinct from [`Error`] so call sites can
/// choose to escalate without marking a request terminal, matching the
/// "store errors are not swallowed" propagation policy: a worker that hits a
/// `StoreError` logs and re-raises rather than writing a terminal status,
/// leaving the request to be replayed on restart.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    #[cfg(feature = "postgres")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    #[cfg(feature = "postgres")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
