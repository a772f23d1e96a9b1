//! Error types and HTTP response conversion.
//!
//! This module defines the gateway's HTTP-facing error hierarchy and
//! implements conversion to JSON responses with appropriate status codes.
//! It wraps [`gateway_core::Error`] (the engine's framework-agnostic
//! taxonomy) rather than duplicating it, translating each variant to the
//! status code described by the engine's error handling design:
//!
//! - **Validation errors**: `BadRequest` (400)
//! - **Not found errors**: `NotFound` (404)
//! - **Capacity errors**: `QueueFull`/`TooManyRequests` (503/429)
//! - **Upstream errors**: `BackendFailure`/`Timeout` (502/504)
//! - **Internal errors**: generic server errors (500)

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Invalid request data or a business rule violation.
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found.
    #[error("{resource} with id {id} not found")]
    NotFound { resource: String, id: String },

    /// The request queue is at capacity.
    #[error("queue is full (max {max})")]
    QueueFull { max: usize },

    /// A provider's backend failed or timed out servicing the request.
    #[error("backend failure: {message}")]
    BackendFailure { message: String },

    /// The dispatcher's own deadline elapsed before the backend responded.
    #[error("request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// A discussion continuation was requested from a session that isn't
    /// `completed`.
    #[error("parent session {id} is not completed")]
    ParentSessionNotCompleted { id: String },

    /// Generic internal service error.
    #[error("internal error: {message}")]
    Internal { message: String },

    /// Unexpected error with full context chain.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::QueueFull { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Error::BackendFailure { .. } => StatusCode::BAD_GATEWAY,
            Error::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::ParentSessionNotCompleted { .. } => StatusCode::CONFLICT,
            Error::Internal { .. } | Error::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A user-safe message, without leaking internal implementation details.
    pub fn user_message(&self) -> String {
        match self {
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with id {id} not found"),
            Error::QueueFull { max } => format!("queue is full (max {max}), retry later"),
            Error::BackendFailure { message } => message.clone(),
            Error::Timeout { seconds } => format!("request timed out after {seconds}s"),
            Error::ParentSessionNotCompleted { id } => format!("parent session {id} is not completed"),
            Error::Internal { .. } | Error::Other(_) => "internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal { .. } | Error::Other(_) => tracing::error!("internal service error: {:#}", self),
            Error::BackendFailure { .. } | Error::Timeout { .. } => tracing::warn!("upstream error: {}", self),
            Error::QueueFull { .. } => tracing::warn!("queue at capacity"),
            Error::BadRequest { .. } | Error::NotFound { .. } | Error::ParentSessionNotCompleted { .. } => {
                tracing::debug!("client error: {}", self)
            }
        }

        let status = self.status_code();
        let body = json!({ "detail": self.user_message() });
        (status, axum::response::Json(body)).into_response()
    }
}

impl From<gateway_core::Error> for Error {
    fn from(e: gateway_core::Error) -> Self {
        use gateway_core::Error as CoreError;
        match e {
            CoreError::Duplicate(id) => Error::BadRequest { message: format!("request {id} already exists") },
            CoreError::RequestNotFound(id) => Error::NotFound { resource: "request".to_string(), id: id.to_string() },
            CoreError::SessionNotFound(id) => Error::NotFound { resource: "discussion session".to_string(), id: id.to_string() },
            CoreError::UnknownProvider(p) => Error::BadRequest { message: format!("unknown provider: {p}") },
            CoreError::ProviderDisabled(p) => Error::BadRequest { message: format!("provider '{p}' is disabled") },
            CoreError::QueueFull(max) => Error::QueueFull { max },
            CoreError::Timeout(seconds) => Error::Timeout { seconds },
            CoreError::BackendFailure(message) => Error::BackendFailure { message },
            CoreError::ParentSessionNotCompleted(id) => Error::ParentSessionNotCompleted { id: id.to_string() },
            CoreError::InvalidArgument(message) => Error::BadRequest { message },
            CoreError::Store(store_err) => Error::Internal { message: store_err.to_string() },
        }
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { message: msg }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
