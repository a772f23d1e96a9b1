//! `/api/discussions` — the multi-round discussion orchestrator surface.

use axum::extract::{Path, State};
use axum::response::Json;
use gateway_core::ids::SessionId;
use gateway_core::model::{DiscussionConfig, DiscussionMessage, DiscussionMessageFilter, DiscussionSession};
use gateway_core::storage::Storage;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct StartDiscussionBody {
    pub topic: String,
    pub providers: Vec<String>,
    #[serde(default)]
    pub provider_timeout_s: Option<u64>,
    #[serde(default)]
    pub summary_provider: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StartDiscussionResponse {
    pub session_id: String,
}

/// `POST /api/discussions`: starts a new discussion; execution runs in the
/// background, progress is observable via `GET` and the event stream.
pub async fn start_discussion(State(state): State<AppState>, Json(body): Json<StartDiscussionBody>) -> Result<Json<StartDiscussionResponse>> {
    let config = DiscussionConfig { provider_timeout_s: body.provider_timeout_s.unwrap_or(60), summary_provider: body.summary_provider };
    let session_id = state.engine.discussions.start(body.topic, body.providers, config).await?;
    Ok(Json(StartDiscussionResponse { session_id: session_id.to_string() }))
}

fn parse_session_id(raw: &str) -> Result<SessionId> {
    raw.parse::<uuid::Uuid>().map(SessionId::from).map_err(|_| Error::BadRequest { message: "invalid session id".to_string() })
}

/// `GET /api/discussions/{id}`: session metadata and current status.
pub async fn get_discussion(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<DiscussionSession>> {
    let id = parse_session_id(&id)?;
    let session = state
        .engine
        .storage
        .get_discussion_session(id)
        .await?
        .ok_or_else(|| Error::NotFound { resource: "discussion session".to_string(), id: id.to_string() })?;
    Ok(Json(session))
}

/// `GET /api/discussions/{id}/messages`: every message produced so far,
/// across all rounds.
pub async fn list_discussion_messages(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Vec<DiscussionMessage>>> {
    let id = parse_session_id(&id)?;
    let messages = state.engine.storage.get_discussion_messages(id, DiscussionMessageFilter::default()).await?;
    Ok(Json(messages))
}

#[derive(Debug, Serialize)]
pub struct CancelDiscussionResponse {
    pub success: bool,
}

/// `DELETE /api/discussions/{id}`: cancels a non-terminal session. 404 if
/// the id is unknown entirely; `{success: false}` if it is known but already
/// terminal (nothing left to cancel).
pub async fn cancel_discussion(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<CancelDiscussionResponse>> {
    let id = parse_session_id(&id)?;
    if state.engine.storage.get_discussion_session(id).await?.is_none() {
        return Err(Error::NotFound { resource: "discussion session".to_string(), id: id.to_string() });
    }
    let cancelled = state.engine.discussions.cancel(id).await?;
    Ok(Json(CancelDiscussionResponse { success: cancelled }))
}

#[derive(Debug, Deserialize)]
pub struct ContinueDiscussionBody {
    #[serde(default)]
    pub providers: Option<Vec<String>>,
    #[serde(default)]
    pub provider_timeout_s: Option<u64>,
    #[serde(default)]
    pub summary_provider: Option<String>,
}

/// `POST /api/discussions/{id}/continue`: spawns a child session seeded
/// from `id`'s summary and round-3 messages. `id` must be `completed`.
pub async fn continue_discussion(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ContinueDiscussionBody>,
) -> Result<Json<StartDiscussionResponse>> {
    let id = parse_session_id(&id)?;
    let config = if body.provider_timeout_s.is_some() || body.summary_provider.is_some() {
        Some(DiscussionConfig { provider_timeout_s: body.provider_timeout_s.unwrap_or(60), summary_provider: body.summary_provider })
    } else {
        None
    };
    let session_id = state.engine.discussions.continue_discussion(id, body.providers, config).await?;
    Ok(Json(StartDiscussionResponse { session_id: session_id.to_string() }))
}
