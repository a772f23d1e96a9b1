//! `/api/ask`, `/api/reply/{id}`, `/api/request/{id}`, `/api/requests`.

use axum::extract::{Path, Query, State};
use axum::response::Json;
use gateway_core::ids::RequestId;
use gateway_core::model::{OrderBy, Request, RequestFilter, RequestStatus};
use gateway_core::storage::Storage;
use serde::{Deserialize, Serialize};

use crate::errors::{Error, Result};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AskBody {
    pub provider: String,
    pub message: String,
    #[serde(default = "default_priority")]
    pub priority: i32,
    pub timeout_s: Option<u64>,
}

fn default_priority() -> i32 {
    50
}

#[derive(Debug, Serialize)]
pub struct AskResponse {
    pub request_id: String,
    pub provider: String,
    pub status: RequestStatus,
}

/// `POST /api/ask`: enqueues a request against one provider.
pub async fn ask(State(state): State<AppState>, Json(body): Json<AskBody>) -> Result<Json<AskResponse>> {
    let provider_cfg = state.engine.config().providers.get(&body.provider).ok_or_else(|| Error::BadRequest {
        message: format!("unknown provider: {}", body.provider),
    })?;
    if !provider_cfg.enabled {
        return Err(Error::BadRequest { message: format!("provider '{}' is disabled", body.provider) });
    }
    if !(0..=100).contains(&body.priority) {
        return Err(Error::BadRequest { message: "priority must be between 0 and 100".to_string() });
    }

    let timeout_s = body.timeout_s.unwrap_or(provider_cfg.timeout_s);
    let provider = body.provider.clone();
    let request = Request::new(body.provider, body.message, body.priority, timeout_s);
    let request_id = request.id;
    state.engine.queue.enqueue(request).await?;

    state.engine.events.publish(gateway_core::events::Event::new(
        "request_submitted",
        serde_json::json!({"request_id": request_id.to_string(), "provider": provider}),
    ));

    Ok(Json(AskResponse { request_id: request_id.to_string(), provider, status: RequestStatus::Queued }))
}

#[derive(Debug, Serialize)]
pub struct ReplyResponse {
    pub request_id: String,
    pub provider: String,
    pub status: RequestStatus,
    pub response: Option<String>,
    pub error: Option<String>,
    pub latency_ms: Option<f64>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct GetReplyQuery {
    #[serde(default)]
    pub wait: bool,
    #[serde(default = "default_wait_timeout")]
    pub timeout: f64,
}

fn default_wait_timeout() -> f64 {
    30.0
}

const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

/// `GET /api/reply/{id}`: the request's current status, plus its response
/// once terminal. With `wait=true`, blocks polling for a terminal status up
/// to `timeout` seconds before returning whatever status is current.
pub async fn get_reply(State(state): State<AppState>, Path(id): Path<String>, Query(query): Query<GetReplyQuery>) -> Result<Json<ReplyResponse>> {
    let id: RequestId = id.parse().map_err(|_| Error::BadRequest { message: "invalid request id".to_string() })?;

    let mut request =
        state.engine.storage.get_request(id).await?.ok_or_else(|| Error::NotFound { resource: "request".to_string(), id: id.to_string() })?;

    if query.wait && !request.status.is_terminal() {
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs_f64(query.timeout.max(0.0));
        loop {
            if std::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
            let Some(refreshed) = state.engine.storage.get_request(id).await? else { break };
            request = refreshed;
            if request.status.is_terminal() {
                break;
            }
        }
    }

    let response = if request.status.is_terminal() { state.engine.storage.get_response(id).await? } else { None };

    Ok(Json(ReplyResponse {
        request_id: id.to_string(),
        provider: request.provider,
        status: request.status,
        response: response.as_ref().and_then(|r| r.response.clone()),
        error: response.as_ref().and_then(|r| r.error.clone()),
        latency_ms: response.as_ref().map(|r| r.latency_ms),
        created_at: request.created_at,
        completed_at: request.completed_at,
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
}

/// `DELETE /api/request/{id}`: cancels a queued or in-flight request. 404 if
/// the id is unknown entirely; `{success: false}` if it is known but already
/// terminal (nothing left to cancel).
pub async fn cancel_request(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<CancelResponse>> {
    let id: RequestId = id.parse().map_err(|_| Error::BadRequest { message: "invalid request id".to_string() })?;
    if state.engine.storage.get_request(id).await?.is_none() {
        return Err(Error::NotFound { resource: "request".to_string(), id: id.to_string() });
    }
    let cancelled = state.engine.queue.cancel(id).await?;
    if cancelled {
        state.engine.events.publish(gateway_core::events::Event::new("request_cancelled", serde_json::json!({"request_id": id.to_string()})));
    }
    Ok(Json(CancelResponse { success: cancelled }))
}

#[derive(Debug, Deserialize)]
pub struct ListRequestsQuery {
    pub status: Option<RequestStatus>,
    pub provider: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

/// `GET /api/requests`: paginated listing, newest first.
pub async fn list_requests(State(state): State<AppState>, Query(query): Query<ListRequestsQuery>) -> Result<Json<Vec<Request>>> {
    let filter = RequestFilter { status: query.status, provider: query.provider };
    let requests = state.engine.storage.list_requests(filter, query.limit.clamp(1, 500), query.offset.max(0), OrderBy::CreatedAt, true).await?;
    Ok(Json(requests))
}
