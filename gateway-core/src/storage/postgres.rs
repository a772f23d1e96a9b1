//! PostgreSQL-backed [`Storage`] implementation.
//!
//! Uses the runtime-checked `sqlx::query`/`query_as` API rather than the
//! compile-time-checked `query!` macros: this crate's schema is new and has
//! no checked-in offline query cache to validate against, so runtime
//! checking is the right tradeoff here even though the macros are the
//! house style elsewhere.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};

use super::Storage;
use crate::error::{Error, Result, StoreError};
use crate::ids::{MessageId, RequestId, SessionId};
use crate::model::{
    BackendKind, DiscussionConfig, DiscussionMessage, DiscussionMessageFilter, DiscussionMessageUpdate, DiscussionSession,
    DiscussionSessionUpdate, DiscussionStatus, MessageKind, MessageStatus, MetricEvent, Metadata, OrderBy, ProviderHealth,
    ProviderMetricsSummary, ProviderStatus, Request, RequestFilter, RequestStatus, Response,
};

pub struct PostgresStorage {
    pool: PgPool,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run pending migrations. Additive and idempotent: re-running against
    /// an already-migrated database is a no-op.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Store(StoreError::Migrate(e)))?;
        Ok(())
    }
}

fn backend_kind_str(kind: BackendKind) -> &'static str {
    match kind {
        BackendKind::Http => "http",
        BackendKind::Cli => "cli",
        BackendKind::CliInteractive => "cli_interactive",
    }
}

fn parse_backend_kind(s: &str) -> BackendKind {
    match s {
        "http" => BackendKind::Http,
        "cli_interactive" => BackendKind::CliInteractive,
        _ => BackendKind::Cli,
    }
}

fn status_str(status: RequestStatus) -> &'static str {
    match status {
        RequestStatus::Queued => "queued",
        RequestStatus::Processing => "processing",
        RequestStatus::Completed => "completed",
        RequestStatus::Failed => "failed",
        RequestStatus::Timeout => "timeout",
        RequestStatus::Cancelled => "cancelled",
    }
}

fn parse_status(s: &str) -> RequestStatus {
    match s {
        "queued" => RequestStatus::Queued,
        "processing" => RequestStatus::Processing,
        "completed" => RequestStatus::Completed,
        "failed" => RequestStatus::Failed,
        "timeout" => RequestStatus::Timeout,
        _ => RequestStatus::Cancelled,
    }
}

fn health_str(h: ProviderHealth) -> &'static str {
    match h {
        ProviderHealth::Healthy => "healthy",
        ProviderHealth::Degraded => "degraded",
        ProviderHealth::Unavailable => "unavailable",
        ProviderHealth::Unknown => "unknown",
    }
}

fn parse_health(s: &str) -> ProviderHealth {
    match s {
        "healthy" => ProviderHealth::Healthy,
        "degraded" => ProviderHealth::Degraded,
        "unavailable" => ProviderHealth::Unavailable,
        _ => ProviderHealth::Unknown,
    }
}

fn discussion_status_str(s: DiscussionStatus) -> &'static str {
    match s {
        DiscussionStatus::Pending => "pending",
        DiscussionStatus::Round1 => "round_1",
        DiscussionStatus::Round2 => "round_2",
        DiscussionStatus::Round3 => "round_3",
        DiscussionStatus::Summarizing => "summarizing",
        DiscussionStatus::Completed => "completed",
        DiscussionStatus::Failed => "failed",
        DiscussionStatus::Cancelled => "cancelled",
    }
}

fn parse_discussion_status(s: &str) -> DiscussionStatus {
    match s {
        "pending" => DiscussionStatus::Pending,
        "round_1" => DiscussionStatus::Round1,
        "round_2" => DiscussionStatus::Round2,
        "round_3" => DiscussionStatus::Round3,
        "summarizing" => DiscussionStatus::Summarizing,
        "completed" => DiscussionStatus::Completed,
        "failed" => DiscussionStatus::Failed,
        _ => DiscussionStatus::Cancelled,
    }
}

fn message_kind_str(k: MessageKind) -> &'static str {
    match k {
        MessageKind::Proposal => "proposal",
        MessageKind::Review => "review",
        MessageKind::Revision => "revision",
        MessageKind::Summary => "summary",
    }
}

fn parse_message_kind(s: &str) -> MessageKind {
    match s {
        "proposal" => MessageKind::Proposal,
        "review" => MessageKind::Review,
        "revision" => MessageKind::Revision,
        _ => MessageKind::Summary,
    }
}

fn message_status_str(s: MessageStatus) -> &'static str {
    match s {
        MessageStatus::Pending => "pending",
        MessageStatus::Completed => "completed",
        MessageStatus::Failed => "failed",
        MessageStatus::Timeout => "timeout",
    }
}

fn parse_message_status(s: &str) -> MessageStatus {
    match s {
        "pending" => MessageStatus::Pending,
        "completed" => MessageStatus::Completed,
        "timeout" => MessageStatus::Timeout,
        _ => MessageStatus::Failed,
    }
}

fn row_to_request(row: &sqlx::postgres::PgRow) -> Result<Request> {
    let id: String = row.try_get("id").map_err(sqlx_err)?;
    let metadata: Option<serde_json::Value> = row.try_get("metadata").map_err(sqlx_err)?;
    Ok(Request {
        id: id.parse().map_err(|_| Error::InvalidArgument("corrupt request id in store".into()))?,
        provider: row.try_get("provider").map_err(sqlx_err)?,
        message: row.try_get("message").map_err(sqlx_err)?,
        priority: row.try_get("priority").map_err(sqlx_err)?,
        timeout_s: row.try_get::<i64, _>("timeout_s").map_err(sqlx_err)? as u64,
        status: parse_status(row.try_get::<String, _>("status").map_err(sqlx_err)?.as_str()),
        created_at: row.try_get("created_at").map_err(sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(sqlx_err)?,
        routed_at: row.try_get("routed_at").map_err(sqlx_err)?,
        started_at: row.try_get("started_at").map_err(sqlx_err)?,
        completed_at: row.try_get("completed_at").map_err(sqlx_err)?,
        backend_kind: row
            .try_get::<Option<String>, _>("backend_kind")
            .map_err(sqlx_err)?
            .map(|s| parse_backend_kind(&s)),
        metadata: metadata.and_then(|v| v.as_object().cloned()),
    })
}

fn sqlx_err(e: sqlx::Error) -> Error {
    Error::Store(StoreError::Sqlx(e))
}

fn metadata_to_json(m: &Option<Metadata>) -> serde_json::Value {
    m.clone().map(serde_json::Value::Object).unwrap_or(serde_json::Value::Null)
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn create_request(&self, r: &Request) -> Result<()> {
        let existing = self.get_request(r.id).await?;
        if existing.is_some() {
            return Err(Error::Duplicate(r.id));
        }
        sqlx::query(
            "INSERT INTO requests (id, provider, message, priority, timeout_s, status, created_at, updated_at, routed_at, started_at, completed_at, backend_kind, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(r.id.as_str())
        .bind(&r.provider)
        .bind(&r.message)
        .bind(r.priority)
        .bind(r.timeout_s as i64)
        .bind(status_str(r.status))
        .bind(r.created_at)
        .bind(r.updated_at)
        .bind(r.routed_at)
        .bind(r.started_at)
        .bind(r.completed_at)
        .bind(r.backend_kind.map(backend_kind_str))
        .bind(metadata_to_json(&r.metadata))
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>> {
        let row = sqlx::query("SELECT * FROM requests WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.as_ref().map(row_to_request).transpose()
    }

    async fn update_request_status(&self, id: RequestId, new_status: RequestStatus, backend_kind: Option<BackendKind>) -> Result<bool> {
        let Some(current) = self.get_request(id).await? else {
            return Err(Error::RequestNotFound(id));
        };
        if current.status.is_terminal() {
            // Idempotent no-op for a repeat of the same terminal state; a
            // transition away from terminal is refused either way.
            return Ok(current.status == new_status);
        }

        let now = Utc::now();
        let routed_at = if new_status == RequestStatus::Processing { Some(now) } else { current.routed_at };
        let started_at = if new_status == RequestStatus::Processing { Some(now) } else { current.started_at };
        let completed_at = if new_status.is_terminal() { Some(now) } else { current.completed_at };
        let kind = backend_kind.or(current.backend_kind);

        sqlx::query(
            "UPDATE requests SET status = $1, updated_at = $2, routed_at = $3, started_at = $4, completed_at = $5, backend_kind = $6 WHERE id = $7",
        )
        .bind(status_str(new_status))
        .bind(now)
        .bind(routed_at)
        .bind(started_at)
        .bind(completed_at)
        .bind(kind.map(backend_kind_str))
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(true)
    }

    async fn list_requests(&self, filter: RequestFilter, limit: i64, offset: i64, order_by: OrderBy, desc: bool) -> Result<Vec<Request>> {
        let order_col = match order_by {
            OrderBy::CreatedAt => "created_at",
            OrderBy::UpdatedAt => "updated_at",
            OrderBy::Priority => "priority",
        };
        let direction = if desc { "DESC" } else { "ASC" };

        let mut query = String::from("SELECT * FROM requests WHERE ($1::text IS NULL OR status = $1) AND ($2::text IS NULL OR provider = $2)");
        query.push_str(&format!(" ORDER BY {order_col} {direction} LIMIT $3 OFFSET $4"));

        let rows = sqlx::query(&query)
            .bind(filter.status.map(status_str))
            .bind(filter.provider)
            .bind(limit)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;

        rows.iter().map(row_to_request).collect()
    }

    async fn get_pending_requests(&self, limit: i64) -> Result<Vec<Request>> {
        let rows = sqlx::query("SELECT * FROM requests WHERE status = 'queued' ORDER BY priority DESC, created_at ASC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.iter().map(row_to_request).collect()
    }

    async fn cancel_request(&self, id: RequestId) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE requests SET status = 'cancelled', updated_at = now(), completed_at = now()
             WHERE id = $1 AND status IN ('queued', 'processing')",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_response(&self, resp: &Response) -> Result<()> {
        sqlx::query(
            "INSERT INTO responses (request_id, status, response, error, provider, latency_ms, tokens_used, metadata)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             ON CONFLICT (request_id) DO UPDATE SET
               status = EXCLUDED.status, response = EXCLUDED.response, error = EXCLUDED.error,
               provider = EXCLUDED.provider, latency_ms = EXCLUDED.latency_ms,
               tokens_used = EXCLUDED.tokens_used, metadata = EXCLUDED.metadata",
        )
        .bind(resp.request_id.as_str())
        .bind(status_str(resp.status))
        .bind(&resp.response)
        .bind(&resp.error)
        .bind(&resp.provider)
        .bind(resp.latency_ms)
        .bind(resp.tokens_used.map(|v| v as i64))
        .bind(metadata_to_json(&resp.metadata))
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_response(&self, id: RequestId) -> Result<Option<Response>> {
        let row = sqlx::query("SELECT * FROM responses WHERE request_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        let Some(row) = row else { return Ok(None) };
        let request_id: String = row.try_get("request_id").map_err(sqlx_err)?;
        let metadata: Option<serde_json::Value> = row.try_get("metadata").map_err(sqlx_err)?;
        Ok(Some(Response {
            request_id: request_id.parse().map_err(|_| Error::InvalidArgument("corrupt request id in store".into()))?,
            status: parse_status(row.try_get::<String, _>("status").map_err(sqlx_err)?.as_str()),
            response: row.try_get("response").map_err(sqlx_err)?,
            error: row.try_get("error").map_err(sqlx_err)?,
            provider: row.try_get("provider").map_err(sqlx_err)?,
            latency_ms: row.try_get("latency_ms").map_err(sqlx_err)?,
            tokens_used: row.try_get::<Option<i64>, _>("tokens_used").map_err(sqlx_err)?.map(|v| v as u64),
            metadata: metadata.and_then(|v| v.as_object().cloned()),
        }))
    }

    async fn update_provider_status(&self, info: &ProviderStatus) -> Result<()> {
        sqlx::query(
            "INSERT INTO provider_status (name, backend_kind, status, queue_depth, avg_latency_ms, success_rate, last_check, enabled, priority, rate_limit_rpm, timeout_s)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (name) DO UPDATE SET
               backend_kind = EXCLUDED.backend_kind, status = EXCLUDED.status, queue_depth = EXCLUDED.queue_depth,
               avg_latency_ms = EXCLUDED.avg_latency_ms, success_rate = EXCLUDED.success_rate,
               last_check = EXCLUDED.last_check, enabled = EXCLUDED.enabled, priority = EXCLUDED.priority,
               rate_limit_rpm = EXCLUDED.rate_limit_rpm, timeout_s = EXCLUDED.timeout_s",
        )
        .bind(&info.name)
        .bind(backend_kind_str(info.backend_kind))
        .bind(health_str(info.status))
        .bind(info.queue_depth as i64)
        .bind(info.avg_latency_ms)
        .bind(info.success_rate)
        .bind(info.last_check)
        .bind(info.enabled)
        .bind(info.priority)
        .bind(info.rate_limit_rpm.map(|v| v as i32))
        .bind(info.timeout_s as i64)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_provider_status(&self, name: &str) -> Result<Option<ProviderStatus>> {
        let row = sqlx::query("SELECT * FROM provider_status WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.map(row_to_provider_status).transpose()
    }

    async fn list_provider_statuses(&self) -> Result<Vec<ProviderStatus>> {
        let rows = sqlx::query("SELECT * FROM provider_status ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(sqlx_err)?;
        rows.into_iter().map(row_to_provider_status).collect()
    }

    async fn record_metric(&self, event: &MetricEvent) -> Result<()> {
        sqlx::query(
            "INSERT INTO metrics (provider, request_id, event_type, latency_ms, success, error, \"timestamp\")
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&event.provider)
        .bind(event.request_id.map(|id| id.as_str().to_string()))
        .bind(&event.event_type)
        .bind(event.latency_ms)
        .bind(event.success)
        .bind(&event.error)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_provider_metrics(&self, name: &str, hours: i64) -> Result<ProviderMetricsSummary> {
        let row = sqlx::query(
            "SELECT
               count(*) AS count,
               count(*) FILTER (WHERE success) AS successes,
               coalesce(avg(latency_ms), 0) AS avg_latency_ms,
               coalesce(max(latency_ms), 0) AS max_latency_ms,
               coalesce(min(latency_ms), 0) AS min_latency_ms
             FROM metrics
             WHERE provider = $1 AND \"timestamp\" >= now() - ($2 || ' hours')::interval",
        )
        .bind(name)
        .bind(hours.to_string())
        .fetch_one(&self.pool)
        .await
        .map_err(sqlx_err)?;

        Ok(ProviderMetricsSummary {
            provider: name.to_string(),
            count: row.try_get::<i64, _>("count").map_err(sqlx_err)? as u64,
            successes: row.try_get::<i64, _>("successes").map_err(sqlx_err)? as u64,
            avg_latency_ms: row.try_get("avg_latency_ms").map_err(sqlx_err)?,
            max_latency_ms: row.try_get("max_latency_ms").map_err(sqlx_err)?,
            min_latency_ms: row.try_get("min_latency_ms").map_err(sqlx_err)?,
        })
    }

    async fn cleanup_old_requests(&self, max_age_hours: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM requests WHERE completed_at IS NOT NULL AND completed_at < now() - ($1 || ' hours')::interval",
        )
        .bind(max_age_hours.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn cleanup_old_metrics(&self, max_age_hours: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM metrics WHERE \"timestamp\" < now() - ($1 || ' hours')::interval")
            .bind(max_age_hours.to_string())
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn cleanup_old_discussions(&self, max_age_hours: i64) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM discussion_sessions WHERE status IN ('completed', 'failed', 'cancelled')
             AND updated_at < now() - ($1 || ' hours')::interval",
        )
        .bind(max_age_hours.to_string())
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(result.rows_affected())
    }

    async fn create_discussion_session(&self, session: &DiscussionSession) -> Result<()> {
        sqlx::query(
            "INSERT INTO discussion_sessions (id, topic, providers, provider_timeout_s, summary_provider, status, current_round, summary, parent_session_id, metadata, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
        )
        .bind(session.id.0)
        .bind(&session.topic)
        .bind(serde_json::to_value(&session.providers).map_err(|e| Error::Store(StoreError::Serde(e)))?)
        .bind(session.config.provider_timeout_s as i64)
        .bind(&session.config.summary_provider)
        .bind(discussion_status_str(session.status))
        .bind(session.current_round as i16)
        .bind(&session.summary)
        .bind(session.parent_session_id.map(|id| id.0))
        .bind(metadata_to_json(&session.metadata))
        .bind(session.created_at)
        .bind(session.updated_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_discussion_session(&self, id: SessionId) -> Result<Option<DiscussionSession>> {
        let row = sqlx::query("SELECT * FROM discussion_sessions WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        row.map(row_to_discussion_session).transpose()
    }

    async fn update_discussion_session(&self, id: SessionId, update: DiscussionSessionUpdate) -> Result<()> {
        let Some(mut current) = self.get_discussion_session(id).await? else {
            return Err(Error::SessionNotFound(id.0));
        };
        if let Some(status) = update.status {
            current.status = status;
        }
        if let Some(round) = update.current_round {
            current.current_round = round;
        }
        if let Some(summary) = update.summary {
            current.summary = Some(summary);
        }
        if let Some(metadata) = update.metadata {
            current.metadata = Some(metadata);
        }
        current.updated_at = Utc::now();

        sqlx::query(
            "UPDATE discussion_sessions SET status = $1, current_round = $2, summary = $3, metadata = $4, updated_at = $5 WHERE id = $6",
        )
        .bind(discussion_status_str(current.status))
        .bind(current.current_round as i16)
        .bind(&current.summary)
        .bind(metadata_to_json(&current.metadata))
        .bind(current.updated_at)
        .bind(id.0)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn create_discussion_message(&self, message: &DiscussionMessage) -> Result<()> {
        let reference_ids: Vec<uuid::Uuid> = message.references.iter().map(|id| id.0).collect();
        sqlx::query(
            "INSERT INTO discussion_messages (id, session_id, round_number, provider, kind, content, reference_ids, status, latency_ms, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(message.id.0)
        .bind(message.session_id.0)
        .bind(message.round_number as i16)
        .bind(&message.provider)
        .bind(message_kind_str(message.kind))
        .bind(&message.content)
        .bind(serde_json::to_value(reference_ids).map_err(|e| Error::Store(StoreError::Serde(e)))?)
        .bind(message_status_str(message.status))
        .bind(message.latency_ms)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .map_err(sqlx_err)?;
        Ok(())
    }

    async fn update_discussion_message(&self, id: MessageId, update: DiscussionMessageUpdate) -> Result<()> {
        let row = sqlx::query("SELECT content, status, latency_ms FROM discussion_messages WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(sqlx_err)?;
        let Some(row) = row else {
            return Err(Error::InvalidArgument(format!("discussion message {id} not found")));
        };

        let content: Option<String> = update.content.or(row.try_get("content").map_err(sqlx_err)?);
        let status: MessageStatus = match update.status {
            Some(s) => s,
            None => {
                let status_str: String = row.try_get("status").map_err(sqlx_err)?;
                parse_message_status(&status_str)
            }
        };
        let latency_ms: Option<f64> = update.latency_ms.or(row.try_get("latency_ms").map_err(sqlx_err)?);

        sqlx::query("UPDATE discussion_messages SET content = $1, status = $2, latency_ms = $3 WHERE id = $4")
            .bind(content)
            .bind(message_status_str(status))
            .bind(latency_ms)
            .bind(id.0)
            .execute(&self.pool)
            .await
            .map_err(sqlx_err)?;
        Ok(())
    }

    async fn get_discussion_messages(&self, session_id: SessionId, filter: DiscussionMessageFilter) -> Result<Vec<DiscussionMessage>> {
        let rows = sqlx::query(
            "SELECT * FROM discussion_messages WHERE session_id = $1
               AND ($2::smallint IS NULL OR round_number = $2)
               AND ($3::text IS NULL OR provider = $3)
             ORDER BY round_number ASC, created_at ASC",
        )
        .bind(session_id.0)
        .bind(filter.round_number.map(|r| r as i16))
        .bind(filter.provider)
        .fetch_all(&self.pool)
        .await
        .map_err(sqlx_err)?;
        rows.into_iter().map(row_to_discussion_message).collect()
    }
}

fn row_to_provider_status(row: sqlx::postgres::PgRow) -> Result<ProviderStatus> {
    Ok(ProviderStatus {
        name: row.try_get("name").map_err(sqlx_err)?,
        backend_kind: parse_backend_kind(row.try_get::<String, _>("backend_kind").map_err(sqlx_err)?.as_str()),
        status: parse_health(row.try_get::<String, _>("status").map_err(sqlx_err)?.as_str()),
        queue_depth: row.try_get::<i64, _>("queue_depth").map_err(sqlx_err)? as u64,
        avg_latency_ms: row.try_get("avg_latency_ms").map_err(sqlx_err)?,
        success_rate: row.try_get("success_rate").map_err(sqlx_err)?,
        last_check: row.try_get("last_check").map_err(sqlx_err)?,
        enabled: row.try_get("enabled").map_err(sqlx_err)?,
        priority: row.try_get("priority").map_err(sqlx_err)?,
        rate_limit_rpm: row.try_get::<Option<i32>, _>("rate_limit_rpm").map_err(sqlx_err)?.map(|v| v as u32),
        timeout_s: row.try_get::<i64, _>("timeout_s").map_err(sqlx_err)? as u64,
    })
}

fn row_to_discussion_session(row: sqlx::postgres::PgRow) -> Result<DiscussionSession> {
    let id: uuid::Uuid = row.try_get("id").map_err(sqlx_err)?;
    let providers: serde_json::Value = row.try_get("providers").map_err(sqlx_err)?;
    let metadata: Option<serde_json::Value> = row.try_get("metadata").map_err(sqlx_err)?;
    let parent: Option<uuid::Uuid> = row.try_get("parent_session_id").map_err(sqlx_err)?;
    Ok(DiscussionSession {
        id: SessionId(id),
        topic: row.try_get("topic").map_err(sqlx_err)?,
        providers: serde_json::from_value(providers).map_err(|e| Error::Store(StoreError::Serde(e)))?,
        config: DiscussionConfig {
            provider_timeout_s: row.try_get::<i64, _>("provider_timeout_s").map_err(sqlx_err)? as u64,
            summary_provider: row.try_get("summary_provider").map_err(sqlx_err)?,
        },
        status: parse_discussion_status(row.try_get::<String, _>("status").map_err(sqlx_err)?.as_str()),
        current_round: row.try_get::<i16, _>("current_round").map_err(sqlx_err)? as u8,
        summary: row.try_get("summary").map_err(sqlx_err)?,
        parent_session_id: parent.map(SessionId),
        metadata: metadata.and_then(|v| v.as_object().cloned()),
        created_at: row.try_get("created_at").map_err(sqlx_err)?,
        updated_at: row.try_get("updated_at").map_err(sqlx_err)?,
    })
}

fn row_to_discussion_message(row: sqlx::postgres::PgRow) -> Result<DiscussionMessage> {
    let id: uuid::Uuid = row.try_get("id").map_err(sqlx_err)?;
    let session_id: uuid::Uuid = row.try_get("session_id").map_err(sqlx_err)?;
    let reference_ids: serde_json::Value = row.try_get("reference_ids").map_err(sqlx_err)?;
    let references: Vec<uuid::Uuid> = serde_json::from_value(reference_ids).map_err(|e| Error::Store(StoreError::Serde(e)))?;
    Ok(DiscussionMessage {
        id: MessageId(id),
        session_id: SessionId(session_id),
        round_number: row.try_get::<i16, _>("round_number").map_err(sqlx_err)? as u8,
        provider: row.try_get("provider").map_err(sqlx_err)?,
        kind: parse_message_kind(row.try_get::<String, _>("kind").map_err(sqlx_err)?.as_str()),
        content: row.try_get("content").map_err(sqlx_err)?,
        references: references.into_iter().map(MessageId).collect(),
        status: parse_message_status(row.try_get::<String, _>("status").map_err(sqlx_err)?.as_str()),
        latency_ms: row.try_get("latency_ms").map_err(sqlx_err)?,
        created_at: row.try_get("created_at").map_err(sqlx_err)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_kind_round_trips_through_str() {
        for kind in [BackendKind::Http, BackendKind::Cli, BackendKind::CliInteractive] {
            assert_eq!(parse_backend_kind(backend_kind_str(kind)), kind);
        }
    }

    #[test]
    fn status_round_trips_through_str() {
        for status in [
            RequestStatus::Queued,
            RequestStatus::Processing,
            RequestStatus::Completed,
            RequestStatus::Failed,
            RequestStatus::Timeout,
            RequestStatus::Cancelled,
        ] {
            assert_eq!(parse_status(status_str(status)), status);
        }
    }
}
