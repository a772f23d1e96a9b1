//! The durable state store contract (§4.A).
//!
//! All writes are atomic from the caller's point of view; readers observe
//! committed state. The contract is deliberately storage-agnostic — the
//! [`postgres`] module is the reference implementation, but anything
//! satisfying [`Storage`] (a test double, an embedded KV store) is a drop-in
//! replacement for the rest of the engine.

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::error::Result;
use crate::ids::{RequestId, SessionId};
use crate::model::{
    DiscussionMessage, DiscussionMessageFilter, DiscussionMessageUpdate, DiscussionSession, DiscussionSessionUpdate, MetricEvent, OrderBy,
    ProviderMetricsSummary, ProviderStatus, Request, RequestFilter, RequestStatus, Response,
};

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Fails with [`crate::error::Error::Duplicate`] if `r.id` already
    /// exists.
    async fn create_request(&self, r: &Request) -> Result<()>;

    async fn get_request(&self, id: RequestId) -> Result<Option<Request>>;

    /// Sets `updated_at` to now; sets `started_at`/`routed_at` when
    /// transitioning to `processing`; sets `completed_at` when
    /// transitioning to a terminal state. A repeated transition to the
    /// same terminal state is a no-op. A transition away from a terminal
    /// state is refused and returns `Ok(false)`.
    async fn update_request_status(&self, id: RequestId, new_status: RequestStatus, backend_kind: Option<crate::model::BackendKind>) -> Result<bool>;

    async fn list_requests(&self, filter: RequestFilter, limit: i64, offset: i64, order_by: OrderBy, desc: bool) -> Result<Vec<Request>>;

    /// Returns up to `limit` `queued` requests ordered by
    /// `(priority DESC, created_at ASC)`.
    async fn get_pending_requests(&self, limit: i64) -> Result<Vec<Request>>;

    /// Succeeds only if the current status is `queued` or `processing`.
    async fn cancel_request(&self, id: RequestId) -> Result<bool>;

    /// Upsert keyed on `request_id`.
    async fn save_response(&self, resp: &Response) -> Result<()>;

    async fn get_response(&self, id: RequestId) -> Result<Option<Response>>;

    async fn update_provider_status(&self, info: &ProviderStatus) -> Result<()>;

    async fn get_provider_status(&self, name: &str) -> Result<Option<ProviderStatus>>;

    async fn list_provider_statuses(&self) -> Result<Vec<ProviderStatus>>;

    async fn record_metric(&self, event: &MetricEvent) -> Result<()>;

    async fn get_provider_metrics(&self, name: &str, hours: i64) -> Result<ProviderMetricsSummary>;

    /// Returns the number of rows deleted.
    async fn cleanup_old_requests(&self, max_age_hours: i64) -> Result<u64>;

    async fn cleanup_old_metrics(&self, max_age_hours: i64) -> Result<u64>;

    async fn cleanup_old_discussions(&self, max_age_hours: i64) -> Result<u64>;

    async fn create_discussion_session(&self, session: &DiscussionSession) -> Result<()>;

    async fn get_discussion_session(&self, id: SessionId) -> Result<Option<DiscussionSession>>;

    async fn update_discussion_session(&self, id: SessionId, update: DiscussionSessionUpdate) -> Result<()>;

    async fn create_discussion_message(&self, message: &DiscussionMessage) -> Result<()>;

    async fn update_discussion_message(&self, id: crate::ids::MessageId, update: DiscussionMessageUpdate) -> Result<()>;

    async fn get_discussion_messages(&self, session_id: SessionId, filter: DiscussionMessageFilter) -> Result<Vec<DiscussionMessage>>;
}
