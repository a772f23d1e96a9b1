//! Data model: requests, responses, provider status, metrics, and
//! discussion sessions/messages.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{MessageId, RequestId, SessionId};

/// Opaque metadata bag carried on several records. Kept as a JSON object
/// rather than a typed struct since callers may attach arbitrary tags.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// The kind of backend that services a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Http,
    Cli,
    CliInteractive,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BackendKind::Http => "http",
            BackendKind::Cli => "cli",
            BackendKind::CliInteractive => "cli_interactive",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of a [`Request`]. Transitions are monotonic: once a
/// terminal variant is reached, no further transition is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Queued,
    Processing,
    Completed,
    Failed,
    Timeout,
    Cancelled,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Failed | RequestStatus::Timeout | RequestStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestStatus::Queued => "queued",
            RequestStatus::Processing => "processing",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Timeout => "timeout",
            RequestStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work submitted against one provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub provider: String,
    pub message: String,
    /// 0-100, higher dispatches earlier.
    pub priority: i32,
    pub timeout_s: u64,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub routed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub backend_kind: Option<BackendKind>,
    pub metadata: Option<Metadata>,
}

impl Request {
    pub fn new(provider: impl Into<String>, message: impl Into<String>, priority: i32, timeout_s: u64) -> Self {
        let now = Utc::now();
        Self {
            id: RequestId::new(),
            provider: provider.into(),
            message: message.into(),
            priority,
            timeout_s,
            status: RequestStatus::Queued,
            created_at: now,
            updated_at: now,
            routed_at: None,
            started_at: None,
            completed_at: None,
            backend_kind: None,
            metadata: None,
        }
    }
}

/// The 1:1 terminal outcome of a [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub request_id: RequestId,
    pub status: RequestStatus,
    pub response: Option<String>,
    pub error: Option<String>,
    pub provider: String,
    pub latency_ms: f64,
    pub tokens_used: Option<u64>,
    pub metadata: Option<Metadata>,
}

/// Liveness classification for a configured provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unavailable,
    Unknown,
}

impl std::fmt::Display for ProviderHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProviderHealth::Healthy => "healthy",
            ProviderHealth::Degraded => "degraded",
            ProviderHealth::Unavailable => "unavailable",
            ProviderHealth::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// A provider's current standing, owned exclusively by the health monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderStatus {
    pub name: String,
    pub backend_kind: BackendKind,
    pub status: ProviderHealth,
    pub queue_depth: u64,
    pub avg_latency_ms: f64,
    pub success_rate: f64,
    pub last_check: Option<DateTime<Utc>>,
    pub enabled: bool,
    pub priority: i32,
    pub rate_limit_rpm: Option<u32>,
    pub timeout_s: u64,
}

/// An append-only observation recorded by the dispatch loop or health
/// monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub provider: String,
    pub request_id: Option<RequestId>,
    pub event_type: String,
    pub latency_ms: Option<f64>,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated metrics for a provider over a rolling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderMetricsSummary {
    pub provider: String,
    pub count: u64,
    pub successes: u64,
    pub avg_latency_ms: f64,
    pub max_latency_ms: f64,
    pub min_latency_ms: f64,
}

/// Status of a [`DiscussionSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscussionStatus {
    Pending,
    Round1,
    Round2,
    Round3,
    Summarizing,
    Completed,
    Failed,
    Cancelled,
}

impl DiscussionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, DiscussionStatus::Completed | DiscussionStatus::Failed | DiscussionStatus::Cancelled)
    }
}

impl std::fmt::Display for DiscussionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DiscussionStatus::Pending => "pending",
            DiscussionStatus::Round1 => "round_1",
            DiscussionStatus::Round2 => "round_2",
            DiscussionStatus::Round3 => "round_3",
            DiscussionStatus::Summarizing => "summarizing",
            DiscussionStatus::Completed => "completed",
            DiscussionStatus::Failed => "failed",
            DiscussionStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Per-session configuration for the discussion orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionConfig {
    pub provider_timeout_s: u64,
    pub summary_provider: Option<String>,
}

impl Default for DiscussionConfig {
    fn default() -> Self {
        Self { provider_timeout_s: 60, summary_provider: None }
    }
}

/// A multi-round collaborative discussion across several providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionSession {
    pub id: SessionId,
    pub topic: String,
    pub providers: Vec<String>,
    pub config: DiscussionConfig,
    pub status: DiscussionStatus,
    pub current_round: u8,
    pub summary: Option<String>,
    pub parent_session_id: Option<SessionId>,
    pub metadata: Option<Metadata>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiscussionSession {
    pub fn new(topic: impl Into<String>, providers: Vec<String>, config: DiscussionConfig, parent_session_id: Option<SessionId>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::new(),
            topic: topic.into(),
            providers,
            config,
            status: DiscussionStatus::Pending,
            current_round: 0,
            summary: None,
            parent_session_id,
            metadata: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// The kind of contribution a [`DiscussionMessage`] represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Proposal,
    Review,
    Revision,
    Summary,
}

/// Status of a single provider's contribution within a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Completed,
    Failed,
    Timeout,
}

/// One provider's contribution to one round of a discussion. Round 0 is
/// reserved for the final summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscussionMessage {
    pub id: MessageId,
    pub session_id: SessionId,
    pub round_number: u8,
    pub provider: String,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub references: Vec<MessageId>,
    pub status: MessageStatus,
    pub latency_ms: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl DiscussionMessage {
    pub fn new_pending(session_id: SessionId, round_number: u8, provider: impl Into<String>, kind: MessageKind) -> Self {
        Self {
            id: MessageId::new(),
            session_id,
            round_number,
            provider: provider.into(),
            kind,
            content: None,
            references: Vec::new(),
            status: MessageStatus::Pending,
            latency_ms: None,
            created_at: Utc::now(),
        }
    }
}

/// Filter for [`crate::storage::Storage::list_requests`].
#[derive(Debug, Clone, Default)]
pub struct RequestFilter {
    pub status: Option<RequestStatus>,
    pub provider: Option<String>,
}

/// Whitelisted ordering columns for `list_requests`, preventing SQL
/// injection through a free-form `order_by` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderBy {
    CreatedAt,
    UpdatedAt,
    Priority,
}

/// Optional field updates for a discussion session.
#[derive(Debug, Clone, Default)]
pub struct DiscussionSessionUpdate {
    pub status: Option<DiscussionStatus>,
    pub current_round: Option<u8>,
    pub summary: Option<String>,
    pub metadata: Option<Metadata>,
}

/// Optional field updates for a discussion message.
#[derive(Debug, Clone, Default)]
pub struct DiscussionMessageUpdate {
    pub content: Option<String>,
    pub status: Option<MessageStatus>,
    pub latency_ms: Option<f64>,
}

/// Filter for [`crate::storage::Storage::get_discussion_messages`].
#[derive(Debug, Clone, Default)]
pub struct DiscussionMessageFilter {
    pub round_number: Option<u8>,
    pub provider: Option<String>,
}

/// Queue and worker occupancy snapshot, grouped by provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_depth: u64,
    pub processing_count: u64,
    pub by_provider: HashMap<String, u64>,
}
