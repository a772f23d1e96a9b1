//! Store-backed discussion orchestrator behavior (§8 "Discussion invariants")
//! against a real Postgres database, using mock backends with triggerable
//! failure instead of real HTTP/CLI providers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_core::backend::{Backend, BackendResult, FailureKind};
use gateway_core::discussion::DiscussionOrchestrator;
use gateway_core::events::EventBus;
use gateway_core::ids::SessionId;
use gateway_core::model::{BackendKind, DiscussionConfig, DiscussionMessageFilter, DiscussionStatus, MessageKind, MessageStatus, Request};
use gateway_core::storage::postgres::PostgresStorage;
use gateway_core::storage::Storage;

/// A backend whose response is fixed and whose call count is observable,
/// used to assert on prompt contents and round fan-out.
struct MockBackend {
    response: String,
    calls: AtomicUsize,
    fail_always: bool,
    delay: Option<Duration>,
}

impl MockBackend {
    fn ok(response: impl Into<String>) -> Self {
        Self { response: response.into(), calls: AtomicUsize::new(0), fail_always: false, delay: None }
    }

    fn failing() -> Self {
        Self { response: String::new(), calls: AtomicUsize::new(0), fail_always: true, delay: None }
    }

    fn slow(response: impl Into<String>, delay: Duration) -> Self {
        Self { response: response.into(), calls: AtomicUsize::new(0), fail_always: false, delay: Some(delay) }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn execute(&self, _request: &Request) -> BackendResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_always {
            return BackendResult::err("mock failure", FailureKind::ProtocolError, 1.0);
        }
        BackendResult::ok(self.response.clone(), 1.0)
    }

    async fn health_check(&self) -> bool {
        true
    }

    async fn shutdown(&self) {}

    fn kind(&self) -> BackendKind {
        BackendKind::Http
    }
}

fn registry(backends: Vec<(&str, Arc<dyn Backend>)>) -> HashMap<String, Arc<dyn Backend>> {
    backends.into_iter().map(|(name, b)| (name.to_string(), b)).collect()
}

async fn wait_for_terminal<S: Storage>(storage: &Arc<S>, id: SessionId) -> gateway_core::model::DiscussionSession {
    for _ in 0..200 {
        if let Some(session) = storage.get_discussion_session(id).await.unwrap() {
            if session.status.is_terminal() {
                return session;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("discussion session {id} did not reach a terminal state in time");
}

#[sqlx::test]
async fn three_providers_all_succeed_reaches_completed_with_full_message_counts(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let events = EventBus::new();
    let backends = registry(vec![
        ("a", Arc::new(MockBackend::ok("a says hello")) as Arc<dyn Backend>),
        ("b", Arc::new(MockBackend::ok("b says hello"))),
        ("c", Arc::new(MockBackend::ok("c says hello"))),
    ]);
    let orchestrator = DiscussionOrchestrator::new(storage.clone(), events, backends);

    let id = orchestrator
        .start("should rust use GC".to_string(), vec!["a".to_string(), "b".to_string(), "c".to_string()], DiscussionConfig::default())
        .await
        .unwrap();

    let session = wait_for_terminal(&storage, id).await;
    assert_eq!(session.status, DiscussionStatus::Completed);
    assert!(session.summary.is_some());

    for round in 1..=3u8 {
        let messages = storage.get_discussion_messages(id, DiscussionMessageFilter { round_number: Some(round), provider: None }).await.unwrap();
        assert_eq!(messages.len(), 3, "round {round} should have one message per provider");
        assert!(messages.iter().all(|m| m.status == MessageStatus::Completed));
    }

    let summaries = storage.get_discussion_messages(id, DiscussionMessageFilter { round_number: Some(0), provider: None }).await.unwrap();
    assert_eq!(summaries.len(), 1, "exactly one round-0 summary message should exist");
    assert_eq!(summaries[0].kind, MessageKind::Summary);
    assert_eq!(summaries[0].content.as_deref(), session.summary.as_deref());
}

#[sqlx::test]
async fn partial_failure_in_round_one_still_reaches_completed(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let events = EventBus::new();
    let backends = registry(vec![
        ("a", Arc::new(MockBackend::ok("a's proposal")) as Arc<dyn Backend>),
        ("b", Arc::new(MockBackend::failing())),
        ("c", Arc::new(MockBackend::ok("c's proposal"))),
    ]);
    let orchestrator = DiscussionOrchestrator::new(storage.clone(), events, backends);

    let id = orchestrator
        .start("partial failure topic".to_string(), vec!["a".to_string(), "b".to_string(), "c".to_string()], DiscussionConfig::default())
        .await
        .unwrap();

    let session = wait_for_terminal(&storage, id).await;
    assert_eq!(session.status, DiscussionStatus::Completed, "one provider's failure must not fail the whole session");

    let round1 = storage.get_discussion_messages(id, DiscussionMessageFilter { round_number: Some(1), provider: None }).await.unwrap();
    assert_eq!(round1.len(), 3, "round 1 attempts every provider even if one fails");
    let b_message = round1.iter().find(|m| m.provider == "b").unwrap();
    assert_eq!(b_message.status, MessageStatus::Failed);

    // Round 3 (revision) must skip "b" since it produced no round-1 content.
    let round3 = storage.get_discussion_messages(id, DiscussionMessageFilter { round_number: Some(3), provider: None }).await.unwrap();
    assert_eq!(round3.len(), 2, "round 3 runs only for providers with round-1 content");
    assert!(round3.iter().all(|m| m.provider != "b"));

    let summaries = storage.get_discussion_messages(id, DiscussionMessageFilter { round_number: Some(0), provider: None }).await.unwrap();
    assert_eq!(summaries.len(), 1);
}

#[sqlx::test]
async fn cancel_during_a_round_prevents_further_round_messages(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let events = EventBus::new();
    let backends = registry(vec![
        ("a", Arc::new(MockBackend::slow("a's slow proposal", Duration::from_millis(300))) as Arc<dyn Backend>),
        ("b", Arc::new(MockBackend::slow("b's slow proposal", Duration::from_millis(300)))),
    ]);
    let orchestrator = DiscussionOrchestrator::new(storage.clone(), events, backends);

    let id = orchestrator.start("cancel me".to_string(), vec!["a".to_string(), "b".to_string()], DiscussionConfig::default()).await.unwrap();

    // Cancel almost immediately, well before round 1's slow backends return.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let cancelled = orchestrator.cancel(id).await.unwrap();
    assert!(cancelled);

    // Give the in-flight round time to observe cancellation and stop.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let session = storage.get_discussion_session(id).await.unwrap().unwrap();
    assert_eq!(session.status, DiscussionStatus::Cancelled);

    let round2 = storage.get_discussion_messages(id, DiscussionMessageFilter { round_number: Some(2), provider: None }).await.unwrap();
    assert!(round2.is_empty(), "no round-2 messages should be created after cancellation");
    let round3 = storage.get_discussion_messages(id, DiscussionMessageFilter { round_number: Some(3), provider: None }).await.unwrap();
    assert!(round3.is_empty(), "no round-3 messages should be created after cancellation");
}

#[sqlx::test]
async fn summary_failure_marks_the_session_failed(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let events = EventBus::new();
    // "a" is also the summary provider and always fails, so summarization
    // itself fails even though rounds 1-3 succeeded for "b".
    let backends = registry(vec![
        ("a", Arc::new(MockBackend::failing()) as Arc<dyn Backend>),
        ("b", Arc::new(MockBackend::ok("b's content"))),
    ]);
    let orchestrator = DiscussionOrchestrator::new(storage.clone(), events, backends);

    let config = DiscussionConfig { provider_timeout_s: 60, summary_provider: Some("a".to_string()) };
    let id = orchestrator.start("summary failure topic".to_string(), vec!["a".to_string(), "b".to_string()], config).await.unwrap();

    let session = wait_for_terminal(&storage, id).await;
    assert_eq!(session.status, DiscussionStatus::Failed);
    assert!(session.summary.is_none());
}

#[sqlx::test]
async fn continue_discussion_requires_a_completed_parent(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let events = EventBus::new();
    let backends = registry(vec![
        ("a", Arc::new(MockBackend::slow("slow", Duration::from_secs(5))) as Arc<dyn Backend>),
        ("b", Arc::new(MockBackend::slow("slow", Duration::from_secs(5)))),
    ]);
    let orchestrator = DiscussionOrchestrator::new(storage.clone(), events, backends);

    let parent_id = orchestrator.start("parent topic".to_string(), vec!["a".to_string(), "b".to_string()], DiscussionConfig::default()).await.unwrap();

    // Parent is still pending/round_1 (backends are deliberately slow).
    let err = orchestrator.continue_discussion(parent_id, None, None).await.unwrap_err();
    assert!(matches!(err, gateway_core::Error::ParentSessionNotCompleted(_)));
}

#[sqlx::test]
async fn start_rejects_fewer_than_two_providers(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let events = EventBus::new();
    let backends = registry(vec![("a", Arc::new(MockBackend::ok("hi")) as Arc<dyn Backend>)]);
    let orchestrator = DiscussionOrchestrator::new(storage, events, backends);

    let err = orchestrator.start("solo".to_string(), vec!["a".to_string()], DiscussionConfig::default()).await.unwrap_err();
    assert!(matches!(err, gateway_core::Error::InvalidArgument(_)));
}

#[sqlx::test]
async fn start_rejects_unknown_provider(pool: sqlx::PgPool) {
    let storage = Arc::new(PostgresStorage::new(pool));
    let events = EventBus::new();
    let backends = registry(vec![("a", Arc::new(MockBackend::ok("hi")) as Arc<dyn Backend>)]);
    let orchestrator = DiscussionOrchestrator::new(storage, events, backends);

    let err = orchestrator.start("topic".to_string(), vec!["a".to_string(), "nope".to_string()], DiscussionConfig::default()).await.unwrap_err();
    assert!(matches!(err, gateway_core::Error::UnknownProvider(p) if p == "nope"));
}
