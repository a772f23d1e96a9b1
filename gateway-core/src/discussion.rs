//! Discussion Orchestrator (§4.G): a fixed three-round state machine that
//! fans multiple backends out per round (propose → review → revise) and
//! then synthesizes the result.
//!
//! Per-provider backend calls bypass the request queue entirely: a round's
//! wall-clock is `max(provider latencies)`, not gated by
//! `max_concurrent_requests`, and one provider's failure never aborts its
//! siblings in the same round (§9 open question #2).

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::backend::Backend;
use crate::error::{Error, Result};
use crate::events::{preview, Event, EventBus};
use crate::ids::SessionId;
use crate::model::{
    DiscussionConfig, DiscussionMessage, DiscussionMessageFilter, DiscussionMessageUpdate, DiscussionSession, DiscussionSessionUpdate, DiscussionStatus,
    MessageKind, MessageStatus, Request,
};
use crate::storage::Storage;

const DISCUSSION_PREVIEW_CHARS: usize = 200;

/// Drives one or more [`DiscussionSession`]s against a registry of backends.
/// Cheap to clone: every field is an `Arc`/cloneable handle, which lets
/// `start()` spawn the actual multi-round execution as a detached task and
/// return the session id immediately.
#[derive(Clone)]
pub struct DiscussionOrchestrator<S: Storage> {
    storage: Arc<S>,
    events: EventBus,
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl<S: Storage> DiscussionOrchestrator<S> {
    pub fn new(storage: Arc<S>, events: EventBus, backends: HashMap<String, Arc<dyn Backend>>) -> Self {
        Self { storage, events, backends }
    }

    /// Creates the session record and spawns its execution in the
    /// background, returning immediately with the new session's id.
    pub async fn start(&self, topic: String, providers: Vec<String>, config: DiscussionConfig) -> Result<SessionId>
    where
        S: 'static,
    {
        self.validate_providers(&providers)?;
        let session = DiscussionSession::new(topic, providers, config, None);
        let id = session.id;
        self.storage.create_discussion_session(&session).await?;
        self.events.publish(Event::new("discussion_started", json!({"session_id": id.to_string(), "topic": session.topic})));

        let this = self.clone();
        tokio::spawn(async move {
            this.run(id).await;
        });
        Ok(id)
    }

    /// Creates a continuation session whose prompt is composed from
    /// `parent_id`'s summary and its round-3 messages. The parent must be
    /// `completed`; continuation links form a DAG by construction since a
    /// freshly created session can never be its own ancestor.
    pub async fn continue_discussion(&self, parent_id: SessionId, providers: Option<Vec<String>>, config: Option<DiscussionConfig>) -> Result<SessionId>
    where
        S: 'static,
    {
        let parent = self.storage.get_discussion_session(parent_id).await?.ok_or(Error::SessionNotFound(parent_id.0))?;
        if parent.status != DiscussionStatus::Completed {
            return Err(Error::ParentSessionNotCompleted(parent_id.0));
        }

        let round3 = self
            .storage
            .get_discussion_messages(parent_id, DiscussionMessageFilter { round_number: Some(3), provider: None })
            .await?;

        let mut topic = format!("Continuing discussion: {}\n\nPrevious summary:\n{}\n", parent.topic, parent.summary.clone().unwrap_or_default());
        for message in &round3 {
            if let Some(content) = &message.content {
                topic.push_str(&format!("\n{} (round 3): {}\n", message.provider, content));
            }
        }

        let providers = providers.unwrap_or_else(|| parent.providers.clone());
        self.validate_providers(&providers)?;
        let config = config.unwrap_or(parent.config.clone());

        let session = DiscussionSession::new(topic, providers, config, Some(parent_id));
        let id = session.id;
        self.storage.create_discussion_session(&session).await?;
        self.events.publish(Event::new(
            "discussion_continued",
            json!({"session_id": id.to_string(), "parent_session_id": parent_id.to_string()}),
        ));

        let this = self.clone();
        tokio::spawn(async move {
            this.run(id).await;
        });
        Ok(id)
    }

    /// Marks `id` cancelled if it is not already terminal. No further
    /// messages are created for a cancelled session: the running task
    /// re-checks status between rounds and stops if it finds `cancelled`.
    pub async fn cancel(&self, id: SessionId) -> Result<bool> {
        let Some(session) = self.storage.get_discussion_session(id).await? else {
            return Ok(false);
        };
        if session.status.is_terminal() {
            return Ok(false);
        }
        self.storage
            .update_discussion_session(id, DiscussionSessionUpdate { status: Some(DiscussionStatus::Cancelled), ..Default::default() })
            .await?;
        self.events.publish(Event::new("discussion_cancelled", json!({"session_id": id.to_string()})));
        Ok(true)
    }

    fn validate_providers(&self, providers: &[String]) -> Result<()> {
        if providers.len() < 2 {
            return Err(Error::InvalidArgument("a discussion session requires at least 2 providers".to_string()));
        }
        for p in providers {
            if !self.backends.contains_key(p) {
                return Err(Error::UnknownProvider(p.clone()));
            }
        }
        Ok(())
    }

    async fn is_cancelled(&self, id: SessionId) -> bool {
        matches!(self.storage.get_discussion_session(id).await, Ok(Some(s)) if s.status == DiscussionStatus::Cancelled)
    }

    /// Drives the full pending → round_1 → round_2 → round_3 → summarizing
    /// → completed state machine for `id`. Any unexpected store error
    /// aborts the session as `failed`; per-provider backend failures never
    /// do (they are folded into that provider's message status instead).
    async fn run(&self, id: SessionId) {
        if let Err(e) = self.run_inner(id).await {
            tracing::error!(session_id = %id, error = %e, "discussion session failed");
            let _ = self
                .storage
                .update_discussion_session(
                    id,
                    DiscussionSessionUpdate { status: Some(DiscussionStatus::Failed), metadata: Some(error_metadata(&e)), ..Default::default() },
                )
                .await;
            self.events.publish(Event::new("discussion_failed", json!({"session_id": id.to_string(), "error": e.to_string()})));
        }
    }

    async fn run_inner(&self, id: SessionId) -> Result<()> {
        let session = self.storage.get_discussion_session(id).await?.ok_or(Error::SessionNotFound(id.0))?;
        let topic = session.topic.clone();
        let providers = session.providers.clone();
        let config = session.config.clone();

        // Round 1: proposal.
        self.advance(id, DiscussionStatus::Round1, 1).await?;
        if self.is_cancelled(id).await {
            return Ok(());
        }
        let round1 = self
            .run_round(id, 1, &providers, MessageKind::Proposal, &config, |provider| proposal_prompt(&topic, provider))
            .await?;

        // Round 2: review. Runs for every session provider, inlining only
        // the round-1 content that actually succeeded.
        self.advance(id, DiscussionStatus::Round2, 2).await?;
        if self.is_cancelled(id).await {
            return Ok(());
        }
        let round2 = self
            .run_round(id, 2, &providers, MessageKind::Review, &config, |provider| review_prompt(&topic, provider, &round1))
            .await?;

        // Round 3: revision. Skips any provider with no round-1 content.
        self.advance(id, DiscussionStatus::Round3, 3).await?;
        if self.is_cancelled(id).await {
            return Ok(());
        }
        let round3_providers: Vec<String> = providers.iter().filter(|p| round1.contains_key(*p)).cloned().collect();
        let round3 = self
            .run_round(id, 3, &round3_providers, MessageKind::Revision, &config, |provider| revision_prompt(&topic, provider, &round1, &round2))
            .await?;

        if self.is_cancelled(id).await {
            return Ok(());
        }

        // Summarization: fatal on failure.
        self.storage
            .update_discussion_session(id, DiscussionSessionUpdate { status: Some(DiscussionStatus::Summarizing), ..Default::default() })
            .await?;
        self.events.publish(Event::new("discussion_summarizing", json!({"session_id": id.to_string()})));

        let summary_provider = config
            .summary_provider
            .clone()
            .filter(|p| self.backends.contains_key(p) && providers.contains(p))
            .or_else(|| providers.first().cloned())
            .ok_or_else(|| Error::InvalidArgument("no provider available to summarize discussion".to_string()))?;

        let transcript = render_transcript(&topic, &round1, &round2, &round3);
        let backend = self.backends.get(&summary_provider).ok_or_else(|| Error::UnknownProvider(summary_provider.clone()))?;

        let summary_message = DiscussionMessage::new_pending(id, 0, summary_provider.clone(), MessageKind::Summary);
        self.storage.create_discussion_message(&summary_message).await?;

        let summary_timeout = Duration::from_secs(config.provider_timeout_s.saturating_mul(2));
        let synthetic = Request::new(summary_provider.clone(), transcript, 0, summary_timeout.as_secs());
        let result = tokio::time::timeout(summary_timeout, backend.execute(&synthetic)).await;

        let summary_content = match result {
            Ok(r) if r.success => r.response.unwrap_or_default(),
            Ok(r) => {
                self.storage
                    .update_discussion_message(summary_message.id, DiscussionMessageUpdate { status: Some(MessageStatus::Failed), ..Default::default() })
                    .await?;
                return Err(Error::BackendFailure(r.error.unwrap_or_else(|| "summary backend failed".to_string())));
            }
            Err(_) => {
                self.storage
                    .update_discussion_message(summary_message.id, DiscussionMessageUpdate { status: Some(MessageStatus::Timeout), ..Default::default() })
                    .await?;
                return Err(Error::Timeout(summary_timeout.as_secs()));
            }
        };

        self.storage
            .update_discussion_message(
                summary_message.id,
                DiscussionMessageUpdate { content: Some(summary_content.clone()), status: Some(MessageStatus::Completed), latency_ms: None },
            )
            .await?;
        self.events.publish(Event::new(
            "discussion_summary_completed",
            json!({"session_id": id.to_string(), "preview": preview(&summary_content, DISCUSSION_PREVIEW_CHARS)}),
        ));

        self.storage
            .update_discussion_session(
                id,
                DiscussionSessionUpdate { status: Some(DiscussionStatus::Completed), summary: Some(summary_content), ..Default::default() },
            )
            .await?;
        self.events.publish(Event::new("discussion_completed", json!({"session_id": id.to_string()})));

        Ok(())
    }

    async fn advance(&self, id: SessionId, status: DiscussionStatus, round: u8) -> Result<()> {
        self.storage
            .update_discussion_session(id, DiscussionSessionUpdate { status: Some(status), current_round: Some(round), ..Default::default() })
            .await?;
        self.events.publish(Event::new("discussion_round_started", json!({"session_id": id.to_string(), "round": round})));
        Ok(())
    }

    /// Runs one round for `providers` concurrently and returns the content
    /// of every message that completed successfully (failed/timed-out
    /// providers are simply absent from the map — tolerated, not fatal).
    async fn run_round(
        &self,
        session_id: SessionId,
        round_number: u8,
        providers: &[String],
        kind: MessageKind,
        config: &DiscussionConfig,
        build_prompt: impl Fn(&str) -> String,
    ) -> Result<BTreeMap<String, String>> {
        let per_provider_timeout = Duration::from_secs(config.provider_timeout_s);

        let futs = providers.iter().map(|provider| {
            let prompt = build_prompt(provider);
            let provider = provider.clone();
            async move {
                let message = DiscussionMessage::new_pending(session_id, round_number, provider.clone(), kind);
                if let Err(e) = self.storage.create_discussion_message(&message).await {
                    tracing::error!(session_id = %session_id, provider = %provider, error = %e, "failed to create discussion message");
                    return (provider, None);
                }
                self.events.publish(Event::new(
                    "discussion_provider_started",
                    json!({"session_id": session_id.to_string(), "round": round_number, "provider": provider}),
                ));

                let Some(backend) = self.backends.get(&provider) else {
                    let _ = self
                        .storage
                        .update_discussion_message(message.id, DiscussionMessageUpdate { status: Some(MessageStatus::Failed), ..Default::default() })
                        .await;
                    return (provider, None);
                };

                let synthetic = Request::new(provider.clone(), prompt, 0, config.provider_timeout_s);
                let start = std::time::Instant::now();
                let outcome = tokio::time::timeout(per_provider_timeout, backend.execute(&synthetic)).await;
                let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

                match outcome {
                    Ok(result) if result.success => {
                        let content = result.response.unwrap_or_default();
                        let _ = self
                            .storage
                            .update_discussion_message(
                                message.id,
                                DiscussionMessageUpdate { content: Some(content.clone()), status: Some(MessageStatus::Completed), latency_ms: Some(latency_ms) },
                            )
                            .await;
                        self.events.publish(Event::new(
                            "discussion_provider_completed",
                            json!({
                                "session_id": session_id.to_string(),
                                "round": round_number,
                                "provider": provider,
                                "preview": preview(&content, DISCUSSION_PREVIEW_CHARS),
                                "length": content.chars().count(),
                            }),
                        ));
                        (provider, Some(content))
                    }
                    Ok(_) => {
                        let _ = self
                            .storage
                            .update_discussion_message(message.id, DiscussionMessageUpdate { status: Some(MessageStatus::Failed), latency_ms: Some(latency_ms) })
                            .await;
                        (provider, None)
                    }
                    Err(_) => {
                        let _ = self
                            .storage
                            .update_discussion_message(message.id, DiscussionMessageUpdate { status: Some(MessageStatus::Timeout), latency_ms: Some(latency_ms) })
                            .await;
                        (provider, None)
                    }
                }
            }
        });

        let results = futures::future::join_all(futs).await;
        self.events.publish(Event::new("discussion_round_completed", json!({"session_id": session_id.to_string(), "round": round_number})));
        Ok(results.into_iter().filter_map(|(p, content)| content.map(|c| (p, c))).collect())
    }
}

fn error_metadata(e: &Error) -> serde_json::Map<String, serde_json::Value> {
    let mut map = serde_json::Map::new();
    map.insert("error".to_string(), json!(e.to_string()));
    map
}

fn proposal_prompt(topic: &str, provider: &str) -> String {
    format!("You are {provider}, participating in a multi-model discussion.\n\nTopic: {topic}\n\nPropose your initial position on this topic.")
}

fn review_prompt(topic: &str, provider: &str, round1: &BTreeMap<String, String>) -> String {
    let mut s = format!("You are {provider}. Topic: {topic}\n\nReview the following proposals from other participants:\n");
    for (other, content) in round1 {
        if other == provider {
            continue;
        }
        s.push_str(&format!("\n--- {other}'s proposal ---\n{content}\n"));
    }
    s.push_str("\nProvide your review, noting agreements and disagreements.");
    s
}

fn revision_prompt(topic: &str, provider: &str, round1: &BTreeMap<String, String>, round2: &BTreeMap<String, String>) -> String {
    let mut s = format!("You are {provider}. Topic: {topic}\n\nYour original proposal:\n{}\n", round1.get(provider).cloned().unwrap_or_default());
    s.push_str("\nReviews from other participants:\n");
    for (other, content) in round2 {
        if other == provider {
            continue;
        }
        s.push_str(&format!("\n--- {other}'s review ---\n{content}\n"));
    }
    s.push_str("\nRevise your position in light of the above.");
    s
}

fn render_transcript(topic: &str, round1: &BTreeMap<String, String>, round2: &BTreeMap<String, String>, round3: &BTreeMap<String, String>) -> String {
    let mut s = format!("Summarize the following multi-round discussion on: {topic}\n");
    for (label, round) in [("Round 1 (proposals)", round1), ("Round 2 (reviews)", round2), ("Round 3 (revisions)", round3)] {
        s.push_str(&format!("\n=== {label} ===\n"));
        for (provider, content) in round {
            s.push_str(&format!("\n{provider}:\n{content}\n"));
        }
    }
    s.push_str("\nProduce a concise synthesis of the group's final position.");
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_prompt_omits_self_from_reviews() {
        let round1 = BTreeMap::from([("a".to_string(), "a's idea".to_string())]);
        let round2 = BTreeMap::from([("a".to_string(), "self review".to_string()), ("b".to_string(), "b's review".to_string())]);
        let prompt = revision_prompt("topic", "a", &round1, &round2);
        assert!(prompt.contains("b's review"));
        assert!(!prompt.contains("self review"));
    }

    #[test]
    fn review_prompt_omits_failed_providers() {
        let round1 = BTreeMap::from([("a".to_string(), "a's idea".to_string())]);
        let prompt = review_prompt("topic", "c", &round1);
        assert!(prompt.contains("a's idea"));
        assert!(!prompt.contains("b's"));
    }
}
