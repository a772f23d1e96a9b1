//! Event bus (§4.E): non-blocking fan-out of lifecycle events to subscribers.
//!
//! Producers never block on a slow or dead subscriber. Each subscriber owns a
//! bounded `mpsc` channel; publish uses `try_send` and drops the event for
//! any subscriber whose channel is full rather than waiting for it, mirroring
//! the "producers only write, a dedicated policy handles delivery" guidance
//! for broadcast in this codebase.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// One lifecycle event. `data` carries the event-specific payload (request
/// id, provider, preview text, etc.) as a free-form JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data, timestamp: Utc::now() }
    }
}

const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;

/// A handle to a subscriber's inbox, keyed internally by a generated id.
pub struct Subscription {
    id: u64,
    bus: Arc<EventBusInner>,
    pub receiver: mpsc::Receiver<Event>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.bus.subscribers.remove(&self.id);
    }
}

struct EventBusInner {
    subscribers: DashMap<u64, mpsc::Sender<Event>>,
    next_id: std::sync::atomic::AtomicU64,
    capacity: usize,
}

/// Cloneable handle to the bus; publish-side API.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(EventBusInner {
                subscribers: DashMap::new(),
                next_id: std::sync::atomic::AtomicU64::new(0),
                capacity,
            }),
        }
    }

    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        self.inner.subscribers.insert(id, tx);
        Subscription { id, bus: self.inner.clone(), receiver: rx }
    }

    /// Publish to every current subscriber. Never awaits; a subscriber whose
    /// channel is full silently misses this event.
    pub fn publish(&self, event: Event) {
        for entry in self.inner.subscribers.iter() {
            if let Err(mpsc::error::TrySendError::Full(_)) = entry.value().try_send(event.clone()) {
                tracing::debug!(subscriber = entry.key(), event_type = %event.kind, "dropping event for slow subscriber");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Truncates `s` to at most `max_chars` characters, matching the original's
/// plain slicing (no word-boundary trimming).
pub fn preview(s: &str, max_chars: usize) -> String {
    s.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        bus.publish(Event::new("request_submitted", json!({"id": "abc"})));

        let ea = a.receiver.recv().await.unwrap();
        let eb = b.receiver.recv().await.unwrap();
        assert_eq!(ea.kind, "request_submitted");
        assert_eq!(eb.kind, "request_submitted");
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_publish() {
        let bus = EventBus::with_capacity(1);
        let mut slow = bus.subscribe();

        bus.publish(Event::new("a", json!({})));
        // Second publish should not panic or hang even though `slow`
        // hasn't drained its single-slot channel yet.
        bus.publish(Event::new("b", json!({})));

        let first = slow.receiver.recv().await.unwrap();
        assert_eq!(first.kind, "a");
    }

    #[tokio::test]
    async fn dropped_subscription_is_removed() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe();
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn preview_truncates_by_char_count() {
        assert_eq!(preview("hello world", 5), "hello");
        assert_eq!(preview("hi", 5), "hi");
    }
}
