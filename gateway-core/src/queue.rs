//! Request Queue (§4.B): a bounded priority FIFO layered over [`Storage`].
//!
//! The queue's canonical ordering lives in memory (a binary heap keyed on
//! `(priority, created_at)`); the store is the durable record. On startup the
//! in-memory heap is rebuilt by scanning the store for non-terminal rows,
//! with any request found `processing` reset to `queued` since the worker
//! that owned it is gone.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::ids::RequestId;
use crate::model::{Request, RequestStatus};
use crate::storage::Storage;

#[derive(Debug, Clone, Eq, PartialEq)]
struct QueueEntry {
    priority: i32,
    created_at: DateTime<Utc>,
    id: RequestId,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Snapshot of queue/worker occupancy (§4.B `stats()`).
#[derive(Debug, Clone, Default)]
pub struct QueueStats {
    pub queue_depth: u64,
    pub processing_count: u64,
    pub by_provider: HashMap<String, u64>,
}

/// The in-process priority queue described in §4.B, backed by `storage` for
/// durability and restart recovery.
pub struct RequestQueue<S: Storage> {
    storage: Arc<S>,
    heap: RwLock<BinaryHeap<QueueEntry>>,
    pending_by_provider: RwLock<HashMap<String, u64>>,
    processing_count: AtomicI64,
    max_queue_size: usize,
    notify: Notify,
    in_flight_providers: RwLock<HashMap<RequestId, String>>,
    total_pending: AtomicUsize,
    /// One cancellation token per in-flight request, so `cancel()` on a
    /// `processing` request can signal the worker driving it to abort its
    /// backend call (§5 cancellation discipline).
    in_flight_tokens: RwLock<HashMap<RequestId, CancellationToken>>,
}

impl<S: Storage> RequestQueue<S> {
    pub fn new(storage: Arc<S>, max_queue_size: usize) -> Self {
        Self {
            storage,
            heap: RwLock::new(BinaryHeap::new()),
            pending_by_provider: RwLock::new(HashMap::new()),
            processing_count: AtomicI64::new(0),
            max_queue_size,
            notify: Notify::new(),
            in_flight_providers: RwLock::new(HashMap::new()),
            total_pending: AtomicUsize::new(0),
            in_flight_tokens: RwLock::new(HashMap::new()),
        }
    }

    /// Rebuilds the in-memory heap from durable state. Requests left
    /// `processing` by a crashed worker are reset to `queued` first.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<()> {
        let stuck = self
            .storage
            .list_requests(
                crate::model::RequestFilter { status: Some(RequestStatus::Processing), provider: None },
                i64::MAX,
                0,
                crate::model::OrderBy::CreatedAt,
                false,
            )
            .await?;
        for r in &stuck {
            tracing::warn!(request_id = %r.id, "resetting stuck processing request to queued on recovery");
            self.storage.update_request_status(r.id, RequestStatus::Queued, None).await?;
        }

        let queued = self
            .storage
            .get_pending_requests(i64::MAX)
            .await?;
        let mut heap = self.heap.write().await;
        let mut by_provider = self.pending_by_provider.write().await;
        for r in stuck.into_iter().chain(queued.into_iter()) {
            *by_provider.entry(r.provider.clone()).or_insert(0) += 1;
            heap.push(QueueEntry { priority: r.priority, created_at: r.created_at, id: r.id });
        }
        self.total_pending.store(heap.len(), AtomicOrdering::Relaxed);
        if !heap.is_empty() {
            self.notify.notify_waiters();
        }
        Ok(())
    }

    /// Persists `r` as `queued` and places it in the in-memory heap. Fails
    /// with [`Error::QueueFull`] if pending + in-flight would exceed
    /// `max_queue_size`.
    #[tracing::instrument(skip(self, r), fields(request_id = %r.id, provider = %r.provider))]
    pub async fn enqueue(&self, r: Request) -> Result<()> {
        let pending = self.total_pending.load(AtomicOrdering::Relaxed);
        let processing = self.processing_count.load(AtomicOrdering::Relaxed).max(0) as usize;
        if pending + processing >= self.max_queue_size {
            return Err(Error::QueueFull(self.max_queue_size));
        }

        self.storage.create_request(&r).await?;

        let mut heap = self.heap.write().await;
        let mut by_provider = self.pending_by_provider.write().await;
        *by_provider.entry(r.provider.clone()).or_insert(0) += 1;
        heap.push(QueueEntry { priority: r.priority, created_at: r.created_at, id: r.id });
        self.total_pending.fetch_add(1, AtomicOrdering::Relaxed);
        drop(heap);
        drop(by_provider);

        self.notify.notify_one();
        Ok(())
    }

    /// Pops the highest-priority queued request, marks it `processing` in
    /// the store, and returns it. Blocks until one is available.
    #[tracing::instrument(skip(self))]
    pub async fn next(&self) -> Option<Request> {
        loop {
            let popped = {
                let mut heap = self.heap.write().await;
                heap.pop()
            };

            let Some(entry) = popped else {
                self.notify.notified().await;
                continue;
            };

            self.total_pending.fetch_sub(1, AtomicOrdering::Relaxed);

            // Look up the full request; it may have been cancelled already.
            let Ok(Some(request)) = self.storage.get_request(entry.id).await else {
                continue;
            };
            if request.status != RequestStatus::Queued {
                continue;
            }

            {
                let mut by_provider = self.pending_by_provider.write().await;
                if let Some(count) = by_provider.get_mut(&request.provider) {
                    *count = count.saturating_sub(1);
                }
            }

            match self.storage.update_request_status(entry.id, RequestStatus::Processing, None).await {
                Ok(true) => {}
                Ok(false) | Err(_) => continue,
            }

            self.processing_count.fetch_add(1, AtomicOrdering::Relaxed);
            self.in_flight_providers.write().await.insert(entry.id, request.provider.clone());
            self.in_flight_tokens.write().await.insert(entry.id, CancellationToken::new());

            let mut refreshed = request;
            refreshed.status = RequestStatus::Processing;
            return Some(refreshed);
        }
    }

    /// Returns the cancellation token a worker should race its backend call
    /// against, if `id` is currently in flight.
    pub async fn cancellation_token(&self, id: RequestId) -> Option<CancellationToken> {
        self.in_flight_tokens.read().await.get(&id).cloned()
    }

    /// Frees the concurrency slot held by `id`. Call once terminal status
    /// and response have been written.
    pub async fn mark_completed(&self, id: RequestId) {
        if self.in_flight_providers.write().await.remove(&id).is_some() {
            self.processing_count.fetch_sub(1, AtomicOrdering::Relaxed);
        }
        self.in_flight_tokens.write().await.remove(&id);
    }

    /// Cancels `id`. A purely-queued entry is left in the heap: `next()`
    /// re-checks status and silently skips anything no longer `queued`. A
    /// `processing` entry instead has its cancellation token fired, which
    /// the owning worker races its backend call against.
    pub async fn cancel(&self, id: RequestId) -> Result<bool> {
        let Some(before) = self.storage.get_request(id).await? else {
            return Ok(false);
        };
        let was_queued = before.status == RequestStatus::Queued;
        let was_processing = before.status == RequestStatus::Processing;

        let cancelled = self.storage.cancel_request(id).await?;
        if !cancelled {
            return Ok(false);
        }

        if was_queued {
            self.total_pending.fetch_sub(1, AtomicOrdering::Relaxed);
            let mut by_provider = self.pending_by_provider.write().await;
            if let Some(count) = by_provider.get_mut(&before.provider) {
                *count = count.saturating_sub(1);
            }
        } else if was_processing {
            if let Some(token) = self.in_flight_tokens.read().await.get(&id) {
                token.cancel();
            }
        }

        Ok(cancelled)
    }

    pub async fn stats(&self) -> QueueStats {
        QueueStats {
            queue_depth: self.total_pending.load(AtomicOrdering::Relaxed) as u64,
            processing_count: self.processing_count.load(AtomicOrdering::Relaxed).max(0) as u64,
            by_provider: self.pending_by_provider.read().await.clone(),
        }
    }

    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::postgres::PostgresStorage;

    // Store-backed behavior (enqueue/next/cancel/recover) is exercised in
    // `#[sqlx::test]`s under `gateway-core/tests/queue.rs`, which provision a
    // real Postgres database per test. Pure ordering logic is covered here.

    #[test]
    fn queue_entry_orders_by_priority_then_earlier_created_at() {
        let now = Utc::now();
        let high = QueueEntry { priority: 90, created_at: now, id: RequestId::new() };
        let low = QueueEntry { priority: 10, created_at: now, id: RequestId::new() };
        assert!(high > low);

        let earlier = QueueEntry { priority: 50, created_at: now - chrono::Duration::seconds(5), id: RequestId::new() };
        let later = QueueEntry { priority: 50, created_at: now, id: RequestId::new() };
        assert!(earlier > later, "equal priority: earlier created_at should sort first (max-heap pop order)");
    }

    #[allow(dead_code)]
    fn _type_check(_s: Arc<PostgresStorage>) {}
}
