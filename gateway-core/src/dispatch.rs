//! Dispatch Loop (§4.F): a fixed-size worker pool driving the queue.
//!
//! Each worker repeats: pull the next request, look up its backend, run it
//! under a hard deadline, persist the terminal outcome, and emit events.
//! Retries are never performed here — a failed request stays failed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendResult};
use crate::events::{preview, Event, EventBus};
use crate::model::{BackendKind, MetricEvent, Request, RequestStatus, Response};
use crate::queue::RequestQueue;
use crate::storage::Storage;

const RESPONSE_PREVIEW_CHARS: usize = 100;

enum Outcome {
    Finished(Result<BackendResult, tokio::time::error::Elapsed>),
    Cancelled,
}

/// Resolves only if a cancellation token exists and fires; never resolves
/// for a request with no token (e.g. unreachable, kept for symmetry).
async fn wait_for_cancel(token: &Option<CancellationToken>) {
    match token {
        Some(t) => t.cancelled().await,
        None => std::future::pending().await,
    }
}

/// Owns the worker pool. `backends` maps provider name to its constructed
/// backend; a provider with no entry (unknown or failed to construct) or
/// whose config marks it disabled is a synthetic, immediate failure.
pub struct DispatchLoop<S: Storage> {
    storage: Arc<S>,
    queue: Arc<RequestQueue<S>>,
    events: EventBus,
    backends: HashMap<String, Arc<dyn Backend>>,
    /// Provider -> `[command, ...args]` prefix, used only to build the
    /// `cli_executing` command preview (first three argv tokens, §11).
    cli_argv_prefix: HashMap<String, Vec<String>>,
    worker_count: usize,
}

impl<S: Storage> DispatchLoop<S> {
    pub fn new(
        storage: Arc<S>,
        queue: Arc<RequestQueue<S>>,
        events: EventBus,
        backends: HashMap<String, Arc<dyn Backend>>,
        cli_argv_prefix: HashMap<String, Vec<String>>,
        worker_count: usize,
    ) -> Self {
        Self { storage, queue, events, backends, cli_argv_prefix, worker_count }
    }

    /// Spawns `worker_count` workers and returns once all have exited
    /// (i.e. after `cancel` fires and in-flight calls drain).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut set = tokio::task::JoinSet::new();
        for worker_id in 0..self.worker_count {
            let this = self.clone();
            let cancel = cancel.clone();
            set.spawn(async move { this.worker_loop(worker_id, cancel).await });
        }
        while set.join_next().await.is_some() {}
    }

    async fn worker_loop(&self, worker_id: usize, cancel: CancellationToken) {
        loop {
            let request = tokio::select! {
                _ = cancel.cancelled() => return,
                next = self.queue.next() => match next {
                    Some(r) => r,
                    None => return, // queue shut down
                },
            };
            tracing::debug!(worker_id, request_id = %request.id, provider = %request.provider, "dispatching request");
            self.process(request).await;
        }
    }

    async fn process(&self, mut request: Request) {
        self.events.publish(Event::new(
            "request_processing",
            json!({"request_id": request.id.to_string(), "provider": request.provider}),
        ));

        let Some(backend) = self.backends.get(&request.provider) else {
            self.finish_synthetic(&request, format!("unknown or disabled provider: {}", request.provider)).await;
            return;
        };
        // Recorded on the terminal write so the persisted request reflects
        // which backend actually serviced it (§3 Request.backend_kind).
        request.backend_kind = Some(backend.kind());

        if let BackendKind::Cli | BackendKind::CliInteractive = backend.kind() {
            if let Some(prefix) = self.cli_argv_prefix.get(&request.provider) {
                let mut argv = prefix.clone();
                argv.push(request.message.clone());
                self.events.publish(Event::new(
                    "cli_executing",
                    json!({
                        "request_id": request.id.to_string(),
                        "provider": request.provider,
                        "command_preview": crate::backend::cli::command_preview(&argv),
                    }),
                ));
            }
        }

        let deadline = Duration::from_secs(request.timeout_s);
        let start = Instant::now();
        let cancel_token = self.queue.cancellation_token(request.id).await;

        let outcome = tokio::select! {
            res = tokio::time::timeout(deadline, backend.execute(&request)) => Outcome::Finished(res),
            _ = wait_for_cancel(&cancel_token) => Outcome::Cancelled,
        };

        let (status, response) = match outcome {
            Outcome::Cancelled => {
                // First-writer-wins: if the backend call had already
                // completed and written a terminal status, this becomes a
                // no-op at the store layer.
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                let resp = Response {
                    request_id: request.id,
                    status: RequestStatus::Cancelled,
                    response: None,
                    error: None,
                    provider: request.provider.clone(),
                    latency_ms: latency,
                    tokens_used: None,
                    metadata: None,
                };
                (RequestStatus::Cancelled, resp)
            }
            Outcome::Finished(Ok(result)) if result.success => {
                let resp = Response {
                    request_id: request.id,
                    status: RequestStatus::Completed,
                    response: result.response,
                    error: None,
                    provider: request.provider.clone(),
                    latency_ms: result.latency_ms,
                    tokens_used: result.tokens_used,
                    metadata: None,
                };
                (RequestStatus::Completed, resp)
            }
            Outcome::Finished(Ok(result)) => {
                let resp = Response {
                    request_id: request.id,
                    status: RequestStatus::Failed,
                    response: None,
                    error: result.error,
                    provider: request.provider.clone(),
                    latency_ms: result.latency_ms,
                    tokens_used: None,
                    metadata: None,
                };
                (RequestStatus::Failed, resp)
            }
            Outcome::Finished(Err(_)) => {
                // The dispatcher's own deadline fired before the backend
                // returned. The backend call is abandoned (dropped); CLI
                // backends rely on their own inner timeout to have already
                // killed the child by the time this outer deadline is this
                // close, but either way this classifies the request.
                let latency = start.elapsed().as_secs_f64() * 1000.0;
                let resp = Response {
                    request_id: request.id,
                    status: RequestStatus::Timeout,
                    response: None,
                    error: Some(format!("timed out after {}s", request.timeout_s)),
                    provider: request.provider.clone(),
                    latency_ms: latency,
                    tokens_used: None,
                    metadata: None,
                };
                (RequestStatus::Timeout, resp)
            }
        };

        self.finish(&request, status, response).await;
    }

    async fn finish_synthetic(&self, request: &Request, error: String) {
        let resp = Response {
            request_id: request.id,
            status: RequestStatus::Failed,
            response: None,
            error: Some(error),
            provider: request.provider.clone(),
            latency_ms: 0.0,
            tokens_used: None,
            metadata: None,
        };
        self.finish(request, RequestStatus::Failed, resp).await;
    }

    async fn finish(&self, request: &Request, status: RequestStatus, response: Response) {
        // Cancellation races here: if the request was cancelled while the
        // backend call was in flight, the store's monotonic terminal-state
        // guard makes whichever write landed first win; the later one is a
        // silent no-op (§5 cancellation discipline). `update_request_status`
        // returns `false` precisely when some other terminal write already
        // beat this one, in which case the response/metric/event below must
        // also be skipped — otherwise the `responses` row would disagree
        // with the `requests` row's terminal status.
        let applied = match self.storage.update_request_status(request.id, status, request.backend_kind).await {
            Ok(applied) => applied,
            Err(e) => {
                tracing::error!(request_id = %request.id, error = %e, "store error persisting terminal status, leaving request for replay");
                self.queue.mark_completed(request.id).await;
                return;
            }
        };
        if !applied {
            tracing::debug!(request_id = %request.id, "terminal write lost the first-writer-wins race, discarding this outcome");
            self.queue.mark_completed(request.id).await;
            return;
        }
        if let Err(e) = self.storage.save_response(&response).await {
            tracing::error!(request_id = %request.id, error = %e, "store error saving response");
        }

        // Cancellation is user-initiated, not a failure: it is excluded from
        // success-rate metrics entirely (§7 error handling design).
        if status != RequestStatus::Cancelled {
            let metric = MetricEvent {
                provider: request.provider.clone(),
                request_id: Some(request.id),
                event_type: "dispatch".to_string(),
                latency_ms: Some(response.latency_ms),
                success: status == RequestStatus::Completed,
                error: response.error.clone(),
                timestamp: Utc::now(),
            };
            if let Err(e) = self.storage.record_metric(&metric).await {
                tracing::warn!(request_id = %request.id, error = %e, "failed to record dispatch metric");
            }
        }

        let event_type = match status {
            RequestStatus::Completed => "request_completed",
            RequestStatus::Cancelled => "request_cancelled",
            _ => "request_failed",
        };
        self.events.publish(Event::new(
            event_type,
            json!({
                "request_id": request.id.to_string(),
                "provider": request.provider,
                "status": status.to_string(),
                "latency_ms": response.latency_ms,
                "response_preview": response.response.as_deref().map(|r| preview(r, RESPONSE_PREVIEW_CHARS)),
                "error": response.error,
            }),
        ));

        self.queue.mark_completed(request.id).await;
    }
}
