//! `gateway-core`: the request lifecycle engine behind the AI gateway.
//!
//! This crate owns everything storage-adjacent and provider-adjacent —
//! the durable [`storage`] contract, the in-memory [`queue`], the
//! [`backend`] abstraction over HTTP and CLI providers, the [`health`]
//! monitor, the [`dispatch`] worker pool, the [`discussion`] orchestrator,
//! and the periodic [`cleanup`] sweep — wired together by [`Engine`]. The
//! `gateway` binary crate is a thin HTTP/WebSocket skin over this.

pub mod backend;
pub mod cleanup;
pub mod config;
pub mod discussion;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod health;
pub mod ids;
pub mod model;
pub mod queue;
pub mod storage;

use std::collections::HashMap;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use backend::Backend;
use config::EngineConfig;
use discussion::DiscussionOrchestrator;
use dispatch::DispatchLoop;
use events::EventBus;
use health::HealthMonitor;
use queue::RequestQueue;
use storage::Storage;

pub use error::{Error, Result};

/// Everything the engine needs to run, composed once at startup and handed
/// to the HTTP layer for the lifetime of the process.
pub struct Engine<S: Storage> {
    pub storage: Arc<S>,
    pub queue: Arc<RequestQueue<S>>,
    pub events: EventBus,
    pub discussions: DiscussionOrchestrator<S>,
    backends: HashMap<String, Arc<dyn Backend>>,
    config: EngineConfig,
}

impl<S: Storage> Engine<S> {
    /// Builds the backend registry from `config` and wires up the queue,
    /// event bus, and discussion orchestrator. Does not start any
    /// background loop or recover in-flight state — call [`Engine::recover`]
    /// and [`Engine::spawn_background_tasks`] once the caller is ready.
    pub async fn new(storage: Arc<S>, config: EngineConfig) -> Self {
        let built = backend::build_registry(&config).await;
        let backends: HashMap<String, Arc<dyn Backend>> = built.iter().cloned().collect();
        let events = EventBus::new();
        let queue = Arc::new(RequestQueue::new(storage.clone(), config.max_queue_size));
        let discussions = DiscussionOrchestrator::new(storage.clone(), events.clone(), backends.clone());
        Self { storage, queue, events, discussions, backends, config }
    }

    /// Rebuilds the in-memory queue from durable state. Must be called
    /// before [`Engine::spawn_background_tasks`] so the dispatch workers
    /// see requests left behind by a prior process.
    pub async fn recover(&self) -> Result<()> {
        self.queue.recover().await
    }

    pub fn backend(&self, provider: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(provider).cloned()
    }

    pub fn backends(&self) -> impl Iterator<Item = (&String, &Arc<dyn Backend>)> {
        self.backends.iter()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Spawns the dispatch workers, health monitor, and cleanup loop as
    /// background tasks tied to `cancel`. Returns once all three have been
    /// spawned; the returned handles resolve when `cancel` fires and each
    /// loop has drained.
    pub fn spawn_background_tasks(&self, cancel: CancellationToken) -> EngineHandles
    where
        S: 'static,
    {
        let cli_argv_prefix = self
            .config
            .providers
            .iter()
            .filter_map(|(name, p)| match &p.backend {
                config::BackendConfig::Cli(cli) => {
                    let mut argv = vec![cli.command.clone()];
                    argv.extend(cli.args.clone());
                    Some((name.clone(), argv))
                }
                config::BackendConfig::Http(_) => None,
            })
            .collect();

        let dispatch = Arc::new(DispatchLoop::new(
            self.storage.clone(),
            self.queue.clone(),
            self.events.clone(),
            self.backends.clone(),
            cli_argv_prefix,
            self.config.max_concurrent_requests,
        ));
        let dispatch_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { dispatch.run(cancel).await })
        };

        let provider_meta: HashMap<String, config::ProviderConfig> = self.config.providers.clone();
        let backend_list: Vec<(String, Arc<dyn Backend>)> = self.backends.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        let health_monitor = HealthMonitor::new(self.storage.clone(), &backend_list, &provider_meta, self.config.health_check_interval);
        let queue = self.queue.clone();
        let health_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { health_monitor.run(queue, cancel).await })
        };

        let cleanup_loop = cleanup::CleanupLoop::new(
            self.storage.clone(),
            cleanup::CleanupConfig {
                request_ttl_hours: self.config.request_ttl_hours,
                metrics_ttl_hours: self.config.metrics_ttl_hours,
                discussions_ttl_hours: self.config.discussions_ttl_hours,
                interval: self.config.cleanup_interval,
            },
        );
        let cleanup_handle = {
            let cancel = cancel.clone();
            tokio::spawn(async move { cleanup_loop.run(cancel).await })
        };

        EngineHandles { dispatch_handle, health_handle, cleanup_handle }
    }

    /// Calls `shutdown()` on every backend, e.g. killing owned interactive
    /// CLI children. Idempotent; safe to call after the dispatch loop has
    /// already drained.
    pub async fn shutdown_backends(&self) {
        futures::future::join_all(self.backends.values().map(|b| b.shutdown())).await;
    }
}

/// Join handles for the three background loops spawned by
/// [`Engine::spawn_background_tasks`]. Dropping this without awaiting is
/// safe — the tasks keep running detached — but graceful shutdown should
/// cancel the shared token and then await these.
pub struct EngineHandles {
    pub dispatch_handle: tokio::task::JoinHandle<()>,
    pub health_handle: tokio::task::JoinHandle<()>,
    pub cleanup_handle: tokio::task::JoinHandle<()>,
}

impl EngineHandles {
    pub async fn join(self) {
        let _ = tokio::join!(self.dispatch_handle, self.health_handle, self.cleanup_handle);
    }
}
