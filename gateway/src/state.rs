//! Shared axum handler state.

use std::sync::Arc;
use std::time::Instant;

use gateway_core::Engine;
use gateway_core::storage::postgres::PostgresStorage;

/// Cheaply cloneable handle every handler receives via `State`.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine<PostgresStorage>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(engine: Arc<Engine<PostgresStorage>>) -> Self {
        Self { engine, started_at: Instant::now() }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
