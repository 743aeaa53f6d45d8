//! HTTP surface: NDJSON stream, summary and paginated items endpoints.
//!
//! This module provides:
//! - Shared application state wiring the stores, bus and tracker together
//! - The axum router with request tracing and an optional request timeout
//! - Route handlers mapping lookups onto [`ApiError`](crate::error::ApiError)

mod handlers;
mod router;

pub use handlers::*;
pub use router::router;

use std::sync::Arc;

use tokio::sync::watch;

use crate::config::Config;
use crate::events::EventBus;
use crate::storage::SqliteStorage;
use crate::stream_meta::StreamMetaTracker;
use crate::summary::SummaryService;
use crate::transport::StreamContext;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// SQLite storage backend.
    pub storage: SqliteStorage,
    /// Run event bus the analysis pipeline publishes into.
    pub bus: Arc<dyn EventBus>,
    /// Per-run stream diagnostics.
    pub tracker: Arc<StreamMetaTracker>,
    /// Catch-up reconstruction.
    pub summaries: SummaryService,
    /// Collaborators handed to each stream session.
    pub streams: StreamContext,
}

impl AppState {
    /// Create new application state
    pub fn new(
        config: Config,
        storage: SqliteStorage,
        bus: Arc<dyn EventBus>,
        tracker: Arc<StreamMetaTracker>,
    ) -> Self {
        let store = Arc::new(storage.clone());
        let summaries = SummaryService::new(store.clone(), store.clone(), Arc::clone(&tracker))
            .with_workflows(store.clone());
        let streams = StreamContext::new(
            Arc::clone(&bus),
            Arc::clone(&tracker),
            store,
            summaries.clone(),
            &config.streaming,
        );

        Self {
            config: Arc::new(config),
            storage,
            bus,
            tracker,
            summaries,
            streams,
        }
    }

    /// Open streams end with reason `shutdown` once `true` is sent.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.streams = self.streams.with_shutdown(shutdown);
        self
    }
}
