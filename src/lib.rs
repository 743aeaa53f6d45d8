//! # Proofread Relay
//!
//! Delivers progress and results of long-running proofreading runs to clients
//! that come and go while the run keeps going server-side.
//!
//! ## Features
//!
//! - **Event Bus**: in-process fan-out of stage, page, tier, completion and error events per run
//! - **NDJSON Streaming**: heartbeated stream that always ends with an explicit `end` line
//! - **Catch-up**: run summaries and cursor-paginated result buckets rebuilt from storage
//! - **Stream Diagnostics**: reconnect and fallback counters flushed best-effort to SQLite
//! - **Staged Retry**: output-token downshift and segment retry around generative API calls
//!
//! ## Architecture
//!
//! ```text
//! Analysis pipeline → EventBus → stream session → NDJSON (HTTP)
//!                                     ↓ not found / reconnect
//!                 SQLite (runs, reports) → SummaryService → REST pages
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use proofread_relay::{AppState, Config};
//! use proofread_relay::events::InMemoryEventBus;
//! use proofread_relay::storage::SqliteStorage;
//! use proofread_relay::stream_meta::StreamMetaTracker;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_env()?;
//!     let storage = SqliteStorage::new(&config.database).await?;
//!     let state = AppState::new(
//!         config,
//!         storage,
//!         Arc::new(InMemoryEventBus::new()),
//!         Arc::new(StreamMetaTracker::new()),
//!     );
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8080").await?;
//!     axum::serve(listener, proofread_relay::server::router(state)).await?;
//!     Ok(())
//! }
//! ```

/// Configuration management.
pub mod config;
/// Error types and result aliases for the application.
pub mod error;
/// Run event bus.
pub mod events;
/// Generative text API client.
pub mod generation;
/// Staged retry for generative calls.
pub mod retry;
/// HTTP router and handlers.
pub mod server;
/// Storage contracts and the SQLite adapter.
pub mod storage;
/// Per-run stream diagnostics.
pub mod stream_meta;
/// Run summary reconstruction and cursor paging.
pub mod summary;
/// NDJSON streaming sessions.
pub mod transport;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use server::AppState;
