//! Per-run stream health bookkeeping.
//!
//! [`StreamMetaTracker`] answers "how healthy is this run's stream" and "how
//! often has the client had to reconnect". The data is diagnostic: it lives in
//! memory, is flushed best-effort through a [`MetaFlusher`], and losing it
//! never affects what a client receives.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::storage::StreamMetaSink;

/// Connection bookkeeping for one run's streaming channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamMeta {
    pub run_id: String,
    pub project_id: Option<String>,
    pub connection_count: u32,
    /// `connection_count - 1`, floored at zero.
    pub reconnect_attempts: u32,
    pub last_connection_at: Option<DateTime<Utc>>,
    pub last_disconnection_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub last_event_at: Option<DateTime<Utc>>,
    pub last_event_type: Option<String>,
    /// Never decreases for the lifetime of the run.
    pub fallback_count: u32,
    pub last_fallback_reason: Option<String>,
}

impl StreamMeta {
    fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            ..Self::default()
        }
    }
}

/// Bounded fire-and-forget queue feeding a background writer.
#[derive(Clone)]
pub struct MetaFlusher {
    tx: mpsc::Sender<StreamMeta>,
}

impl MetaFlusher {
    /// Start the writer task. It exits once every flusher handle is dropped.
    pub fn spawn(sink: Arc<dyn StreamMetaSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<StreamMeta>(capacity.max(1));

        let handle = tokio::spawn(async move {
            while let Some(meta) = rx.recv().await {
                if let Err(e) = sink.save_stream_meta(&meta.run_id, &meta).await {
                    warn!(run_id = %meta.run_id, error = %e, "Stream meta flush failed");
                }
            }
            debug!("Stream meta flusher stopped");
        });

        (Self { tx }, handle)
    }

    /// Queue a snapshot. Returns `false` if it was dropped.
    pub fn enqueue(&self, meta: StreamMeta) -> bool {
        match self.tx.try_send(meta) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(meta)) => {
                warn!(run_id = %meta.run_id, "Stream meta flush queue full, dropping snapshot");
                false
            }
            Err(mpsc::error::TrySendError::Closed(meta)) => {
                debug!(run_id = %meta.run_id, "Stream meta flusher closed, dropping snapshot");
                false
            }
        }
    }
}

/// Registry slot: the snapshot plus what eviction needs to know.
struct Tracked {
    meta: StreamMeta,
    /// Streams currently open for the run.
    active: u32,
    touched: Instant,
}

/// Process-wide registry of [`StreamMeta`] keyed by run id.
///
/// Entries with no open stream are dropped by [`evict_idle`](Self::evict_idle)
/// once they have been quiet for the idle window.
#[derive(Default)]
pub struct StreamMetaTracker {
    entries: RwLock<HashMap<String, Tracked>>,
    flusher: Option<MetaFlusher>,
}

impl StreamMetaTracker {
    /// Tracker without durable flushing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that flushes through `flusher`.
    pub fn with_flusher(flusher: MetaFlusher) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            flusher: Some(flusher),
        }
    }

    async fn update<F>(&self, run_id: &str, flush: bool, apply: F) -> StreamMeta
    where
        F: FnOnce(&mut Tracked),
    {
        let snapshot = {
            let mut entries = self.entries.write().await;
            let entry = entries.entry(run_id.to_string()).or_insert_with(|| Tracked {
                meta: StreamMeta::new(run_id),
                active: 0,
                touched: Instant::now(),
            });
            apply(entry);
            entry.touched = Instant::now();
            entry.meta.clone()
        };

        if flush {
            self.enqueue(snapshot.clone());
        }
        snapshot
    }

    fn enqueue(&self, meta: StreamMeta) {
        if let Some(flusher) = &self.flusher {
            flusher.enqueue(meta);
        }
    }

    /// A client opened a stream for the run.
    pub async fn record_connection_open(
        &self,
        run_id: &str,
        project_id: Option<&str>,
    ) -> StreamMeta {
        self.update(run_id, true, |entry| {
            entry.active += 1;
            let meta = &mut entry.meta;
            if let Some(project_id) = project_id {
                meta.project_id = Some(project_id.to_string());
            }
            meta.connection_count += 1;
            meta.reconnect_attempts = meta.connection_count.saturating_sub(1);
            meta.last_connection_at = Some(Utc::now());
        })
        .await
    }

    /// The stream for the run closed.
    pub async fn record_connection_close(&self, run_id: &str) -> StreamMeta {
        self.update(run_id, true, |entry| {
            entry.active = entry.active.saturating_sub(1);
            entry.meta.last_disconnection_at = Some(Utc::now());
        })
        .await
    }

    /// A heartbeat was sent.
    pub async fn record_heartbeat(&self, run_id: &str) -> StreamMeta {
        self.update(run_id, false, |entry| {
            entry.meta.last_heartbeat_at = Some(Utc::now());
        })
        .await
    }

    /// A relayed event was sent.
    pub async fn record_event(&self, run_id: &str, event_type: &str) -> StreamMeta {
        self.update(run_id, false, |entry| {
            let meta = &mut entry.meta;
            meta.last_event_at = Some(Utc::now());
            meta.last_event_type = Some(event_type.to_string());
        })
        .await
    }

    /// The client was pointed at persisted state instead of live events.
    pub async fn record_fallback(
        &self,
        run_id: &str,
        project_id: Option<&str>,
        reason: &str,
    ) -> StreamMeta {
        self.update(run_id, true, |entry| {
            let meta = &mut entry.meta;
            if meta.project_id.is_none() {
                meta.project_id = project_id.map(str::to_string);
            }
            meta.fallback_count += 1;
            meta.last_fallback_reason = Some(reason.to_string());
        })
        .await
    }

    /// Current snapshot, or `None` if nothing was ever recorded for the run.
    pub async fn get(&self, run_id: &str) -> Option<StreamMeta> {
        self.entries
            .read()
            .await
            .get(run_id)
            .map(|entry| entry.meta.clone())
    }

    /// Queue the current snapshot for durable storage.
    pub async fn flush(&self, run_id: &str) {
        if let Some(meta) = self.get(run_id).await {
            self.enqueue(meta);
        }
    }

    /// Forget every run.
    pub async fn reset(&self) {
        self.entries.write().await.clear();
    }

    /// Drop runs with no open stream that have been quiet for `idle_for`.
    /// Each evicted snapshot is queued for flushing first. Returns how many
    /// runs were dropped.
    pub async fn evict_idle(&self, idle_for: Duration) -> usize {
        let evicted: Vec<StreamMeta> = {
            let mut entries = self.entries.write().await;
            let idle: Vec<String> = entries
                .iter()
                .filter(|(_, entry)| entry.active == 0 && entry.touched.elapsed() >= idle_for)
                .map(|(run_id, _)| run_id.clone())
                .collect();
            idle.iter()
                .filter_map(|run_id| entries.remove(run_id))
                .map(|entry| entry.meta)
                .collect()
        };

        let count = evicted.len();
        for meta in evicted {
            self.enqueue(meta);
        }
        if count > 0 {
            debug!(evicted = count, "Evicted idle stream meta");
        }
        count
    }

    /// Run [`evict_idle`](Self::evict_idle) every `idle_for` until aborted.
    pub fn spawn_sweeper(self: Arc<Self>, idle_for: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = idle_for.max(Duration::from_secs(1));
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.evict_idle(idle_for).await;
            }
        })
    }
}
