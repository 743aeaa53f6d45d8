use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{Scope, StreamMessage};
use crate::config::StreamingConfig;
use crate::events::{BusEvent, EventBus, EventCategory, Listener, Subscription};
use crate::storage::{RunStatus, RunStatusRow, RunStore};
use crate::stream_meta::StreamMetaTracker;
use crate::summary::{SummaryQuery, SummaryService};

/// Buffered lines between the session task and the HTTP body.
const CHANNEL_CAPACITY: usize = 64;

/// Shared collaborators of every stream session.
#[derive(Clone)]
pub struct StreamContext {
    pub bus: Arc<dyn EventBus>,
    pub tracker: Arc<StreamMetaTracker>,
    pub runs: Arc<dyn RunStore>,
    pub summaries: SummaryService,
    pub heartbeat: Duration,
    /// Bus events held per session while the client catches up.
    pub event_buffer: usize,
    shutdown: watch::Receiver<bool>,
}

impl StreamContext {
    pub fn new(
        bus: Arc<dyn EventBus>,
        tracker: Arc<StreamMetaTracker>,
        runs: Arc<dyn RunStore>,
        summaries: SummaryService,
        config: &StreamingConfig,
    ) -> Self {
        // With the sender gone the signal never fires.
        let (_, shutdown) = watch::channel(false);
        Self {
            bus,
            tracker,
            runs,
            summaries,
            heartbeat: config.heartbeat_interval(),
            event_buffer: config.event_buffer.max(1),
            shutdown,
        }
    }

    /// End open sessions once `true` is sent on the paired sender.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }
}

/// What the client asked to stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub project_id: String,
    /// Run id or its analysis alias.
    pub run_id: String,
    pub proofreading_id: Option<String>,
}

impl StreamRequest {
    pub fn new(project_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            run_id: run_id.into(),
            proofreading_id: None,
        }
    }

    pub fn with_proofreading_id(mut self, proofreading_id: impl Into<String>) -> Self {
        self.proofreading_id = Some(proofreading_id.into());
        self
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// An `end` line was sent with this reason.
    Ended { completed: bool, reason: String },
    /// The client went away first.
    Disconnected,
}

/// Open a stream for a run. Lines are produced by a spawned session task;
/// dropping the receiver is the disconnect signal.
pub fn open_stream(ctx: StreamContext, request: StreamRequest) -> mpsc::Receiver<Bytes> {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    tokio::spawn(run_session(ctx, request, tx));
    rx
}

/// Writes lines to the client. Once a write fails every later write is a no-op.
struct Emitter {
    tx: mpsc::Sender<Bytes>,
    scope: Scope,
    tracker: Arc<StreamMetaTracker>,
    open: bool,
    events_sent: u64,
    heartbeats_sent: u64,
}

impl Emitter {
    async fn emit(&mut self, message: StreamMessage) -> bool {
        if !self.open {
            return false;
        }

        let line = match message.to_line() {
            Ok(line) => line,
            Err(e) => {
                warn!(run_id = %self.scope.run_id, error = %e, "Failed to encode stream message");
                return true;
            }
        };

        if self.tx.send(line).await.is_err() {
            self.open = false;
            return false;
        }

        match message {
            StreamMessage::Heartbeat(_) => {
                self.heartbeats_sent += 1;
                self.tracker.record_heartbeat(&self.scope.run_id).await;
            }
            other => {
                self.events_sent += 1;
                self.tracker
                    .record_event(&self.scope.run_id, other.type_name())
                    .await;
            }
        }
        true
    }

    async fn end(&mut self, completed: bool, reason: &str) -> StreamOutcome {
        let message = StreamMessage::end(&self.scope, completed, reason);
        if self.emit(message).await {
            StreamOutcome::Ended {
                completed,
                reason: reason.to_string(),
            }
        } else {
            StreamOutcome::Disconnected
        }
    }
}

async fn check_exists(ctx: &StreamContext, request: &StreamRequest) -> Option<RunStatusRow> {
    match ctx.runs.run_exists(&request.project_id, &request.run_id).await {
        Ok(row) => row,
        Err(e) => {
            warn!(
                project_id = %request.project_id,
                run_id = %request.run_id,
                error = %e,
                "Run existence check failed, treating as not found"
            );
            None
        }
    }
}

/// Subscribe one listener per category, each forwarding into `events`.
/// A full buffer drops the event; the pager serves anything missed.
fn subscribe_all(
    bus: &dyn EventBus,
    run_id: &str,
    events: &mpsc::Sender<BusEvent>,
) -> Vec<Subscription> {
    EventCategory::ALL
        .iter()
        .map(|&category| {
            let events = events.clone();
            let owner = run_id.to_string();
            let listener: Listener = Arc::new(move |event: &BusEvent| {
                match events.try_send(event.clone()) {
                    Ok(()) | Err(TrySendError::Closed(_)) => {}
                    Err(TrySendError::Full(dropped)) => warn!(
                        run_id = %owner,
                        category = %dropped.category(),
                        "Stream event buffer full, dropping event"
                    ),
                }
            });
            bus.subscribe(run_id, category, listener)
        })
        .collect()
}

/// Drive one client connection to completion.
pub async fn run_session(
    ctx: StreamContext,
    request: StreamRequest,
    tx: mpsc::Sender<Bytes>,
) -> StreamOutcome {
    let connection_id = Uuid::new_v4();

    // Listen before reading the status so nothing published in between is lost.
    let (event_tx, event_rx) = mpsc::channel(ctx.event_buffer);
    let mut subscriptions = subscribe_all(ctx.bus.as_ref(), &request.run_id, &event_tx);

    let Some(mut row) = check_exists(&ctx, &request).await else {
        drop(subscriptions);
        return not_found(&ctx, &request, tx, connection_id).await;
    };

    if row.id != request.run_id {
        // Events are published under the canonical id, not the alias.
        subscriptions = subscribe_all(ctx.bus.as_ref(), &row.id, &event_tx);
        if let Some(current) = check_exists(&ctx, &request).await {
            row = current;
        }
    }
    drop(event_tx);

    // A lookup through the alias resolves to the canonical id.
    let proofreading_id = request
        .proofreading_id
        .clone()
        .or_else(|| (row.id != request.run_id).then(|| request.run_id.clone()));
    let scope = Scope {
        project_id: request.project_id.clone(),
        run_id: row.id.clone(),
        proofreading_id,
    };

    let mut emitter = Emitter {
        tx,
        scope: scope.clone(),
        tracker: Arc::clone(&ctx.tracker),
        open: true,
        events_sent: 0,
        heartbeats_sent: 0,
    };

    ctx.tracker
        .record_connection_open(&scope.run_id, Some(&scope.project_id))
        .await;
    info!(
        connection_id = %connection_id,
        project_id = %scope.project_id,
        run_id = %scope.run_id,
        status = %row.status,
        "Stream opened"
    );

    let outcome = if row.status.is_terminal() {
        drop(subscriptions);
        replay_finished(&ctx, &request, &mut emitter, row.status).await
    } else {
        relay(
            &ctx,
            &request,
            &mut emitter,
            event_rx,
            subscriptions,
            connection_id,
        )
        .await
    };

    let meta = ctx.tracker.record_connection_close(&scope.run_id).await;
    info!(
        connection_id = %connection_id,
        project_id = %scope.project_id,
        run_id = %scope.run_id,
        outcome = ?outcome,
        events_sent = emitter.events_sent,
        heartbeats_sent = emitter.heartbeats_sent,
        connection_count = meta.connection_count,
        reconnect_attempts = meta.reconnect_attempts,
        fallback_count = meta.fallback_count,
        "Stream closed"
    );

    outcome
}

/// Resolves once shutdown is signalled; never if the sender is gone first.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Terminal status of the run, if the store says it has finished.
async fn finished_status(ctx: &StreamContext, scope: &Scope) -> Option<RunStatus> {
    match ctx.runs.run_exists(&scope.project_id, &scope.run_id).await {
        Ok(Some(row)) if row.status.is_terminal() => Some(row.status),
        Ok(_) => None,
        Err(e) => {
            debug!(run_id = %scope.run_id, error = %e, "Run status re-check failed");
            None
        }
    }
}

async fn relay(
    ctx: &StreamContext,
    request: &StreamRequest,
    emitter: &mut Emitter,
    mut events: mpsc::Receiver<BusEvent>,
    subscriptions: Vec<Subscription>,
    connection_id: Uuid,
) -> StreamOutcome {
    let run_id = emitter.scope.run_id.clone();
    let project_id = emitter.scope.project_id.clone();
    let mut shutdown = ctx.shutdown.clone();

    let period = ctx.heartbeat;
    let mut heartbeat = interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let outcome = loop {
        tokio::select! {
            _ = emitter.tx.closed() => break StreamOutcome::Disconnected,
            _ = shutdown_requested(&mut shutdown) => {
                info!(connection_id = %connection_id, run_id = %run_id, "Ending stream for shutdown");
                break emitter.end(false, "shutdown").await;
            }
            _ = heartbeat.tick() => {
                // The run may finish without anything published on the bus.
                if let Some(status) = finished_status(ctx, &emitter.scope).await {
                    debug!(connection_id = %connection_id, run_id = %run_id, status = %status, "Run finished while streaming");
                    break replay_finished(ctx, request, emitter, status).await;
                }
                if !emitter.emit(StreamMessage::heartbeat(&emitter.scope)).await {
                    break StreamOutcome::Disconnected;
                }
            }
            Some(event) = events.recv() => {
                if !event.visible_to(&project_id) {
                    warn!(
                        connection_id = %connection_id,
                        run_id = %run_id,
                        project_id = %project_id,
                        event_project = ?event.project_id,
                        "Dropping event scoped to another project"
                    );
                    continue;
                }

                let message = StreamMessage::from_event(&emitter.scope, event.event);
                let terminal = message.terminal();
                if !emitter.emit(message).await {
                    break StreamOutcome::Disconnected;
                }
                if let Some((completed, reason)) = terminal {
                    break emitter.end(completed, &reason).await;
                }
            }
        }
    };

    // Dropping the handles unsubscribes all five listeners.
    drop(subscriptions);
    debug!(connection_id = %connection_id, run_id = %run_id, "Stream unsubscribed");

    outcome
}

/// The run has finished: hand over persisted state and end.
async fn replay_finished(
    ctx: &StreamContext,
    request: &StreamRequest,
    emitter: &mut Emitter,
    status: RunStatus,
) -> StreamOutcome {
    let query = summary_query(request, Some(&emitter.scope.run_id));
    if let Some(summary) = ctx.summaries.get_run_summary(&query).await {
        emitter
            .emit(StreamMessage::summary(&emitter.scope, summary))
            .await;
    }
    ctx.tracker
        .record_fallback(
            &emitter.scope.run_id,
            Some(&emitter.scope.project_id),
            "run_finished",
        )
        .await;

    let completed = status == RunStatus::Done;
    emitter
        .end(completed, if completed { "complete" } else { "error" })
        .await
}

async fn not_found(
    ctx: &StreamContext,
    request: &StreamRequest,
    tx: mpsc::Sender<Bytes>,
    connection_id: Uuid,
) -> StreamOutcome {
    let scope = Scope {
        project_id: request.project_id.clone(),
        run_id: request.run_id.clone(),
        proofreading_id: request.proofreading_id.clone(),
    };
    info!(
        connection_id = %connection_id,
        project_id = %scope.project_id,
        run_id = %scope.run_id,
        "Stream requested for unknown run"
    );

    let mut emitter = Emitter {
        tx,
        scope,
        tracker: Arc::clone(&ctx.tracker),
        open: true,
        events_sent: 0,
        heartbeats_sent: 0,
    };

    emitter.emit(StreamMessage::not_found(&emitter.scope)).await;

    // Reports may still exist under the alias even without a run row.
    let query = summary_query(request, None);
    match ctx.summaries.get_run_summary(&query).await {
        Some(summary) => {
            emitter
                .emit(StreamMessage::summary(&emitter.scope, summary))
                .await;
        }
        None => debug!(run_id = %request.run_id, "No summary available for unknown run"),
    }
    ctx.tracker
        .record_fallback(&request.run_id, Some(&request.project_id), "not_found")
        .await;

    emitter.end(false, "not_found").await
}

fn summary_query(request: &StreamRequest, run_id: Option<&str>) -> SummaryQuery {
    let mut query =
        SummaryQuery::new(&request.project_id).with_run_id(run_id.unwrap_or(&request.run_id));
    if let Some(alias) = &request.proofreading_id {
        query = query.with_proofreading_id(alias);
    }
    query
}
