use axum::body::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::events::{RunEvent, StageStatus};
use crate::storage::Envelope;
use crate::summary::RunSummary;

/// Identity stamped onto every streamed message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    pub project_id: String,
    pub run_id: String,
    pub proofreading_id: Option<String>,
}

impl Scope {
    pub fn wrap<T>(&self, payload: T) -> Scoped<T> {
        Scoped {
            project_id: self.project_id.clone(),
            run_id: self.run_id.clone(),
            proofreading_id: self.proofreading_id.clone(),
            payload,
        }
    }
}

/// `data` object of a message: identity fields plus the category payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scoped<T> {
    pub project_id: String,
    pub run_id: String,
    pub proofreading_id: Option<String>,
    #[serde(flatten)]
    pub payload: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagePayload {
    pub tier: Option<String>,
    pub key: String,
    pub stage: String,
    pub status: StageStatus,
    pub label: String,
    pub message: Option<String>,
    pub item_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierCompletePayload {
    pub tier: String,
    pub summary: Option<serde_json::Value>,
    pub item_count: u32,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemsPayload {
    pub tier: Option<String>,
    pub key: String,
    pub chunk_index: u32,
    pub page: Envelope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletePayload {
    pub scope: Option<String>,
    #[serde(rename = "completedAt")]
    pub completed_at: DateTime<Utc>,
    pub summary: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub stage: Option<String>,
    pub message: String,
    pub retryable: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndPayload {
    pub completed: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryPayload {
    pub summary: RunSummary,
}

/// One NDJSON line on the streaming channel: `{"type": ..., "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum StreamMessage {
    Stage(Scoped<StagePayload>),
    TierComplete(Scoped<TierCompletePayload>),
    Items(Scoped<ItemsPayload>),
    Complete(Scoped<CompletePayload>),
    Error(Scoped<ErrorPayload>),
    End(Scoped<EndPayload>),
    Heartbeat(Scoped<HeartbeatPayload>),
    Summary(Scoped<Box<SummaryPayload>>),
}

impl StreamMessage {
    /// Translate a bus event into its streamed form.
    pub fn from_event(scope: &Scope, event: RunEvent) -> Self {
        match event {
            RunEvent::Stage(e) => StreamMessage::Stage(scope.wrap(StagePayload {
                tier: e.tier,
                stage: e.key.clone(),
                key: e.key,
                status: e.status,
                label: e.label,
                message: e.message,
                item_count: e.item_count,
            })),
            RunEvent::Tier(e) => StreamMessage::TierComplete(scope.wrap(TierCompletePayload {
                tier: e.tier,
                summary: e.summary,
                item_count: e.item_count,
                completed_at: e.completed_at,
            })),
            RunEvent::Page(e) => StreamMessage::Items(scope.wrap(ItemsPayload {
                tier: e.tier,
                key: e.key,
                chunk_index: e.chunk_index,
                page: e.page,
            })),
            RunEvent::Complete(e) => StreamMessage::Complete(scope.wrap(CompletePayload {
                scope: e.scope,
                completed_at: e.completed_at,
                summary: e.summary,
            })),
            RunEvent::Error(e) => StreamMessage::Error(scope.wrap(ErrorPayload {
                stage: e.stage,
                message: e.message,
                retryable: e.retryable,
                reason: e.reason,
            })),
        }
    }

    pub fn heartbeat(scope: &Scope) -> Self {
        StreamMessage::Heartbeat(scope.wrap(HeartbeatPayload {
            timestamp: Utc::now(),
        }))
    }

    pub fn end(scope: &Scope, completed: bool, reason: impl Into<String>) -> Self {
        StreamMessage::End(scope.wrap(EndPayload {
            completed,
            reason: reason.into(),
        }))
    }

    pub fn not_found(scope: &Scope) -> Self {
        StreamMessage::Error(scope.wrap(ErrorPayload {
            stage: None,
            message: format!("run not found: {}", scope.run_id),
            retryable: false,
            reason: Some("not_found".to_string()),
        }))
    }

    pub fn summary(scope: &Scope, summary: RunSummary) -> Self {
        StreamMessage::Summary(scope.wrap(Box::new(SummaryPayload { summary })))
    }

    /// Wire `type` value.
    pub fn type_name(&self) -> &'static str {
        match self {
            StreamMessage::Stage(_) => "stage",
            StreamMessage::TierComplete(_) => "tier_complete",
            StreamMessage::Items(_) => "items",
            StreamMessage::Complete(_) => "complete",
            StreamMessage::Error(_) => "error",
            StreamMessage::End(_) => "end",
            StreamMessage::Heartbeat(_) => "heartbeat",
            StreamMessage::Summary(_) => "summary",
        }
    }

    /// `(completed, reason)` of the `end` that must follow this message, if it
    /// is terminal.
    pub fn terminal(&self) -> Option<(bool, String)> {
        match self {
            StreamMessage::Complete(_) => Some((true, "complete".to_string())),
            StreamMessage::Error(data) => Some((
                false,
                match &data.payload.stage {
                    Some(stage) => format!("{}_error", stage),
                    None => "error".to_string(),
                },
            )),
            _ => None,
        }
    }

    /// Encode as one newline-terminated JSON line.
    pub fn to_line(&self) -> serde_json::Result<Bytes> {
        let mut buf = serde_json::to_vec(self)?;
        buf.push(b'\n');
        Ok(Bytes::from(buf))
    }
}
