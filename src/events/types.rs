use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::storage::Envelope;

/// Category a listener subscribes to. Each [`RunEvent`] variant maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Stage,
    Page,
    Complete,
    Error,
    Tier,
}

impl EventCategory {
    /// Every category, in the order the transport subscribes to them.
    pub const ALL: [EventCategory; 5] = [
        EventCategory::Stage,
        EventCategory::Page,
        EventCategory::Tier,
        EventCategory::Complete,
        EventCategory::Error,
    ];

    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Stage => "stage",
            EventCategory::Page => "page",
            EventCategory::Complete => "complete",
            EventCategory::Error => "error",
            EventCategory::Tier => "tier",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of one processing stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    #[default]
    Queued,
    InProgress,
    Done,
    Error,
}

/// Transition of a named stage within a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEvent {
    /// Coarse phase ("quick", "deep"), if tiers are in use.
    #[serde(default)]
    pub tier: Option<String>,
    /// Stage or subfeature identifier.
    pub key: String,
    #[serde(default)]
    pub label: String,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_count: Option<u32>,
}

impl StageEvent {
    pub fn new(tier: Option<&str>, key: impl Into<String>, status: StageStatus) -> Self {
        let key = key.into();
        Self {
            tier: tier.map(str::to_string),
            label: key.clone(),
            key,
            status,
            message: None,
            item_count: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_item_count(mut self, item_count: u32) -> Self {
        self.item_count = Some(item_count);
        self
    }
}

/// A result batch ready for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageEvent {
    pub tier: Option<String>,
    pub key: String,
    pub chunk_index: u32,
    pub page: Envelope,
}

/// Run finished successfully.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompleteEvent {
    pub scope: Option<String>,
    pub completed_at: DateTime<Utc>,
    pub summary: Option<serde_json::Value>,
}

/// Run or stage failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Failing stage, if the failure is stage-scoped.
    pub stage: Option<String>,
    pub message: String,
    pub retryable: bool,
    pub reason: Option<String>,
}

/// A coarse phase finished.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierEvent {
    pub tier: String,
    pub summary: Option<serde_json::Value>,
    pub item_count: u32,
    pub completed_at: DateTime<Utc>,
}

/// Everything the analysis pipeline can publish about a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    Stage(StageEvent),
    Page(PageEvent),
    Complete(CompleteEvent),
    Error(ErrorEvent),
    Tier(TierEvent),
}

impl RunEvent {
    /// The only category this event is delivered to.
    pub fn category(&self) -> EventCategory {
        match self {
            RunEvent::Stage(_) => EventCategory::Stage,
            RunEvent::Page(_) => EventCategory::Page,
            RunEvent::Complete(_) => EventCategory::Complete,
            RunEvent::Error(_) => EventCategory::Error,
            RunEvent::Tier(_) => EventCategory::Tier,
        }
    }
}

/// A published event with its optional project scope.
#[derive(Debug, Clone, PartialEq)]
pub struct BusEvent {
    pub project_id: Option<String>,
    pub event: RunEvent,
}

impl BusEvent {
    /// Unscoped event.
    pub fn new(event: RunEvent) -> Self {
        Self {
            project_id: None,
            event,
        }
    }

    /// Tag the event with the project that produced it.
    pub fn for_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn category(&self) -> EventCategory {
        self.event.category()
    }

    /// Whether a subscriber scoped to `project_id` should see this event.
    /// Unscoped events are visible to everyone.
    pub fn visible_to(&self, project_id: &str) -> bool {
        self.project_id.as_deref().map_or(true, |p| p == project_id)
    }
}

impl From<StageEvent> for RunEvent {
    fn from(event: StageEvent) -> Self {
        RunEvent::Stage(event)
    }
}

impl From<PageEvent> for RunEvent {
    fn from(event: PageEvent) -> Self {
        RunEvent::Page(event)
    }
}

impl From<CompleteEvent> for RunEvent {
    fn from(event: CompleteEvent) -> Self {
        RunEvent::Complete(event)
    }
}

impl From<ErrorEvent> for RunEvent {
    fn from(event: ErrorEvent) -> Self {
        RunEvent::Error(event)
    }
}

impl From<TierEvent> for RunEvent {
    fn from(event: TierEvent) -> Self {
        RunEvent::Tier(event)
    }
}
