//! Storage contracts for run state.
//!
//! The relay only reads run rows, report documents and workflow records; the
//! analysis pipeline owns those writes. The one thing the relay persists itself
//! is the diagnostic [`StreamMeta`] snapshot, through [`StreamMetaSink`].

mod sqlite;

#[cfg(test)]
#[path = "types_tests.rs"]
mod types_tests;

pub use sqlite::SqliteStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageResult;
use crate::events::StageEvent;
use crate::stream_meta::StreamMeta;

/// Lifecycle state of a run row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Accepted, not yet picked up.
    #[default]
    Queued,
    /// Pipeline is producing results.
    Running,
    /// Finished successfully.
    Done,
    /// Finished with a failure.
    Error,
}

impl RunStatus {
    /// Convert to string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Error => "error",
        }
    }

    /// Whether the run will not produce further events.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "done" => Ok(RunStatus::Done),
            "error" => Ok(RunStatus::Error),
            _ => Err(format!("Unknown run status: {}", s)),
        }
    }
}

/// One analysis execution as recorded in the relational store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    /// Primary run handle.
    pub id: String,
    /// Alias accepted wherever a run id is (the analysis document id).
    pub analysis_id: Option<String>,
    /// Owning project.
    pub project_id: String,
    /// Upstream source-document job.
    pub job_id: Option<String>,
    /// Current status.
    pub status: RunStatus,
    /// Memory version the run was analysed against.
    pub memory_version: Option<i64>,
    /// Hash of the analysed text.
    pub content_fingerprint: Option<String>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// Last pipeline log line for the run.
    pub last_log_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    /// Create a new queued run for a project.
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            analysis_id: None,
            project_id: project_id.into(),
            job_id: None,
            status: RunStatus::Queued,
            memory_version: None,
            content_fingerprint: None,
            created_at: Utc::now(),
            completed_at: None,
            last_log_at: None,
        }
    }

    /// Use a fixed run id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach the analysis document alias.
    pub fn with_analysis_id(mut self, analysis_id: impl Into<String>) -> Self {
        self.analysis_id = Some(analysis_id.into());
        self
    }

    /// Attach the upstream job.
    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Attach the reuse key.
    pub fn with_fingerprint(
        mut self,
        content_fingerprint: impl Into<String>,
        memory_version: Option<i64>,
    ) -> Self {
        self.content_fingerprint = Some(content_fingerprint.into());
        self.memory_version = memory_version;
        self
    }

    /// Set the status, stamping `completed_at` for terminal states.
    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        self
    }

    /// The id under which reports for this run are stored.
    pub fn report_key(&self) -> &str {
        self.analysis_id.as_deref().unwrap_or(&self.id)
    }
}

/// Minimal row returned by the stream existence check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusRow {
    pub id: String,
    pub status: RunStatus,
}

/// Severity class of a finding.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Must be fixed.
    Error,
    /// Should be reviewed.
    #[default]
    Warning,
    /// Optional improvement.
    Suggestion,
}

/// One finding produced by a stage. Immutable once emitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultItem {
    pub id: String,
    pub severity: Severity,
    /// Half-open span start.
    pub start: u32,
    /// Half-open span end, never below `start`.
    pub end: u32,
    pub rationale: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
    /// Confidence score (0.0-1.0).
    pub confidence: f64,
}

impl ResultItem {
    /// Create an item. A span whose end precedes its start collapses to empty.
    pub fn new(severity: Severity, start: u32, end: u32, rationale: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            severity,
            start,
            end: end.max(start),
            rationale: rationale.into(),
            suggestion: None,
            confidence: 0.5,
        }
    }

    /// Use a fixed item id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Attach a fix suggestion.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Set confidence (clamped to 0.0-1.0).
    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence.clamp(0.0, 1.0);
        self
    }
}

/// Token accounting for the call that produced a page.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub total_tokens: u32,
}

/// A bounded batch of result items plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub run_id: String,
    /// Unique within the run.
    pub chunk_id: String,
    pub tier: Option<String>,
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub truncated: bool,
    #[serde(default)]
    pub downshift_count: u32,
    #[serde(default)]
    pub forced_pagination: bool,
    #[serde(default)]
    pub cursor_retry_count: u32,
    #[serde(default)]
    pub has_more: bool,
    #[serde(default)]
    pub next_cursor: Option<String>,
    #[serde(default)]
    pub items: Vec<ResultItem>,
}

impl Envelope {
    /// Create an envelope for a batch of items.
    pub fn new(run_id: impl Into<String>, tier: Option<String>, items: Vec<ResultItem>) -> Self {
        Self {
            run_id: run_id.into(),
            chunk_id: Uuid::new_v4().to_string(),
            tier,
            model: None,
            usage: None,
            truncated: false,
            downshift_count: 0,
            forced_pagination: false,
            cursor_retry_count: 0,
            has_more: false,
            next_cursor: None,
            items,
        }
    }
}

/// Item batch for one subfeature inside a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportBucket {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub page: Envelope,
}

/// Persisted analysis report, either for one tier or consolidated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Report {
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub buckets: Vec<ReportBucket>,
    /// Stage transitions in arrival order.
    #[serde(default)]
    pub stages: Vec<StageEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<serde_json::Value>,
}

impl Report {
    /// Create an empty report for a tier (`None` for consolidated).
    pub fn new(tier: Option<String>) -> Self {
        Self {
            tier,
            ..Self::default()
        }
    }

    /// Append an item bucket.
    pub fn with_bucket(mut self, key: impl Into<String>, page: Envelope) -> Self {
        self.buckets.push(ReportBucket {
            key: key.into(),
            label: None,
            page,
        });
        self
    }

    /// Append a stage transition.
    pub fn with_stage(mut self, stage: StageEvent) -> Self {
        self.stages.push(stage);
        self
    }

    /// Total items across all buckets.
    pub fn item_count(&self) -> usize {
        self.buckets.iter().map(|b| b.page.items.len()).sum()
    }
}

/// A report as held by the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReport {
    pub analysis_id: String,
    pub project_id: String,
    pub report: Report,
    pub updated_at: DateTime<Utc>,
}

/// Externally tracked execution-workflow record for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub id: String,
    pub project_id: String,
    pub job_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRecord {
    /// Create a workflow record for a job.
    pub fn new(
        project_id: impl Into<String>,
        job_id: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            project_id: project_id.into(),
            job_id: job_id.into(),
            status: status.into(),
            detail: None,
            updated_at: Utc::now(),
        }
    }
}

/// Relational read contract for run rows.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Find a run by id or analysis alias, scoped to a project.
    async fn find_run(&self, project_id: &str, id_or_alias: &str)
        -> StorageResult<Option<RunRecord>>;

    /// Cheap existence check used when a stream opens.
    async fn run_exists(
        &self,
        project_id: &str,
        id_or_alias: &str,
    ) -> StorageResult<Option<RunStatusRow>>;

    /// Most recent run for an identical `(project, fingerprint, memory version)`.
    async fn find_reusable_run(
        &self,
        project_id: &str,
        content_fingerprint: &str,
        memory_version: Option<i64>,
    ) -> StorageResult<Option<RunRecord>>;
}

/// Document read contract for analysis reports.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// All reports (per tier and/or consolidated) for an analysis id.
    async fn load_reports(&self, analysis_id: &str) -> StorageResult<Vec<StoredReport>>;
}

/// Optional execution-workflow lookup.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Workflow record for a project's job.
    async fn find_workflow(
        &self,
        project_id: &str,
        job_id: &str,
    ) -> StorageResult<Option<WorkflowRecord>>;
}

/// Best-effort durable target for stream diagnostics.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamMetaSink: Send + Sync {
    /// Upsert the snapshot for a run.
    async fn save_stream_meta(&self, run_id: &str, meta: &StreamMeta) -> StorageResult<()>;
}
