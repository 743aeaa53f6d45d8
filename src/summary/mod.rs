//! Point-in-time reconstruction of a run from persisted state.
//!
//! [`SummaryService`] is the catch-up path for clients that missed live events
//! (late subscription, dropped connection, unknown run on the stream). Every
//! lookup fails soft: a store error or miss becomes `None` for that field.
//! The summary as a whole is `None` only when neither a run row nor any
//! report can be resolved.

mod pager;

pub use pager::{
    bucket_entries, build_items_slice, clamp_limit, resolve_offset, BucketEntry, ItemsSlice,
    DEFAULT_PAGE_LIMIT, MAX_PAGE_LIMIT,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::events::StageEvent;
use crate::storage::{
    Report, ReportStore, RunRecord, RunStatus, RunStore, StoredReport, WorkflowRecord,
    WorkflowStore,
};
use crate::stream_meta::{StreamMeta, StreamMetaTracker};

/// Report for one tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierReport {
    pub tier: String,
    pub report: Report,
    pub updated_at: DateTime<Utc>,
}

/// Persisted reports of a run. A run without tier reports is treated as a
/// single implicit tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reports {
    Tiered(Vec<TierReport>),
    Single(Report),
}

fn tier_rank(tier: &str) -> (u8, &str) {
    match tier {
        "quick" => (0, tier),
        "deep" => (1, tier),
        other => (2, other),
    }
}

impl Reports {
    /// Group stored documents. Tier reports win over a consolidated one.
    pub fn from_stored(stored: Vec<StoredReport>) -> Option<Self> {
        let (tiered, consolidated): (Vec<_>, Vec<_>) =
            stored.into_iter().partition(|s| s.report.tier.is_some());

        if !tiered.is_empty() {
            let mut tiers: Vec<TierReport> = tiered
                .into_iter()
                .filter_map(|s| {
                    let tier = s.report.tier.clone()?;
                    Some(TierReport {
                        tier,
                        report: s.report,
                        updated_at: s.updated_at,
                    })
                })
                .collect();
            tiers.sort_by(|a, b| tier_rank(&a.tier).cmp(&tier_rank(&b.tier)));
            return Some(Reports::Tiered(tiers));
        }

        consolidated
            .into_iter()
            .max_by_key(|s| s.updated_at)
            .map(|s| Reports::Single(s.report))
    }

    /// Reports in delivery order.
    pub fn iter(&self) -> Box<dyn Iterator<Item = &Report> + '_> {
        match self {
            Reports::Tiered(tiers) => Box::new(tiers.iter().map(|t| &t.report)),
            Reports::Single(report) => Box::new(std::iter::once(report)),
        }
    }

    /// Items across every report.
    pub fn item_count(&self) -> usize {
        self.iter().map(Report::item_count).sum()
    }
}

/// Replay stage transitions in arrival order; the last event per `(tier, key)`
/// wins and keeps the position of the first.
pub fn fold_stages<'a>(events: impl IntoIterator<Item = &'a StageEvent>) -> Vec<StageEvent> {
    let mut folded: Vec<StageEvent> = Vec::new();
    for event in events {
        match folded
            .iter_mut()
            .find(|s| s.tier == event.tier && s.key == event.key)
        {
            Some(existing) => *existing = event.clone(),
            None => folded.push(event.clone()),
        }
    }
    folded
}

/// Reconstructed view of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub project_id: String,
    pub run_id: String,
    /// Resolved analysis alias.
    pub proofreading_id: Option<String>,
    pub job_id: Option<String>,
    pub status: Option<RunStatus>,
    pub created_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_log_at: Option<DateTime<Utc>>,
    pub workflow: Option<WorkflowRecord>,
    pub reports: Option<Reports>,
    pub stages: Vec<StageEvent>,
    pub item_count: usize,
    pub stream_meta: Option<StreamMeta>,
}

impl RunSummary {
    /// A summary with no resolved fields.
    pub fn empty(project_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            run_id: run_id.into(),
            proofreading_id: None,
            job_id: None,
            status: None,
            created_at: None,
            completed_at: None,
            last_log_at: None,
            workflow: None,
            reports: None,
            stages: Vec::new(),
            item_count: 0,
            stream_meta: None,
        }
    }
}

/// Lookup key for a summary: a run id, its alias, or both.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryQuery {
    pub project_id: String,
    pub run_id: Option<String>,
    pub proofreading_id: Option<String>,
}

impl SummaryQuery {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Self::default()
        }
    }

    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    pub fn with_proofreading_id(mut self, proofreading_id: impl Into<String>) -> Self {
        self.proofreading_id = Some(proofreading_id.into());
        self
    }

    fn candidates(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = Vec::new();
        for id in [self.run_id.as_deref(), self.proofreading_id.as_deref()]
            .into_iter()
            .flatten()
        {
            let id = id.trim();
            if !id.is_empty() && !ids.contains(&id) {
                ids.push(id);
            }
        }
        ids
    }
}

/// Response body of the paginated items endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemsPage {
    pub run_id: String,
    pub proofreading_id: Option<String>,
    /// Offset the page started at.
    pub cursor: String,
    pub next_cursor: Option<String>,
    pub has_more: bool,
    pub total: usize,
    pub events: Vec<BucketEntry>,
}

/// Builds [`RunSummary`] values from the run, report and workflow stores.
#[derive(Clone)]
pub struct SummaryService {
    runs: Arc<dyn RunStore>,
    reports: Arc<dyn ReportStore>,
    workflows: Option<Arc<dyn WorkflowStore>>,
    tracker: Arc<StreamMetaTracker>,
}

impl SummaryService {
    pub fn new(
        runs: Arc<dyn RunStore>,
        reports: Arc<dyn ReportStore>,
        tracker: Arc<StreamMetaTracker>,
    ) -> Self {
        Self {
            runs,
            reports,
            workflows: None,
            tracker,
        }
    }

    /// Enable the execution-workflow lookup.
    pub fn with_workflows(mut self, workflows: Arc<dyn WorkflowStore>) -> Self {
        self.workflows = Some(workflows);
        self
    }

    async fn resolve_run(&self, project_id: &str, candidates: &[&str]) -> Option<RunRecord> {
        for id in candidates {
            match self.runs.find_run(project_id, id).await {
                Ok(Some(run)) if run.project_id == project_id => return Some(run),
                Ok(Some(run)) => {
                    warn!(
                        project_id = %project_id,
                        run_id = %run.id,
                        owner = %run.project_id,
                        "Ignoring run owned by another project"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(project_id = %project_id, id = %id, error = %e, "Run lookup failed");
                }
            }
        }
        None
    }

    async fn resolve_reports(
        &self,
        project_id: &str,
        analysis_ids: &[&str],
    ) -> Option<(String, Reports)> {
        for analysis_id in analysis_ids {
            let stored = match self.reports.load_reports(analysis_id).await {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(analysis_id = %analysis_id, error = %e, "Report lookup failed");
                    continue;
                }
            };

            let owned: Vec<StoredReport> = stored
                .into_iter()
                .filter(|s| {
                    let ours = s.project_id == project_id;
                    if !ours {
                        warn!(
                            analysis_id = %analysis_id,
                            owner = %s.project_id,
                            "Ignoring report owned by another project"
                        );
                    }
                    ours
                })
                .collect();

            if let Some(reports) = Reports::from_stored(owned) {
                return Some((analysis_id.to_string(), reports));
            }
        }
        None
    }

    async fn resolve_workflow(&self, project_id: &str, job_id: &str) -> Option<WorkflowRecord> {
        let workflows = self.workflows.as_ref()?;
        match workflows.find_workflow(project_id, job_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(project_id = %project_id, job_id = %job_id, error = %e, "Workflow lookup failed");
                None
            }
        }
    }

    /// Reconstruct a run. `None` if neither a run row nor a report resolves.
    pub async fn get_run_summary(&self, query: &SummaryQuery) -> Option<RunSummary> {
        let project_id = query.project_id.as_str();
        let candidates = query.candidates();
        if candidates.is_empty() {
            return None;
        }

        let run = self.resolve_run(project_id, &candidates).await;

        // Reports live under the analysis id; fall back through every known handle.
        let mut analysis_ids: Vec<&str> = Vec::new();
        let handles = [
            run.as_ref().map(RunRecord::report_key),
            query.proofreading_id.as_deref(),
            run.as_ref().map(|r| r.id.as_str()),
            query.run_id.as_deref(),
        ];
        for id in handles.into_iter().flatten() {
            if !id.is_empty() && !analysis_ids.contains(&id) {
                analysis_ids.push(id);
            }
        }

        let reports = self.resolve_reports(project_id, &analysis_ids).await;

        if run.is_none() && reports.is_none() {
            debug!(project_id = %project_id, ids = ?candidates, "Run could not be resolved");
            return None;
        }

        let run_id = run
            .as_ref()
            .map(|r| r.id.clone())
            .or_else(|| query.run_id.clone())
            .unwrap_or_else(|| candidates[0].to_string());

        let proofreading_id = run
            .as_ref()
            .and_then(|r| r.analysis_id.clone())
            .or_else(|| reports.as_ref().map(|(id, _)| id.clone()))
            .or_else(|| query.proofreading_id.clone());

        let workflow = match run.as_ref().and_then(|r| r.job_id.as_deref()) {
            Some(job_id) => self.resolve_workflow(project_id, job_id).await,
            None => None,
        };

        let reports = reports.map(|(_, r)| r);
        let stages = reports
            .as_ref()
            .map(|r| fold_stages(r.iter().flat_map(|report| report.stages.iter())))
            .unwrap_or_default();
        let item_count = reports.as_ref().map_or(0, Reports::item_count);

        let stream_meta = self.tracker.get(&run_id).await;

        let mut summary = RunSummary::empty(project_id, run_id);
        summary.proofreading_id = proofreading_id;
        if let Some(run) = run {
            summary.job_id = run.job_id;
            summary.status = Some(run.status);
            summary.created_at = Some(run.created_at);
            summary.completed_at = run.completed_at;
            summary.last_log_at = run.last_log_at;
        }
        summary.workflow = workflow;
        summary.reports = reports;
        summary.stages = stages;
        summary.item_count = item_count;
        summary.stream_meta = stream_meta;

        Some(summary)
    }

    /// [`Self::get_run_summary`] followed by [`build_items_slice`].
    pub async fn get_items_slice(
        &self,
        query: &SummaryQuery,
        cursor: Option<&str>,
        limit: Option<&str>,
    ) -> Option<ItemsPage> {
        let summary = self.get_run_summary(query).await?;
        let slice = build_items_slice(&summary, cursor, limit);

        Some(ItemsPage {
            run_id: summary.run_id,
            proofreading_id: summary.proofreading_id,
            cursor: slice.offset.to_string(),
            next_cursor: slice.next_cursor,
            has_more: slice.has_more,
            total: slice.total,
            events: slice.events,
        })
    }
}
