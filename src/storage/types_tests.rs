//! Unit tests for storage types and builder patterns.
//!
//! Tests clamping, status parsing, serialization, and builder methods
//! for RunRecord, ResultItem, Envelope, Report and WorkflowRecord.

use super::*;
use serde_json::json;

// ============================================================================
// RunStatus tests
// ============================================================================

#[test]
fn test_run_status_round_trip_strings() {
    for status in [
        RunStatus::Queued,
        RunStatus::Running,
        RunStatus::Done,
        RunStatus::Error,
    ] {
        assert_eq!(status.as_str().parse::<RunStatus>().unwrap(), status);
        assert_eq!(status.to_string(), status.as_str());
    }
}

#[test]
fn test_run_status_parse_is_case_insensitive() {
    assert_eq!("RUNNING".parse::<RunStatus>().unwrap(), RunStatus::Running);
}

#[test]
fn test_run_status_parse_rejects_unknown() {
    let err = "paused".parse::<RunStatus>().unwrap_err();
    assert!(err.contains("paused"));
}

#[test]
fn test_run_status_terminal() {
    assert!(!RunStatus::Queued.is_terminal());
    assert!(!RunStatus::Running.is_terminal());
    assert!(RunStatus::Done.is_terminal());
    assert!(RunStatus::Error.is_terminal());
}

#[test]
fn test_run_status_serializes_snake_case() {
    assert_eq!(serde_json::to_value(RunStatus::Done).unwrap(), json!("done"));
}

// ============================================================================
// RunRecord tests
// ============================================================================

#[test]
fn test_run_record_new() {
    let run = RunRecord::new("proj-1");
    assert!(!run.id.is_empty());
    assert_eq!(run.project_id, "proj-1");
    assert_eq!(run.status, RunStatus::Queued);
    assert!(run.completed_at.is_none());
    assert!(run.analysis_id.is_none());
}

#[test]
fn test_run_record_terminal_status_stamps_completion() {
    let run = RunRecord::new("proj-1").with_status(RunStatus::Running);
    assert!(run.completed_at.is_none());

    let run = run.with_status(RunStatus::Done);
    assert!(run.completed_at.is_some());
}

#[test]
fn test_run_record_report_key_prefers_alias() {
    let run = RunRecord::new("proj-1").with_id("run-1");
    assert_eq!(run.report_key(), "run-1");

    let run = run.with_analysis_id("pr-1");
    assert_eq!(run.report_key(), "pr-1");
}

#[test]
fn test_run_record_with_fingerprint() {
    let run = RunRecord::new("proj-1").with_fingerprint("abc123", Some(3));
    assert_eq!(run.content_fingerprint.as_deref(), Some("abc123"));
    assert_eq!(run.memory_version, Some(3));
}

// ============================================================================
// ResultItem tests
// ============================================================================

#[test]
fn test_result_item_inverted_span_collapses() {
    let item = ResultItem::new(Severity::Error, 10, 4, "bad span");
    assert_eq!(item.start, 10);
    assert_eq!(item.end, 10);
}

#[test]
fn test_result_item_confidence_clamped() {
    let item = ResultItem::new(Severity::Warning, 0, 1, "x").with_confidence(1.7);
    assert_eq!(item.confidence, 1.0);

    let item = ResultItem::new(Severity::Warning, 0, 1, "x").with_confidence(-0.2);
    assert_eq!(item.confidence, 0.0);
}

#[test]
fn test_result_item_suggestion_skipped_when_absent() {
    let item = ResultItem::new(Severity::Suggestion, 0, 5, "wordy").with_id("item-1");
    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["id"], "item-1");
    assert_eq!(value["severity"], "suggestion");
    assert!(value.get("suggestion").is_none());

    let value =
        serde_json::to_value(item.with_suggestion("shorter")).unwrap();
    assert_eq!(value["suggestion"], "shorter");
}

// ============================================================================
// Envelope tests
// ============================================================================

#[test]
fn test_envelope_defaults() {
    let envelope = Envelope::new("run-1", Some("quick".to_string()), Vec::new());
    assert!(!envelope.chunk_id.is_empty());
    assert!(!envelope.truncated);
    assert!(!envelope.has_more);
    assert_eq!(envelope.downshift_count, 0);
}

#[test]
fn test_envelope_deserializes_sparse_document() {
    let envelope: Envelope = serde_json::from_value(json!({
        "run_id": "run-1",
        "chunk_id": "c-1",
        "tier": null,
        "model": "gpt-4o-mini"
    }))
    .unwrap();
    assert!(envelope.items.is_empty());
    assert!(envelope.usage.is_none());
    assert_eq!(envelope.cursor_retry_count, 0);
}

// ============================================================================
// Report tests
// ============================================================================

#[test]
fn test_report_item_count() {
    let items = vec![
        ResultItem::new(Severity::Error, 0, 1, "a"),
        ResultItem::new(Severity::Error, 1, 2, "b"),
    ];
    let report = Report::new(Some("deep".to_string()))
        .with_bucket("grammar", Envelope::new("run-1", None, items))
        .with_bucket("style", Envelope::new("run-1", None, Vec::new()));
    assert_eq!(report.item_count(), 2);
    assert_eq!(report.buckets.len(), 2);
}

#[test]
fn test_report_deserializes_minimal_document() {
    let report: Report = serde_json::from_value(json!({})).unwrap();
    assert!(report.tier.is_none());
    assert!(report.buckets.is_empty());
    assert!(report.stages.is_empty());
}

// ============================================================================
// WorkflowRecord tests
// ============================================================================

#[test]
fn test_workflow_record_new() {
    let workflow = WorkflowRecord::new("proj-1", "job-1", "running");
    assert!(!workflow.id.is_empty());
    assert_eq!(workflow.job_id, "job-1");
    assert!(workflow.detail.is_none());
}
