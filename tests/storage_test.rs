//! Integration tests for SQLite storage layer
//!
//! Tests the read contracts and write helpers using an in-memory SQLite database.

use chrono::{Duration, Utc};
use serde_json::json;

use proofread_relay::error::StorageError;
use proofread_relay::storage::{
    Envelope, Report, ReportStore, ResultItem, RunRecord, RunStatus, RunStore, Severity,
    SqliteStorage, StoredReport, StreamMetaSink, WorkflowRecord, WorkflowStore,
};
use proofread_relay::stream_meta::StreamMetaTracker;

/// Create an in-memory storage instance for testing
async fn create_test_storage() -> SqliteStorage {
    SqliteStorage::new_in_memory()
        .await
        .expect("Failed to create in-memory storage")
}

fn create_test_report(project_id: &str, analysis_id: &str, tier: Option<&str>) -> StoredReport {
    let items = vec![ResultItem::new(Severity::Error, 0, 4, "misspelling")];
    StoredReport {
        analysis_id: analysis_id.to_string(),
        project_id: project_id.to_string(),
        report: Report::new(tier.map(str::to_string))
            .with_bucket("spelling", Envelope::new("run-1", tier.map(str::to_string), items)),
        updated_at: Utc::now(),
    }
}

#[cfg(test)]
mod run_tests {
    use super::*;

    #[tokio::test]
    async fn test_find_run_by_id_and_alias() {
        let storage = create_test_storage().await;
        let run = RunRecord::new("proj-1").with_id("run-1").with_analysis_id("pr-1");
        storage.insert_run(&run).await.unwrap();

        let by_id = storage.find_run("proj-1", "run-1").await.unwrap().unwrap();
        assert_eq!(by_id.id, "run-1");

        let by_alias = storage.find_run("proj-1", "pr-1").await.unwrap().unwrap();
        assert_eq!(by_alias.id, "run-1");
        assert_eq!(by_alias.analysis_id.as_deref(), Some("pr-1"));
    }

    #[tokio::test]
    async fn test_find_run_is_project_scoped() {
        let storage = create_test_storage().await;
        storage
            .insert_run(&RunRecord::new("proj-1").with_id("run-1"))
            .await
            .unwrap();

        let other = storage.find_run("proj-2", "run-1").await.unwrap();
        assert!(other.is_none(), "Runs must not leak across projects");
    }

    #[tokio::test]
    async fn test_run_exists_returns_status() {
        let storage = create_test_storage().await;
        storage
            .insert_run(
                &RunRecord::new("proj-1")
                    .with_id("run-1")
                    .with_status(RunStatus::Running),
            )
            .await
            .unwrap();

        let row = storage.run_exists("proj-1", "run-1").await.unwrap().unwrap();
        assert_eq!(row.id, "run-1");
        assert_eq!(row.status, RunStatus::Running);

        assert!(storage.run_exists("proj-1", "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_update_run_status() {
        let storage = create_test_storage().await;
        storage
            .insert_run(&RunRecord::new("proj-1").with_id("run-1"))
            .await
            .unwrap();

        storage
            .update_run_status("run-1", RunStatus::Done)
            .await
            .unwrap();

        let run = storage.find_run("proj-1", "run-1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Done);
        assert!(run.completed_at.is_some());
        assert!(run.last_log_at.is_some());
    }

    #[tokio::test]
    async fn test_update_missing_run_fails() {
        let storage = create_test_storage().await;
        let result = storage.update_run_status("ghost", RunStatus::Done).await;
        assert!(matches!(result, Err(StorageError::Query { .. })));
    }

    #[tokio::test]
    async fn test_unknown_status_is_serialization_error() {
        let storage = create_test_storage().await;
        sqlx::query(
            "INSERT INTO runs (id, project_id, status, created_at) VALUES ('run-x', 'proj-1', 'paused', ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(storage.pool())
        .await
        .unwrap();

        let result = storage.find_run("proj-1", "run-x").await;
        assert!(matches!(result, Err(StorageError::Serialization { .. })));
    }

    #[tokio::test]
    async fn test_find_reusable_run_matches_fingerprint() {
        let storage = create_test_storage().await;
        let mut older = RunRecord::new("proj-1")
            .with_id("run-old")
            .with_fingerprint("hash-a", Some(2));
        older.created_at = Utc::now() - Duration::minutes(5);
        let newer = RunRecord::new("proj-1")
            .with_id("run-new")
            .with_fingerprint("hash-a", Some(2));
        let other_version = RunRecord::new("proj-1")
            .with_id("run-v3")
            .with_fingerprint("hash-a", Some(3));

        for run in [&older, &newer, &other_version] {
            storage.insert_run(run).await.unwrap();
        }

        let found = storage
            .find_reusable_run("proj-1", "hash-a", Some(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "run-new");

        let missing = storage
            .find_reusable_run("proj-2", "hash-a", Some(2))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_find_reusable_run_null_memory_version() {
        let storage = create_test_storage().await;
        storage
            .insert_run(
                &RunRecord::new("proj-1")
                    .with_id("run-1")
                    .with_fingerprint("hash-b", None),
            )
            .await
            .unwrap();

        let found = storage
            .find_reusable_run("proj-1", "hash-b", None)
            .await
            .unwrap();
        assert_eq!(found.map(|r| r.id).as_deref(), Some("run-1"));

        let versioned = storage
            .find_reusable_run("proj-1", "hash-b", Some(1))
            .await
            .unwrap();
        assert!(versioned.is_none());
    }
}

#[cfg(test)]
mod report_tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_load_tiered_reports() {
        let storage = create_test_storage().await;
        storage
            .put_report(&create_test_report("proj-1", "pr-1", Some("quick")))
            .await
            .unwrap();
        storage
            .put_report(&create_test_report("proj-1", "pr-1", Some("deep")))
            .await
            .unwrap();
        storage
            .put_report(&create_test_report("proj-1", "pr-1", None))
            .await
            .unwrap();

        let reports = storage.load_reports("pr-1").await.unwrap();
        assert_eq!(reports.len(), 3);

        let tiers: Vec<Option<&str>> = reports.iter().map(|r| r.report.tier.as_deref()).collect();
        assert!(tiers.contains(&None));
        assert!(tiers.contains(&Some("quick")));
        assert!(tiers.contains(&Some("deep")));
    }

    #[tokio::test]
    async fn test_put_report_upserts() {
        let storage = create_test_storage().await;
        storage
            .put_report(&create_test_report("proj-1", "pr-1", Some("quick")))
            .await
            .unwrap();

        let mut updated = create_test_report("proj-1", "pr-1", Some("quick"));
        updated.report = updated.report.with_bucket(
            "grammar",
            Envelope::new(
                "run-1",
                None,
                vec![ResultItem::new(Severity::Warning, 5, 9, "agreement")],
            ),
        );
        storage.put_report(&updated).await.unwrap();

        let reports = storage.load_reports("pr-1").await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].report.item_count(), 2);
    }

    #[tokio::test]
    async fn test_load_reports_unknown_id_is_empty() {
        let storage = create_test_storage().await;
        assert!(storage.load_reports("nothing").await.unwrap().is_empty());
    }
}

#[cfg(test)]
mod workflow_tests {
    use super::*;

    #[tokio::test]
    async fn test_put_and_find_workflow() {
        let storage = create_test_storage().await;
        let mut workflow = WorkflowRecord::new("proj-1", "job-1", "running");
        workflow.detail = Some(json!({"step": "extract"}));
        storage.put_workflow(&workflow).await.unwrap();

        let found = storage
            .find_workflow("proj-1", "job-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.status, "running");
        assert_eq!(found.detail, Some(json!({"step": "extract"})));

        assert!(storage
            .find_workflow("proj-2", "job-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_corrupt_workflow_detail_is_serialization_error() {
        let storage = create_test_storage().await;
        sqlx::query(
            "INSERT INTO workflows (id, project_id, job_id, status, detail, updated_at) VALUES ('wf-1', 'proj-1', 'job-1', 'running', '{not json', ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(storage.pool())
        .await
        .unwrap();

        let result = storage.find_workflow("proj-1", "job-1").await;
        assert!(matches!(
            result,
            Err(StorageError::Serialization { ref table, .. }) if table == "workflows"
        ));
    }

    #[tokio::test]
    async fn test_workflow_without_detail_round_trips_null() {
        let storage = create_test_storage().await;
        storage
            .put_workflow(&WorkflowRecord::new("proj-1", "job-2", "queued"))
            .await
            .unwrap();

        let found = storage
            .find_workflow("proj-1", "job-2")
            .await
            .unwrap()
            .unwrap();
        assert!(found.detail.is_none());
    }
}

#[cfg(test)]
mod stream_meta_tests {
    use super::*;

    #[tokio::test]
    async fn test_save_and_load_stream_meta() {
        let storage = create_test_storage().await;
        let tracker = StreamMetaTracker::new();
        tracker.record_connection_open("run-1", Some("proj-1")).await;
        let meta = tracker.record_fallback("run-1", None, "not_found").await;

        storage.save_stream_meta("run-1", &meta).await.unwrap();
        storage.save_stream_meta("run-1", &meta).await.unwrap();

        let loaded = storage.load_stream_meta("run-1").await.unwrap().unwrap();
        assert_eq!(loaded, meta);
        assert!(storage.load_stream_meta("run-2").await.unwrap().is_none());
    }
}

#[cfg(test)]
mod file_backed_tests {
    use super::*;
    use proofread_relay::config::DatabaseConfig;

    #[tokio::test]
    async fn test_file_database_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let config = DatabaseConfig {
            path: dir.path().join("nested").join("relay.db"),
            max_connections: 2,
        };

        {
            let storage = SqliteStorage::new(&config).await.unwrap();
            storage
                .insert_run(&RunRecord::new("proj-1").with_id("run-1"))
                .await
                .unwrap();
            storage.pool().close().await;
        }

        let reopened = SqliteStorage::new(&config).await.unwrap();
        let run = reopened.find_run("proj-1", "run-1").await.unwrap();
        assert!(run.is_some());
    }
}
