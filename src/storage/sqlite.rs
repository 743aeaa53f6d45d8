use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use tracing::info;

use super::{
    Report, ReportStore, RunRecord, RunStatus, RunStatusRow, RunStore, StoredReport,
    StreamMetaSink, WorkflowRecord, WorkflowStore,
};
use crate::config::DatabaseConfig;
use crate::error::{StorageError, StorageResult};
use crate::stream_meta::StreamMeta;

/// Static migrator that embeds migrations at compile time
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const RUN_COLUMNS: &str = "id, analysis_id, project_id, job_id, status, memory_version, \
     content_fingerprint, created_at, completed_at, last_log_at";

/// SQLite-backed storage implementation
#[derive(Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Create a new SQLite storage instance
    pub async fn new(config: &DatabaseConfig) -> StorageResult<Self> {
        // Ensure parent directory exists
        if let Some(parent) = config.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Connection {
                message: format!("Failed to create database directory: {}", e),
            })?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", config.path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .map_err(|e| StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            })?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Create an in-memory instance. A single connection keeps every query on
    /// the same database.
    pub async fn new_in_memory() -> StorageResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:").map_err(|e| {
            StorageError::Connection {
                message: format!("Invalid database URL: {}", e),
            }
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection {
                message: format!("Failed to connect to database: {}", e),
            })?;

        let storage = Self { pool };
        storage.run_migrations().await?;

        Ok(storage)
    }

    /// Run database migrations using embedded sqlx migrations
    async fn run_migrations(&self) -> StorageResult<()> {
        info!("Running database migrations...");

        MIGRATOR.run(&self.pool).await.map_err(|e| StorageError::Migration {
            message: format!("Failed to run migrations: {}", e),
        })?;

        info!("Database migrations completed successfully");
        Ok(())
    }

    /// Get the underlying pool for advanced queries
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a run row.
    pub async fn insert_run(&self, run: &RunRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, analysis_id, project_id, job_id, status, memory_version,
                              content_fingerprint, created_at, completed_at, last_log_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.analysis_id)
        .bind(&run.project_id)
        .bind(&run.job_id)
        .bind(run.status.as_str())
        .bind(run.memory_version)
        .bind(&run.content_fingerprint)
        .bind(run.created_at.to_rfc3339())
        .bind(run.completed_at.map(|t| t.to_rfc3339()))
        .bind(run.last_log_at.map(|t| t.to_rfc3339()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Move a run to a new status, stamping `completed_at` on terminal states.
    pub async fn update_run_status(&self, run_id: &str, status: RunStatus) -> StorageResult<()> {
        let now = Utc::now().to_rfc3339();
        let completed_at = status.is_terminal().then(|| now.clone());

        let result = sqlx::query(
            r#"
            UPDATE runs
            SET status = ?, completed_at = COALESCE(?, completed_at), last_log_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.as_str())
        .bind(completed_at)
        .bind(&now)
        .bind(run_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Query {
                message: format!("run {} does not exist", run_id),
            });
        }

        Ok(())
    }

    /// Upsert a report document.
    pub async fn put_report(&self, report: &StoredReport) -> StorageResult<()> {
        let document =
            serde_json::to_string(&report.report).map_err(|e| StorageError::Serialization {
                table: "reports".to_string(),
                message: e.to_string(),
            })?;

        sqlx::query(
            r#"
            INSERT INTO reports (analysis_id, tier, project_id, document, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(analysis_id, tier) DO UPDATE SET
                project_id = excluded.project_id,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&report.analysis_id)
        .bind(report.report.tier.as_deref().unwrap_or(""))
        .bind(&report.project_id)
        .bind(&document)
        .bind(report.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Upsert a workflow record.
    pub async fn put_workflow(&self, workflow: &WorkflowRecord) -> StorageResult<()> {
        let detail = workflow
            .detail
            .as_ref()
            .map(|d| {
                serde_json::to_string(d).map_err(|e| StorageError::Serialization {
                    table: "workflows".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO workflows (id, project_id, job_id, status, detail, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id, job_id) DO UPDATE SET
                status = excluded.status,
                detail = excluded.detail,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.project_id)
        .bind(&workflow.job_id)
        .bind(&workflow.status)
        .bind(&detail)
        .bind(workflow.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Last flushed stream snapshot for a run.
    pub async fn load_stream_meta(&self, run_id: &str) -> StorageResult<Option<StreamMeta>> {
        let document: Option<String> =
            sqlx::query_scalar("SELECT document FROM stream_meta WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(&self.pool)
                .await?;

        document
            .map(|d| {
                serde_json::from_str(&d).map_err(|e| StorageError::Serialization {
                    table: "stream_meta".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()
    }
}

#[async_trait]
impl RunStore for SqliteStorage {
    async fn find_run(
        &self,
        project_id: &str,
        id_or_alias: &str,
    ) -> StorageResult<Option<RunRecord>> {
        // A direct id match wins over an alias match.
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE project_id = ? AND (id = ? OR analysis_id = ?)
            ORDER BY CASE WHEN id = ? THEN 0 ELSE 1 END, created_at DESC
            LIMIT 1
            "#
        );

        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(project_id)
            .bind(id_or_alias)
            .bind(id_or_alias)
            .bind(id_or_alias)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRecord::try_from).transpose()
    }

    async fn run_exists(
        &self,
        project_id: &str,
        id_or_alias: &str,
    ) -> StorageResult<Option<RunStatusRow>> {
        let row: Option<(String, String)> = sqlx::query_as(
            r#"
            SELECT id, status
            FROM runs
            WHERE project_id = ? AND (id = ? OR analysis_id = ?)
            ORDER BY CASE WHEN id = ? THEN 0 ELSE 1 END
            LIMIT 1
            "#,
        )
        .bind(project_id)
        .bind(id_or_alias)
        .bind(id_or_alias)
        .bind(id_or_alias)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(id, status)| {
            Ok(RunStatusRow {
                id,
                status: parse_status(&status)?,
            })
        })
        .transpose()
    }

    async fn find_reusable_run(
        &self,
        project_id: &str,
        content_fingerprint: &str,
        memory_version: Option<i64>,
    ) -> StorageResult<Option<RunRecord>> {
        // `IS` treats two NULL memory versions as equal.
        let sql = format!(
            r#"
            SELECT {RUN_COLUMNS}
            FROM runs
            WHERE project_id = ? AND content_fingerprint = ? AND memory_version IS ?
            ORDER BY created_at DESC
            LIMIT 1
            "#
        );

        let row: Option<RunRow> = sqlx::query_as(&sql)
            .bind(project_id)
            .bind(content_fingerprint)
            .bind(memory_version)
            .fetch_optional(&self.pool)
            .await?;

        row.map(RunRecord::try_from).transpose()
    }
}

#[async_trait]
impl ReportStore for SqliteStorage {
    async fn load_reports(&self, analysis_id: &str) -> StorageResult<Vec<StoredReport>> {
        let rows: Vec<ReportRow> = sqlx::query_as(
            r#"
            SELECT analysis_id, tier, project_id, document, updated_at
            FROM reports
            WHERE analysis_id = ?
            ORDER BY tier ASC
            "#,
        )
        .bind(analysis_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(StoredReport::try_from).collect()
    }
}

#[async_trait]
impl WorkflowStore for SqliteStorage {
    async fn find_workflow(
        &self,
        project_id: &str,
        job_id: &str,
    ) -> StorageResult<Option<WorkflowRecord>> {
        let row: Option<WorkflowRow> = sqlx::query_as(
            r#"
            SELECT id, project_id, job_id, status, detail, updated_at
            FROM workflows
            WHERE project_id = ? AND job_id = ?
            "#,
        )
        .bind(project_id)
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(WorkflowRecord::try_from).transpose()
    }
}

#[async_trait]
impl StreamMetaSink for SqliteStorage {
    async fn save_stream_meta(&self, run_id: &str, meta: &StreamMeta) -> StorageResult<()> {
        let document = serde_json::to_string(meta).map_err(|e| StorageError::Serialization {
            table: "stream_meta".to_string(),
            message: e.to_string(),
        })?;

        sqlx::query(
            r#"
            INSERT INTO stream_meta (run_id, project_id, document, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(run_id) DO UPDATE SET
                project_id = excluded.project_id,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(run_id)
        .bind(&meta.project_id)
        .bind(&document)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn parse_status(raw: &str) -> StorageResult<RunStatus> {
    raw.parse().map_err(|message| StorageError::Serialization {
        table: "runs".to_string(),
        message,
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

// Internal row types for SQLx mapping
#[derive(sqlx::FromRow)]
struct RunRow {
    id: String,
    analysis_id: Option<String>,
    project_id: String,
    job_id: Option<String>,
    status: String,
    memory_version: Option<i64>,
    content_fingerprint: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    last_log_at: Option<String>,
}

impl TryFrom<RunRow> for RunRecord {
    type Error = StorageError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            status: parse_status(&row.status)?,
            id: row.id,
            analysis_id: row.analysis_id,
            project_id: row.project_id,
            job_id: row.job_id,
            memory_version: row.memory_version,
            content_fingerprint: row.content_fingerprint,
            created_at: parse_timestamp(&row.created_at),
            completed_at: row.completed_at.as_deref().map(parse_timestamp),
            last_log_at: row.last_log_at.as_deref().map(parse_timestamp),
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReportRow {
    analysis_id: String,
    tier: String,
    project_id: String,
    document: String,
    updated_at: String,
}

impl TryFrom<ReportRow> for StoredReport {
    type Error = StorageError;

    fn try_from(row: ReportRow) -> Result<Self, Self::Error> {
        let mut report: Report =
            serde_json::from_str(&row.document).map_err(|e| StorageError::Serialization {
                table: "reports".to_string(),
                message: e.to_string(),
            })?;
        // The key column is authoritative for the tier.
        report.tier = (!row.tier.is_empty()).then_some(row.tier);

        Ok(Self {
            analysis_id: row.analysis_id,
            project_id: row.project_id,
            report,
            updated_at: parse_timestamp(&row.updated_at),
        })
    }
}

#[derive(sqlx::FromRow)]
struct WorkflowRow {
    id: String,
    project_id: String,
    job_id: String,
    status: String,
    detail: Option<String>,
    updated_at: String,
}

impl TryFrom<WorkflowRow> for WorkflowRecord {
    type Error = StorageError;

    fn try_from(row: WorkflowRow) -> Result<Self, Self::Error> {
        let detail = row
            .detail
            .map(|d| {
                serde_json::from_str(&d).map_err(|e| StorageError::Serialization {
                    table: "workflows".to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        Ok(Self {
            id: row.id,
            project_id: row.project_id,
            job_id: row.job_id,
            status: row.status,
            detail,
            updated_at: parse_timestamp(&row.updated_at),
        })
    }
}
