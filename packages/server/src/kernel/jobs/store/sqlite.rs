//! SQLite storage implementation.
//!
//! The default backend. Each operation is a single statement, so SQLite's own
//! locking gives readers a consistent row while a supervisor writes to it.

use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use tracing::info;
use uuid::Uuid;

use super::JobStore;
use crate::kernel::jobs::error::{JobError, Result};
use crate::kernel::jobs::job::{query_from_payload, Job, JobStatus, JobSummary, JobUpdate};

/// SQLite-based job store.
#[derive(Clone)]
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    /// Connect and make sure the schema exists.
    ///
    /// # Example URLs
    /// - `sqlite::memory:` - In-memory database (ephemeral)
    /// - `sqlite://data/mediamonitor.db` - File-based, created if missing
    pub async fn connect(database_url: &str) -> Result<Self> {
        let in_memory = database_url.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));

        let pool_options = if in_memory {
            // Every connection to `:memory:` opens a separate database.
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            if let Some(parent) = options.get_filename().parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
            options = options.journal_mode(SqliteJournalMode::Wal);
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options.connect_with(options).await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'pending',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                request_payload TEXT NOT NULL DEFAULT '{}',
                logs TEXT NOT NULL DEFAULT '',
                report_html TEXT,
                report_markdown TEXT,
                report_path TEXT,
                error TEXT
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_created_at ON jobs(created_at);
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tables created by older releases lack the markdown column.
        let columns: Vec<(String,)> = sqlx::query_as("SELECT name FROM pragma_table_info('jobs')")
            .fetch_all(&self.pool)
            .await?;
        if !columns.iter().any(|(name,)| name == "report_markdown") {
            info!("adding report_markdown column to jobs table");
            sqlx::query("ALTER TABLE jobs ADD COLUMN report_markdown TEXT")
                .execute(&self.pool)
                .await?;
        }

        Ok(())
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering.
fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| JobError::Storage(format!("invalid timestamp {:?}: {}", value, e).into()))
}

fn parse_id(value: &str) -> Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| JobError::Storage(format!("invalid job id {:?}: {}", value, e).into()))
}

// Row types for sqlx queries
#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    status: String,
    request_payload: String,
    logs: String,
    report_html: Option<String>,
    report_markdown: Option<String>,
    report_path: Option<String>,
    error: Option<String>,
    created_at: String,
    updated_at: String,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: parse_id(&self.id)?,
            status: self.status.parse()?,
            request_payload: self.request_payload,
            logs: self.logs,
            report_html: self.report_html,
            report_markdown: self.report_markdown,
            report_path: self.report_path,
            error: self.error,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
struct SummaryRow {
    id: String,
    status: String,
    request_payload: String,
    created_at: String,
    updated_at: String,
}

impl SummaryRow {
    fn into_summary(self) -> Result<JobSummary> {
        Ok(JobSummary {
            id: parse_id(&self.id)?,
            status: self.status.parse::<JobStatus>()?,
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            query: query_from_payload(&self.request_payload),
        })
    }
}

const JOB_COLUMNS: &str = "id, status, request_payload, logs, report_html, report_markdown, \
                           report_path, error, created_at, updated_at";

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn create(&self, id: Uuid, request_payload: &str) -> Result<Job> {
        let job = Job::pending(id, request_payload);

        let inserted = sqlx::query(
            r#"
            INSERT INTO jobs (id, status, created_at, updated_at, request_payload, logs)
            VALUES (?, ?, ?, ?, ?, '')
            "#,
        )
        .bind(id.to_string())
        .bind(job.status.as_str())
        .bind(format_timestamp(job.created_at))
        .bind(format_timestamp(job.updated_at))
        .bind(&job.request_payload)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(_) => Ok(job),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(JobError::AlreadyExists(id))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, id: Uuid) -> Result<Option<Job>> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE id = ?",
            JOB_COLUMNS
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(JobRow::into_job).transpose()
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<()> {
        let log_text = update
            .log_line
            .map(|line| format!("{}\n", line))
            .unwrap_or_default();
        let has_report = update.report.is_some();
        let report = update.report.unwrap_or_default();

        // The status CASE mirrors `JobStatus::can_transition_to`.
        sqlx::query(
            r#"
            UPDATE jobs SET
                status = CASE
                    WHEN status = 'pending' AND ?1 IN ('running', 'completed', 'failed', 'canceled') THEN ?1
                    WHEN status = 'running' AND ?1 IN ('completed', 'failed', 'canceled') THEN ?1
                    ELSE status
                END,
                logs = logs || ?2,
                report_html = CASE WHEN ?3 THEN ?4 ELSE report_html END,
                report_markdown = CASE WHEN ?3 THEN ?5 ELSE report_markdown END,
                report_path = CASE WHEN ?3 THEN ?6 ELSE report_path END,
                error = CASE
                    WHEN ?1 = 'failed' AND status IN ('pending', 'running') THEN COALESCE(?7, error)
                    ELSE error
                END,
                updated_at = ?8
            WHERE id = ?9
            "#,
        )
        .bind(update.status.map(|s| s.as_str()))
        .bind(log_text)
        .bind(has_report)
        .bind(report.html)
        .bind(report.markdown)
        .bind(report.path)
        .bind(update.error)
        .bind(format_timestamp(Utc::now()))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let deleted = sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }

    async fn list(&self, limit: usize) -> Result<Vec<JobSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT id, status, request_payload, created_at, updated_at
            FROM jobs
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(SummaryRow::into_summary).collect()
    }

    async fn unfinished(&self) -> Result<Vec<Job>> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {} FROM jobs WHERE status IN ('pending', 'running') ORDER BY created_at, rowid",
            JOB_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
