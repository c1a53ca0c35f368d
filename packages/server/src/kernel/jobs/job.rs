//! Job model for pipeline execution.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{JobError, Result};

/// Topic used for the report stage when the request does not name one.
pub const DEFAULT_REPORT_QUERY: &str = "舆情分析报告";

/// Shown in job listings when the request has no query.
pub const UNTITLED_QUERY: &str = "untitled job";

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }

    /// Whether the job has reached the end of its lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    /// Position along `pending -> running -> terminal`.
    fn rank(&self) -> u8 {
        match self {
            JobStatus::Pending => 0,
            JobStatus::Running => 1,
            _ => 2,
        }
    }

    /// Whether moving from `self` to `next` goes strictly forward.
    ///
    /// `pending` may jump straight to any terminal state (a job cancelled
    /// while waiting for the gate), terminal states never move again.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        self.rank() < next.rank()
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(JobError::Storage(
                format!("unknown job status: {}", other).into(),
            )),
        }
    }
}

// ============================================================================
// Request payload
// ============================================================================

fn default_keywords_count() -> Option<u32> {
    Some(100)
}

fn default_per_platform_limit() -> Option<u32> {
    Some(50)
}

fn default_true() -> bool {
    true
}

/// The structured request a job was created from.
///
/// Missing numeric fields take the service defaults; an explicit `null` or
/// `0` drops the matching collection argument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    /// Topic to analyze
    #[serde(default)]
    pub query: Option<String>,
    /// Target date, `YYYY-MM-DD`
    #[serde(default)]
    pub date: Option<String>,
    /// Platforms to crawl
    #[serde(default)]
    pub platforms: Option<Vec<String>>,
    /// Number of topic keywords to extract
    #[serde(default = "default_keywords_count")]
    pub keywords_count: Option<u32>,
    /// Keywords per platform
    #[serde(default = "default_per_platform_limit")]
    pub max_keywords: Option<u32>,
    /// Items crawled per keyword
    #[serde(default = "default_per_platform_limit")]
    pub max_notes: Option<u32>,
    #[serde(default)]
    pub test_mode: bool,
    #[serde(default = "default_true")]
    pub skip_pdf: bool,
    #[serde(default)]
    pub skip_markdown: bool,
}

impl Default for JobRequest {
    fn default() -> Self {
        Self {
            query: None,
            date: None,
            platforms: None,
            keywords_count: default_keywords_count(),
            max_keywords: default_per_platform_limit(),
            max_notes: default_per_platform_limit(),
            test_mode: false,
            skip_pdf: true,
            skip_markdown: false,
        }
    }
}

impl JobRequest {
    /// Create a request for a topic with all other fields defaulted.
    pub fn for_query(query: impl Into<String>) -> Self {
        Self {
            query: Some(query.into()),
            ..Default::default()
        }
    }

    /// The query handed to the report stage.
    pub fn report_query(&self) -> &str {
        self.query
            .as_deref()
            .filter(|q| !q.trim().is_empty())
            .unwrap_or(DEFAULT_REPORT_QUERY)
    }
}

// ============================================================================
// Job Model
// ============================================================================

/// Result artifacts discovered after the report stage.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportArtifacts {
    pub html: Option<String>,
    pub markdown: Option<String>,
    pub path: Option<String>,
}

impl ReportArtifacts {
    pub fn is_empty(&self) -> bool {
        self.html.is_none() && self.markdown.is_none() && self.path.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub status: JobStatus,

    /// Serialized `JobRequest`, kept verbatim
    pub request_payload: String,

    /// Append-only log, one line per captured output line
    pub logs: String,

    // Results
    pub report_html: Option<String>,
    pub report_markdown: Option<String>,
    pub report_path: Option<String>,
    pub error: Option<String>,

    // Timestamps
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// A freshly created job waiting for its supervisor.
    pub fn pending(id: Uuid, request_payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Pending,
            request_payload: request_payload.into(),
            logs: String::new(),
            report_html: None,
            report_markdown: None,
            report_path: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Deserialize the stored request.
    pub fn request(&self) -> Result<JobRequest> {
        Ok(serde_json::from_str(&self.request_payload)?)
    }

    /// The stored request as loose JSON, `{}` if it cannot be parsed.
    pub fn request_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.request_payload)
            .unwrap_or_else(|_| serde_json::Value::Object(Default::default()))
    }

    pub fn summary(&self) -> JobSummary {
        JobSummary {
            id: self.id,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            query: query_from_payload(&self.request_payload),
        }
    }
}

/// Listing view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub id: Uuid,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub query: String,
}

/// Extract the display query from a serialized payload.
pub fn query_from_payload(payload: &str) -> String {
    serde_json::from_str::<serde_json::Value>(payload)
        .ok()
        .and_then(|v| {
            v.get("query")
                .and_then(|q| q.as_str())
                .filter(|q| !q.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| UNTITLED_QUERY.to_string())
}

// ============================================================================
// Updates
// ============================================================================

/// A partial change to a job record.
///
/// Every applied update refreshes `updated_at`. A status that would move the
/// job backwards is ignored; the other fields still apply, except `error`,
/// which is only recorded together with an accepted move to `failed`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    /// One log line, the store appends the trailing newline
    pub log_line: Option<String>,
    pub report: Option<ReportArtifacts>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn log(line: impl Into<String>) -> Self {
        Self {
            log_line: Some(line.into()),
            ..Default::default()
        }
    }

    pub fn report(report: ReportArtifacts) -> Self {
        Self {
            report: Some(report),
            ..Default::default()
        }
    }

    /// Terminal failure with its reason.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_log(mut self, line: impl Into<String>) -> Self {
        self.log_line = Some(line.into());
        self
    }

    /// Apply this update to an in-memory record.
    pub fn apply(self, job: &mut Job, now: DateTime<Utc>) {
        let mut failed_now = false;
        if let Some(next) = self.status {
            if job.status.can_transition_to(next) {
                job.status = next;
                failed_now = next == JobStatus::Failed;
            }
        }
        if let Some(line) = self.log_line {
            job.logs.push_str(&line);
            job.logs.push('\n');
        }
        if let Some(report) = self.report {
            job.report_html = report.html;
            job.report_markdown = report.markdown;
            job.report_path = report.path;
        }
        if let Some(error) = self.error.filter(|_| failed_now) {
            job.error = Some(error);
        }
        job.updated_at = now;
    }
}
