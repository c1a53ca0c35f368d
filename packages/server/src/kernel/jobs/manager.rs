//! Job manager: the operations exposed to the request-serving layer.
//!
//! Submitting a job creates its `pending` record and spawns a supervisor task
//! for it; every other operation reads or mutates the record through the
//! store and talks to running supervisors through the cancellation registry.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::cancellation::CancellationRegistry;
use super::error::{JobError, Result};
use super::gate::ConcurrencyGate;
use super::job::{Job, JobRequest, JobStatus, JobSummary, JobUpdate};
use super::pipeline::{PipelineConfig, StagePipeline};
use super::process::ProcessRunner;
use super::store::JobStore;
use super::supervisor::JobSupervisor;

/// Error recorded on jobs that were running when the service stopped.
pub const INTERRUPTED_ERROR: &str = "interrupted: service restarted while the job was running";

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The job had already reached this terminal status; nothing changed
    AlreadyFinished(JobStatus),
    /// The job is now canceled
    Requested {
        /// Whether a running stage process was signalled
        process_signaled: bool,
    },
}

impl CancelOutcome {
    /// The status to report back to the caller.
    pub fn status(&self) -> JobStatus {
        match self {
            CancelOutcome::AlreadyFinished(status) => *status,
            CancelOutcome::Requested { .. } => JobStatus::Canceled,
        }
    }
}

/// A job's report, in the order it is preferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Report {
    Html(String),
    Markdown(String),
    /// A report file on disk that was not loaded into the record
    File(PathBuf),
}

impl Report {
    pub fn media_type(&self) -> &'static str {
        match self {
            Report::Html(_) => "text/html; charset=utf-8",
            Report::Markdown(_) => "text/markdown; charset=utf-8",
            Report::File(path) => match path.extension().and_then(|e| e.to_str()) {
                Some("html") | Some("htm") => "text/html; charset=utf-8",
                Some("md") => "text/markdown; charset=utf-8",
                _ => "application/octet-stream",
            },
        }
    }
}

#[derive(Clone)]
pub struct JobManager {
    store: Arc<dyn JobStore>,
    registry: Arc<CancellationRegistry>,
    supervisor: Arc<JobSupervisor>,
}

impl JobManager {
    /// Wire up the gate, registry, runner and supervisor around a store.
    pub fn new(store: Arc<dyn JobStore>, pipeline: PipelineConfig, max_concurrency: usize) -> Self {
        let registry = Arc::new(CancellationRegistry::new());
        let runner = ProcessRunner::new(store.clone(), registry.clone(), pipeline.kill_grace);
        let supervisor = JobSupervisor::new(
            store.clone(),
            ConcurrencyGate::new(max_concurrency),
            registry.clone(),
            StagePipeline::new(pipeline, runner),
        );

        Self {
            store,
            registry,
            supervisor: Arc::new(supervisor),
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CancellationRegistry> {
        &self.registry
    }

    /// Number of jobs allowed to run at once.
    pub fn max_concurrency(&self) -> usize {
        self.supervisor.gate().capacity()
    }

    /// Create a `pending` job and start its supervisor in the background.
    pub async fn submit(&self, request: JobRequest) -> Result<Uuid> {
        let payload = serde_json::to_string(&request)?;
        let id = Uuid::new_v4();
        self.store.create(id, &payload).await?;
        info!(job_id = %id, query = request.report_query(), "job submitted");

        self.schedule(id);
        Ok(id)
    }

    fn schedule(&self, id: Uuid) {
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move { supervisor.run(id).await });
    }

    pub async fn get_status(&self, id: Uuid) -> Result<Option<Job>> {
        self.store.read(id).await
    }

    pub async fn list_jobs(&self, limit: usize) -> Result<Vec<JobSummary>> {
        self.store.list(limit).await
    }

    /// Cancel a job. Idempotent; a job that already finished is left alone.
    ///
    /// The record turns `canceled` right away. The supervisor observes the
    /// mark at its next checkpoint and cleans up.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome> {
        let job = self.store.read(id).await?.ok_or(JobError::NotFound(id))?;
        if job.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyFinished(job.status));
        }

        // Mark first so a stage dying from the signal is seen as canceled.
        let process_signaled = self.registry.request_cancel(id);
        self.store
            .update(id, JobUpdate::status(JobStatus::Canceled))
            .await?;
        info!(job_id = %id, process_signaled, "job cancel requested");

        Ok(CancelOutcome::Requested { process_signaled })
    }

    /// Delete a job, cancelling it first if it has not finished.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        let job = self.store.read(id).await?.ok_or(JobError::NotFound(id))?;
        if !job.status.is_terminal() {
            self.cancel(id).await?;
        }

        if !self.store.delete(id).await? {
            return Err(JobError::NotFound(id));
        }
        info!(job_id = %id, "job deleted");
        Ok(())
    }

    /// The job's report: HTML, then Markdown, then the report file if it
    /// still exists.
    pub async fn fetch_report(&self, id: Uuid) -> Result<Report> {
        let job = self.store.read(id).await?.ok_or(JobError::NotFound(id))?;

        if let Some(html) = job.report_html {
            return Ok(Report::Html(html));
        }
        if let Some(markdown) = job.report_markdown {
            return Ok(Report::Markdown(markdown));
        }
        if let Some(path) = job.report_path.map(PathBuf::from) {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(Report::File(path));
            }
        }
        Err(JobError::ReportNotFound(id))
    }

    /// Resume work left over by a previous process.
    ///
    /// Pending jobs are scheduled again. Jobs that were running cannot be
    /// resumed and are marked failed. Returns the number of jobs touched.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let jobs = self.store.unfinished().await?;
        let count = jobs.len();

        for job in jobs {
            match job.status {
                JobStatus::Pending => {
                    info!(job_id = %job.id, "rescheduling pending job");
                    self.schedule(job.id);
                }
                _ => {
                    warn!(job_id = %job.id, status = %job.status, "marking interrupted job failed");
                    self.store
                        .update(
                            job.id,
                            JobUpdate::failed(INTERRUPTED_ERROR)
                                .with_log(format!("[error] {}", INTERRUPTED_ERROR)),
                        )
                        .await?;
                }
            }
        }
        Ok(count)
    }
}
