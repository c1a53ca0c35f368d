//! Per-job supervisor driving the job state machine.
//!
//! ```text
//! pending ──► running ──► completed
//!    │           ├──────► failed
//!    └───────────┴──────► canceled
//! ```
//!
//! One supervisor invocation owns a job from gate acquisition to its terminal
//! status. It is the only writer of that job's record while it runs.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cancellation::{CancellationRegistry, Registration};
use super::error::Result;
use super::gate::ConcurrencyGate;
use super::job::{Job, JobRequest, JobStatus, JobUpdate};
use super::pipeline::StagePipeline;
use super::process::StageOutcome;
use super::store::JobStore;

/// Log line appended when a job ends as canceled.
pub const CANCELED_LOG_LINE: &str = "[info] canceled";

pub struct JobSupervisor {
    store: Arc<dyn JobStore>,
    gate: ConcurrencyGate,
    registry: Arc<CancellationRegistry>,
    pipeline: StagePipeline,
}

impl JobSupervisor {
    pub fn new(
        store: Arc<dyn JobStore>,
        gate: ConcurrencyGate,
        registry: Arc<CancellationRegistry>,
        pipeline: StagePipeline,
    ) -> Self {
        Self {
            store,
            gate,
            registry,
            pipeline,
        }
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.gate
    }

    pub fn pipeline(&self) -> &StagePipeline {
        &self.pipeline
    }

    /// Drive one job to a terminal status.
    ///
    /// Never returns an error: stage failures end up on the job record, and
    /// store failures while recording them can only be logged.
    pub async fn run(&self, job_id: Uuid) {
        if let Err(e) = self.supervise(job_id).await {
            error!(job_id = %job_id, error = %e, "job supervisor failed");
        }
    }

    async fn supervise(&self, job_id: Uuid) -> Result<()> {
        // Registered before the read so a mark placed by an early cancel or
        // delete is released even when the record is already gone.
        let registration = self.registry.register(job_id);
        let token = registration.token().clone();

        let Some(job) = self.store.read(job_id).await? else {
            debug!(job_id = %job_id, "job record gone before start");
            return Ok(());
        };

        debug!(job_id = %job_id, available = self.gate.available(), "waiting for gate");
        let permit = tokio::select! {
            permit = self.gate.acquire() => permit?,
            _ = token.cancelled() => {
                info!(job_id = %job_id, "job canceled while pending");
                return self.finish(job_id, Ok(StageOutcome::Canceled), &token).await;
            }
        };

        // The permit outlives the registration so the job's registry entries
        // are gone before the next job can start.
        let result = self.execute(job_id, &job, registration).await;
        drop(permit);
        result
    }

    async fn execute(&self, job_id: Uuid, job: &Job, registration: Registration) -> Result<()> {
        let token = registration.token().clone();

        let outcome = match self
            .store
            .update(job_id, JobUpdate::status(JobStatus::Running))
            .await
        {
            Err(e) => Err(e),
            Ok(()) if token.is_cancelled() => Ok(StageOutcome::Canceled),
            Ok(()) => {
                info!(job_id = %job_id, "job running");
                self.run_stages(job_id, job, &token).await
            }
        };
        self.finish(job_id, outcome, &token).await
    }

    /// Collection, report, artifact load. Stops at the first observed
    /// cancellation.
    async fn run_stages(
        &self,
        job_id: Uuid,
        job: &Job,
        token: &CancellationToken,
    ) -> Result<StageOutcome> {
        let request = job.request().unwrap_or_else(|e| {
            warn!(job_id = %job_id, error = %e, "unreadable request payload, using defaults");
            JobRequest::default()
        });

        let outcome = self.pipeline.run_collection(job_id, &request, token).await?;
        if outcome == StageOutcome::Canceled || token.is_cancelled() {
            return Ok(StageOutcome::Canceled);
        }

        let outcome = self.pipeline.run_report(job_id, &request, token).await?;
        if outcome == StageOutcome::Canceled || token.is_cancelled() {
            return Ok(StageOutcome::Canceled);
        }

        let artifacts = self.pipeline.load_artifacts().await?;
        if artifacts.is_empty() {
            warn!(job_id = %job_id, "report stage produced no artifacts");
        }
        self.store
            .update(job_id, JobUpdate::report(artifacts))
            .await?;
        Ok(StageOutcome::Completed)
    }

    /// Record the terminal status. An error seen while a cancellation mark
    /// is present counts as cancellation.
    async fn finish(
        &self,
        job_id: Uuid,
        outcome: Result<StageOutcome>,
        token: &CancellationToken,
    ) -> Result<()> {
        let update = match outcome {
            Ok(StageOutcome::Completed) => {
                info!(job_id = %job_id, "job completed");
                JobUpdate::status(JobStatus::Completed)
            }
            Ok(StageOutcome::Canceled) => {
                info!(job_id = %job_id, "job canceled");
                JobUpdate::status(JobStatus::Canceled).with_log(CANCELED_LOG_LINE)
            }
            Err(e) if token.is_cancelled() => {
                info!(job_id = %job_id, error = %e, "job canceled, stage error ignored");
                JobUpdate::status(JobStatus::Canceled).with_log(CANCELED_LOG_LINE)
            }
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "job failed");
                let message = e.to_string();
                JobUpdate::failed(message.clone()).with_log(format!("[error] {}", message))
            }
        };
        self.store.update(job_id, update).await
    }
}
