//! Job infrastructure for running the external analysis pipeline.
//!
//! This module provides:
//! - [`JobStore`] - Durable job records ([`SqliteJobStore`], [`MemoryJobStore`])
//! - [`ConcurrencyGate`] - Bounds how many jobs run at once
//! - [`CancellationRegistry`] - Cancellation marks and live stage processes
//! - [`ProcessRunner`] - Runs one stage process and captures its output
//! - [`StagePipeline`] - Collection and report stages plus artifact discovery
//! - [`JobSupervisor`] - Drives a single job through its state machine
//! - [`JobManager`] - Submit, inspect, cancel, delete, download
//!
//! # Architecture
//!
//! ```text
//! JobManager.submit(request)
//!     │
//!     ├─► JobStore.create (pending)
//!     └─► tokio::spawn(JobSupervisor.run)
//!             │
//!             ├─► ConcurrencyGate.acquire   (cancellable)
//!             ├─► running
//!             ├─► StagePipeline.run_collection ─► ProcessRunner
//!             ├─► StagePipeline.run_report     ─► ProcessRunner
//!             ├─► StagePipeline.load_artifacts
//!             └─► completed | failed | canceled
//!
//! JobManager.cancel(id) ─► CancellationRegistry.request_cancel ─► SIGTERM
//! ```

pub mod cancellation;
pub mod error;
pub mod gate;
mod job;
pub mod manager;
pub mod pipeline;
pub mod process;
pub mod store;
pub mod supervisor;

pub use cancellation::{CancellationRegistry, LiveProcess, ProcessGuard, Registration};
pub use error::{JobError, Result};
pub use gate::{ConcurrencyGate, GatePermit};
pub use job::{
    query_from_payload, Job, JobRequest, JobStatus, JobSummary, JobUpdate, ReportArtifacts,
    DEFAULT_REPORT_QUERY, UNTITLED_QUERY,
};
pub use manager::{CancelOutcome, JobManager, Report, INTERRUPTED_ERROR};
pub use pipeline::{PipelineConfig, StagePipeline, ENGINE_REPORT_DIRS};
pub use process::{ProcessRunner, StageCommand, StageOutcome, DEFAULT_KILL_GRACE};
pub use store::{JobStore, MemoryJobStore, SqliteJobStore};
pub use supervisor::{JobSupervisor, CANCELED_LOG_LINE};
