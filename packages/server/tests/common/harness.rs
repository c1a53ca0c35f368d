//! Test harness for job integration tests.
//!
//! Every harness gets its own temporary toolchain root with stub stage
//! executables (`sh` scripts placed where the real entry points live) and an
//! in-memory SQLite job store.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use mediamonitor_core::kernel::jobs::{
    Job, JobManager, JobStatus, JobStore, PipelineConfig, SqliteJobStore,
};
use mediamonitor_core::server::{build_app, AppState};
use tempfile::TempDir;
use test_context::AsyncTestContext;
use tokio::time::Instant;
use uuid::Uuid;

/// Collection stub used unless a test installs its own. Echoes its arguments.
pub const DEFAULT_COLLECTION: &str = "echo collected \"$@\"\n";

/// Report stub used unless a test installs its own. `$2` is the query.
pub const DEFAULT_REPORT: &str =
    "mkdir -p final_reports\necho \"<h1>$2</h1>\" > final_reports/report.html\n";

/// Blocks until a `release` file appears in the toolchain root.
pub const WAIT_FOR_RELEASE: &str =
    "echo waiting\nwhile [ ! -f release ]; do sleep 0.05; done\necho released\n";

const WAIT_TIMEOUT: Duration = Duration::from_secs(15);

/// Test harness that manages test infrastructure.
///
/// # Example using test-context
///
/// ```ignore
/// use test_context::test_context;
///
/// #[test_context(TestHarness)]
/// #[tokio::test]
/// async fn my_test(ctx: &TestHarness) {
///     let id = ctx.submit_query("topic").await;
///     ctx.wait_for_terminal(id).await;
/// }
/// ```
pub struct TestHarness {
    /// Toolchain root holding the stage stubs
    pub root: TempDir,
    pub store: Arc<dyn JobStore>,
    pub jobs: JobManager,
}

impl AsyncTestContext for TestHarness {
    async fn setup() -> Self {
        Self::new().await.expect("Failed to create test harness")
    }

    async fn teardown(self) {
        // Supervisors are detached tasks and die with the test runtime; a
        // stage still running then is killed through `kill_on_drop`.
    }
}

impl TestHarness {
    /// Harness running one job at a time.
    pub async fn new() -> Result<Self> {
        Self::with_concurrency(1).await
    }

    pub async fn with_concurrency(max_concurrency: usize) -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let root = tempfile::tempdir().context("Failed to create toolchain root")?;
        let store: Arc<dyn JobStore> = Arc::new(
            SqliteJobStore::in_memory()
                .await
                .context("Failed to open job store")?,
        );

        let pipeline = PipelineConfig::builder()
            .toolchain_root(root.path())
            .interpreter("sh")
            .interpreter_args(Vec::<String>::new())
            .kill_grace(Duration::from_secs(2))
            .build();
        let jobs = JobManager::new(store.clone(), pipeline, max_concurrency);

        let harness = Self { root, store, jobs };
        harness.collection_stage(DEFAULT_COLLECTION);
        harness.report_stage(DEFAULT_REPORT);
        Ok(harness)
    }

    pub fn path(&self) -> &Path {
        self.root.path()
    }

    /// Replace the collection stage script.
    pub fn collection_stage(&self, script: &str) {
        self.write_file("MindSpider/main.py", script);
    }

    /// Replace the report stage script.
    pub fn report_stage(&self, script: &str) {
        self.write_file("report_engine_only.py", script);
    }

    pub fn write_file(&self, relative: &str, content: &str) -> PathBuf {
        let path = self.path().join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create stub directory");
        }
        fs::write(&path, content).expect("Failed to write stub file");
        path
    }

    /// Let every stage blocked on [`WAIT_FOR_RELEASE`] continue.
    pub fn release(&self) {
        self.write_file("release", "");
    }

    pub fn router(&self) -> Router {
        build_app(AppState::new(self.jobs.clone()))
    }

    pub async fn submit_query(&self, query: &str) -> Uuid {
        self.jobs
            .submit(mediamonitor_core::kernel::jobs::JobRequest::for_query(query))
            .await
            .expect("Failed to submit job")
    }

    pub async fn job(&self, id: Uuid) -> Option<Job> {
        self.jobs.get_status(id).await.expect("Failed to read job")
    }

    /// Poll until the job satisfies `condition`.
    pub async fn wait_for<F>(&self, id: Uuid, what: &str, condition: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        loop {
            if let Some(job) = self.job(id).await {
                if condition(&job) {
                    return job;
                }
                if Instant::now() > deadline {
                    panic!(
                        "timed out waiting for {} on job {} (status {}, logs:\n{})",
                        what, id, job.status, job.logs
                    );
                }
            } else if Instant::now() > deadline {
                panic!("timed out waiting for {} on missing job {}", what, id);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    pub async fn wait_for_status(&self, id: Uuid, status: JobStatus) -> Job {
        self.wait_for(id, status.as_str(), |job| job.status == status)
            .await
    }

    pub async fn wait_for_terminal(&self, id: Uuid) -> Job {
        self.wait_for(id, "a terminal status", |job| job.status.is_terminal())
            .await
    }

    pub async fn wait_for_log(&self, id: Uuid, needle: &str) -> Job {
        self.wait_for(id, needle, |job| job.logs.contains(needle))
            .await
    }

    /// Wait until no supervisor holds registry entries any more.
    pub async fn wait_for_idle(&self) {
        let deadline = Instant::now() + WAIT_TIMEOUT;
        while self.jobs.registry().tracked_jobs() > 0 {
            if Instant::now() > deadline {
                panic!("supervisors still running after {:?}", WAIT_TIMEOUT);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Give background tasks a moment to make progress.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
