//! Job record storage.
//!
//! Available backends:
//! - `MemoryJobStore` - Process-local storage (tests, development)
//! - `SqliteJobStore` - SQLite file-based storage (default)
//!
//! Writers for one job are serialized by that job's supervisor; the store only
//! has to keep each single operation atomic so concurrent readers always see a
//! whole record.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use uuid::Uuid;

use super::error::Result;
use super::job::{Job, JobSummary, JobUpdate};

pub use memory::MemoryJobStore;
pub use sqlite::SqliteJobStore;

/// Durable keyed storage for job records.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` record.
    ///
    /// Fails with `AlreadyExists` if the id is taken.
    async fn create(&self, id: Uuid, request_payload: &str) -> Result<Job>;

    /// Read a full snapshot of a job.
    async fn read(&self, id: Uuid) -> Result<Option<Job>>;

    /// Apply a partial change and refresh `updated_at`.
    ///
    /// A no-op if the job does not exist (it may have been deleted while
    /// its supervisor was still running).
    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<()>;

    /// Remove a job. Returns whether a record was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;

    /// Most recently created jobs first.
    async fn list(&self, limit: usize) -> Result<Vec<JobSummary>>;

    /// Jobs still `pending` or `running`, oldest first.
    async fn unfinished(&self) -> Result<Vec<Job>>;

    /// Check that the backend is reachable.
    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
