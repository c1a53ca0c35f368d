//! In-memory job storage for testing and development.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::JobStore;
use crate::kernel::jobs::error::{JobError, Result};
use crate::kernel::jobs::job::{Job, JobSummary, JobUpdate};

struct Entry {
    /// Insertion order, breaks ties between equal `created_at`
    seq: u64,
    job: Job,
}

#[derive(Default)]
struct Inner {
    next_seq: u64,
    jobs: HashMap<Uuid, Entry>,
}

/// In-memory job storage.
///
/// Data is lost on restart. Each operation holds the lock for its whole
/// duration, so reads never observe half-applied updates.
#[derive(Default)]
pub struct MemoryJobStore {
    inner: RwLock<Inner>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Entries sorted newest first.
    fn sorted_newest_first(inner: &Inner) -> Vec<&Entry> {
        let mut entries: Vec<&Entry> = inner.jobs.values().collect();
        entries.sort_by(|a, b| {
            b.job
                .created_at
                .cmp(&a.job.created_at)
                .then(b.seq.cmp(&a.seq))
        });
        entries
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn create(&self, id: Uuid, request_payload: &str) -> Result<Job> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if inner.jobs.contains_key(&id) {
            return Err(JobError::AlreadyExists(id));
        }

        let job = Job::pending(id, request_payload);
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            id,
            Entry {
                seq,
                job: job.clone(),
            },
        );
        Ok(job)
    }

    async fn read(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self
            .inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .get(&id)
            .map(|entry| entry.job.clone()))
    }

    async fn update(&self, id: Uuid, update: JobUpdate) -> Result<()> {
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = inner.jobs.get_mut(&id) {
            update.apply(&mut entry.job, Utc::now());
        }
        Ok(())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self
            .inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .jobs
            .remove(&id)
            .is_some())
    }

    async fn list(&self, limit: usize) -> Result<Vec<JobSummary>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        Ok(Self::sorted_newest_first(&inner)
            .into_iter()
            .take(limit)
            .map(|entry| entry.job.summary())
            .collect())
    }

    async fn unfinished(&self) -> Result<Vec<Job>> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut jobs: Vec<Job> = Self::sorted_newest_first(&inner)
            .into_iter()
            .filter(|entry| !entry.job.status.is_terminal())
            .map(|entry| entry.job.clone())
            .collect();
        jobs.reverse();
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::jobs::job::{JobStatus, ReportArtifacts};

    #[tokio::test]
    async fn create_rejects_duplicate_ids() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();

        store.create(id, "{}").await.unwrap();
        let err = store.create(id, "{}").await.unwrap_err();

        assert!(matches!(err, JobError::AlreadyExists(dup) if dup == id));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn update_appends_logs_in_order() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        let created = store.create(id, "{}").await.unwrap();

        for i in 0..5 {
            store
                .update(id, JobUpdate::log(format!("line {}", i)))
                .await
                .unwrap();
        }

        let job = store.read(id).await.unwrap().unwrap();
        assert_eq!(job.logs, "line 0\nline 1\nline 2\nline 3\nline 4\n");
        assert!(job.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn update_of_missing_job_is_noop() {
        let store = MemoryJobStore::new();
        store
            .update(Uuid::new_v4(), JobUpdate::status(JobStatus::Running))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn late_failure_after_cancel_records_no_error() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(id, "{}").await.unwrap();

        store.update(id, JobUpdate::status(JobStatus::Running)).await.unwrap();
        store.update(id, JobUpdate::status(JobStatus::Canceled)).await.unwrap();
        store
            .update(id, JobUpdate::failed("stage blew up").with_log("[error] stage blew up"))
            .await
            .unwrap();

        let job = store.read(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Canceled);
        assert!(job.error.is_none());
        assert!(job.logs.contains("[error] stage blew up"));
    }

    #[tokio::test]
    async fn report_fields_are_replaced_together() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(id, "{}").await.unwrap();

        store
            .update(
                id,
                JobUpdate::report(ReportArtifacts {
                    html: Some("<h1>r</h1>".into()),
                    markdown: None,
                    path: Some("/tmp/r.html".into()),
                }),
            )
            .await
            .unwrap();

        let job = store.read(id).await.unwrap().unwrap();
        assert_eq!(job.report_html.as_deref(), Some("<h1>r</h1>"));
        assert_eq!(job.report_markdown, None);
        assert_eq!(job.report_path.as_deref(), Some("/tmp/r.html"));
    }

    #[tokio::test]
    async fn list_is_newest_first_and_limited() {
        let store = MemoryJobStore::new();
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        for (i, id) in ids.iter().enumerate() {
            store
                .create(*id, &format!(r#"{{"query":"q{}"}}"#, i))
                .await
                .unwrap();
        }

        let listed = store.list(2).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, ids[2]);
        assert_eq!(listed[1].id, ids[1]);
        assert_eq!(listed[0].query, "q2");
    }

    #[tokio::test]
    async fn unfinished_skips_terminal_jobs() {
        let store = MemoryJobStore::new();
        let done = Uuid::new_v4();
        let waiting = Uuid::new_v4();
        store.create(done, "{}").await.unwrap();
        store.create(waiting, "{}").await.unwrap();
        store
            .update(done, JobUpdate::status(JobStatus::Completed))
            .await
            .unwrap();

        let unfinished = store.unfinished().await.unwrap();
        assert_eq!(unfinished.len(), 1);
        assert_eq!(unfinished[0].id, waiting);
    }

    #[tokio::test]
    async fn delete_reports_presence() {
        let store = MemoryJobStore::new();
        let id = Uuid::new_v4();
        store.create(id, "{}").await.unwrap();

        assert!(store.delete(id).await.unwrap());
        assert!(!store.delete(id).await.unwrap());
        assert!(store.read(id).await.unwrap().is_none());
    }
}
