//! In-memory job ledger.
//!
//! Holds every job created during the life of the process. The creating
//! caller inserts a job once; afterwards only the worker executing it writes
//! to that entry. Nothing here is persisted; finished jobs are recorded
//! separately in the metadata store.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use super::models::{BackupJob, BackupStatus, JobStatus};

#[derive(Clone, Default)]
pub struct JobLedger {
    inner: Arc<RwLock<HashMap<String, BackupJob>>>,
}

impl JobLedger {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub async fn insert(&self, job: BackupJob) {
        let mut map = self.inner.write().await;
        map.insert(job.job_id.clone(), job);
    }

    /// Apply `f` to the job, returning the updated snapshot.
    pub async fn update<F>(&self, job_id: &str, f: F) -> Option<BackupJob>
    where
        F: FnOnce(&mut BackupJob),
    {
        let mut map = self.inner.write().await;
        let job = map.get_mut(job_id)?;
        f(job);
        Some(job.clone())
    }

    /// Replace the stored job with `job` (matched by id).
    pub async fn put(&self, job: BackupJob) {
        self.insert(job).await;
    }

    pub async fn get(&self, job_id: &str) -> Option<BackupJob> {
        let map = self.inner.read().await;
        map.get(job_id).cloned()
    }

    pub async fn len(&self) -> usize {
        let map = self.inner.read().await;
        map.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn count(&self, status: JobStatus) -> usize {
        let map = self.inner.read().await;
        map.values().filter(|job| job.status == status).count()
    }

    pub async fn status(&self) -> BackupStatus {
        let map = self.inner.read().await;
        let count = |status: JobStatus| map.values().filter(|j| j.status == status).count();

        BackupStatus {
            active_jobs: count(JobStatus::Running),
            pending_jobs: count(JobStatus::Pending),
            completed_jobs: count(JobStatus::Completed),
            failed_jobs: count(JobStatus::Failed),
            jobs: map
                .iter()
                .map(|(id, job)| (id.clone(), job.clone()))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::BackupType;
    use std::path::Path;

    fn job(source: &str) -> BackupJob {
        BackupJob::new(Path::new(source), BackupType::Full, Path::new("/backup"))
    }

    #[tokio::test]
    async fn test_ledger_basic_operations() {
        let ledger = JobLedger::new();
        assert!(ledger.is_empty().await);

        let job = job("/models/a");
        let id = job.job_id.clone();
        ledger.insert(job).await;

        assert_eq!(ledger.len().await, 1);
        assert_eq!(ledger.get(&id).await.unwrap().status, JobStatus::Pending);

        let updated = ledger
            .update(&id, |j| {
                j.transition(JobStatus::Running);
            })
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Running);
        assert_eq!(ledger.get(&id).await.unwrap().status, JobStatus::Running);

        assert!(ledger.update("missing", |_| {}).await.is_none());
        assert!(ledger.get("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_status_counts_by_state() {
        let ledger = JobLedger::new();

        let pending = job("/models/a");
        let mut running = job("/models/b");
        running.transition(JobStatus::Running);
        let mut completed = job("/models/c");
        completed.transition(JobStatus::Running);
        completed.transition(JobStatus::Completed);
        let mut failed = job("/models/d");
        failed.transition(JobStatus::Running);
        failed.fail("boom");

        for j in [pending, running, completed, failed] {
            ledger.insert(j).await;
        }

        let status = ledger.status().await;
        assert_eq!(status.pending_jobs, 1);
        assert_eq!(status.active_jobs, 1);
        assert_eq!(status.completed_jobs, 1);
        assert_eq!(status.failed_jobs, 1);
        assert_eq!(status.jobs.len(), 4);
        assert_eq!(ledger.count(JobStatus::Failed).await, 1);
    }
}
