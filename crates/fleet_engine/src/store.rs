use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_model::{HostResult, Job, JobId, JobRecord, JobStatus};
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Durable record of jobs and their per-host results. Every call is
/// fallible and callers surface the error.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn create_job(&self, job: &Job) -> Result<()>;
    async fn append_host_result(&self, job_id: &JobId, result: &HostResult) -> Result<()>;
    async fn set_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
    async fn get_job(&self, job_id: &JobId) -> Result<JobRecord>;
    /// Newest first.
    async fn list_jobs(&self) -> Result<Vec<Job>>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    records: RwLock<Records>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert_job(&self, job: &Job) -> Result<()> {
        let mut records = self.write()?;
        ensure_new_job(&records, job)?;
        records.insert(
            job.id.clone(),
            JobRecord {
                job: job.clone(),
                results: Vec::new(),
            },
        );
        Ok(())
    }

    pub(crate) fn insert_result(&self, job_id: &JobId, result: &HostResult) -> Result<()> {
        let mut records = self.write()?;
        ensure_result_slot_free(&records, job_id, result)?;
        if let Some(record) = records.get_mut(job_id) {
            record.results.push(result.clone());
        }
        Ok(())
    }

    pub(crate) fn update_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut records = self.write()?;
        if !ensure_status_change(&records, job_id, status)? {
            return Ok(());
        }
        if let Some(record) = records.get_mut(job_id) {
            record.job.status = status;
            record.job.completed_at = completed_at.or(record.job.completed_at);
        }
        Ok(())
    }

    /// Checks a write without applying it.
    pub(crate) fn check_job(&self, job: &Job) -> Result<()> {
        ensure_new_job(&*self.read()?, job)
    }

    pub(crate) fn check_result(&self, job_id: &JobId, result: &HostResult) -> Result<()> {
        ensure_result_slot_free(&*self.read()?, job_id, result)
    }

    pub(crate) fn check_status(&self, job_id: &JobId, status: JobStatus) -> Result<()> {
        ensure_status_change(&*self.read()?, job_id, status).map(|_| ())
    }

    pub(crate) fn snapshot(&self, job_id: &JobId) -> Result<JobRecord> {
        let records = self.read()?;
        let mut record = records
            .get(job_id)
            .cloned()
            .ok_or_else(|| anyhow!("job {} not found", job_id))?;
        record.sort_by_host_order();
        Ok(record)
    }

    pub(crate) fn jobs(&self) -> Result<Vec<Job>> {
        let records = self.read()?;
        let mut jobs: Vec<Job> = records.values().map(|r| r.job.clone()).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Records>> {
        self.records
            .read()
            .map_err(|_| anyhow!("job store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Records>> {
        self.records
            .write()
            .map_err(|_| anyhow!("job store lock poisoned"))
    }
}

type Records = HashMap<JobId, JobRecord>;

fn ensure_new_job(records: &Records, job: &Job) -> Result<()> {
    if records.contains_key(&job.id) {
        bail!("job {} already exists", job.id);
    }
    Ok(())
}

fn ensure_result_slot_free(records: &Records, job_id: &JobId, result: &HostResult) -> Result<()> {
    let record = records
        .get(job_id)
        .ok_or_else(|| anyhow!("job {} not found", job_id))?;
    if record.results.iter().any(|r| r.host == result.host) {
        bail!("job {}: result for host {} already recorded", job_id, result.host);
    }
    Ok(())
}

/// `Ok(false)` when the job already has this non-terminal status.
fn ensure_status_change(records: &Records, job_id: &JobId, status: JobStatus) -> Result<bool> {
    let job = &records
        .get(job_id)
        .ok_or_else(|| anyhow!("job {} not found", job_id))?
        .job;
    if job.status == status && !status.is_terminal() {
        return Ok(false);
    }
    if !job.status.can_transition_to(status) {
        bail!("job {}: cannot move from {} to {}", job_id, job.status, status);
    }
    Ok(true)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        self.insert_job(job)
    }

    async fn append_host_result(&self, job_id: &JobId, result: &HostResult) -> Result<()> {
        self.insert_result(job_id, result)
    }

    async fn set_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.update_status(job_id, status, completed_at)
    }

    async fn get_job(&self, job_id: &JobId) -> Result<JobRecord> {
        self.snapshot(job_id)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.jobs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::HostStatus;
    use std::time::Duration;

    fn job(hosts: &[&str]) -> Job {
        Job::new(
            "uptime",
            hosts.iter().map(|h| h.to_string()).collect(),
            Duration::from_secs(1),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn records_results_per_host_once() {
        let store = InMemoryJobStore::new();
        let job = job(&["a", "b"]);
        store.create_job(&job).await.unwrap();

        store
            .append_host_result(&job.id, &HostResult::cancelled("b", "stopped"))
            .await
            .unwrap();
        store
            .append_host_result(&job.id, &HostResult::cancelled("a", "stopped"))
            .await
            .unwrap();
        let duplicate = store
            .append_host_result(&job.id, &HostResult::cancelled("a", "again"))
            .await;
        assert!(duplicate.is_err());

        let record = store.get_job(&job.id).await.unwrap();
        let hosts: Vec<_> = record.results.iter().map(|r| r.host.as_str()).collect();
        assert_eq!(hosts, vec!["a", "b"]);
        assert_eq!(record.count(HostStatus::Cancelled), 2);
        assert_eq!(record.result_for("a").unwrap().error.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn terminal_status_written_once() {
        let store = InMemoryJobStore::new();
        let job = job(&["a"]);
        store.create_job(&job).await.unwrap();
        store
            .set_job_status(&job.id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_job_status(&job.id, JobStatus::Running, None)
            .await
            .unwrap();
        store
            .set_job_status(&job.id, JobStatus::Completed, Some(Utc::now()))
            .await
            .unwrap();
        assert!(store
            .set_job_status(&job.id, JobStatus::Failed, Some(Utc::now()))
            .await
            .is_err());

        let record = store.get_job(&job.id).await.unwrap();
        assert_eq!(record.job.status, JobStatus::Completed);
        assert!(record.job.completed_at.is_some());
    }

    #[tokio::test]
    async fn unknown_jobs_and_duplicates_are_errors() {
        let store = InMemoryJobStore::new();
        let job = job(&["a"]);
        assert!(store.get_job(&job.id).await.is_err());
        assert!(store
            .append_host_result(&job.id, &HostResult::cancelled("a", "x"))
            .await
            .is_err());
        store.create_job(&job).await.unwrap();
        assert!(store.create_job(&job).await.is_err());
    }

    #[tokio::test]
    async fn lists_newest_first() {
        let store = InMemoryJobStore::new();
        let mut older = job(&["a"]);
        older.created_at = Utc::now() - chrono::Duration::seconds(60);
        let newer = job(&["b"]);
        store.create_job(&older).await.unwrap();
        store.create_job(&newer).await.unwrap();

        let jobs = store.list_jobs().await.unwrap();
        assert_eq!(jobs[0].id, newer.id);
        assert_eq!(jobs[1].id, older.id);
    }
}
