use crate::store::{InMemoryJobStore, JobStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_model::{HostResult, Job, JobId, JobRecord, JobStatus};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum StoreEvent {
    JobCreated {
        job: Job,
    },
    HostResult {
        job_id: JobId,
        result: HostResult,
    },
    StatusChanged {
        job_id: JobId,
        status: JobStatus,
        completed_at: Option<DateTime<Utc>>,
    },
}

/// Append-only JSON-lines job log. The in-memory view is the fold of every
/// valid event in the file, so reopening the file after a crash recovers
/// whatever was written, including jobs still marked running.
pub struct JsonlJobStore {
    path: PathBuf,
    index: InMemoryJobStore,
    log: Mutex<LogFile>,
}

impl std::fmt::Debug for JsonlJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonlJobStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

struct LogFile {
    file: File,
    /// The last line may be incomplete and must be terminated before the
    /// next event is appended.
    torn: bool,
}

impl JsonlJobStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)
                .await
                .with_context(|| format!("creating {}", dir.display()))?;
        }

        let index = InMemoryJobStore::new();
        let mut torn_tail = false;
        if fs::try_exists(&path).await.unwrap_or(false) {
            let body = fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading job log {}", path.display()))?;
            replay(&index, &path, &body);
            torn_tail = !body.is_empty() && !body.ends_with('\n');
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening job log {}", path.display()))?;

        let unfinished = index
            .jobs()?
            .iter()
            .filter(|job| !job.status.is_terminal())
            .count();
        if unfinished > 0 {
            info!(
                target: "engine::store",
                "{} job(s) in {} have no terminal status",
                unfinished,
                path.display()
            );
        }

        Ok(Self {
            path,
            index,
            log: Mutex::new(LogFile {
                file,
                torn: torn_tail,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one event and folds it into the index. Events the index
    /// would reject never reach the file. Holding the log lock across the
    /// check, the write and the apply keeps the file and the index in step.
    async fn record(&self, event: StoreEvent) -> Result<()> {
        let mut line = serde_json::to_string(&event).context("encoding job event")?;
        line.push('\n');

        let mut log = self.log.lock().await;
        check(&self.index, &event)?;
        if log.torn {
            line.insert(0, '\n');
        }
        let written = async {
            log.file.write_all(line.as_bytes()).await?;
            log.file.flush().await
        }
        .await;
        if let Err(err) = written {
            log.torn = true;
            return Err(err).with_context(|| format!("appending to {}", self.path.display()));
        }
        log.torn = false;
        apply(&self.index, &event)
    }
}

fn check(index: &InMemoryJobStore, event: &StoreEvent) -> Result<()> {
    match event {
        StoreEvent::JobCreated { job } => index.check_job(job),
        StoreEvent::HostResult { job_id, result } => index.check_result(job_id, result),
        StoreEvent::StatusChanged { job_id, status, .. } => index.check_status(job_id, *status),
    }
}

fn apply(index: &InMemoryJobStore, event: &StoreEvent) -> Result<()> {
    match event {
        StoreEvent::JobCreated { job } => index.insert_job(job),
        StoreEvent::HostResult { job_id, result } => index.insert_result(job_id, result),
        StoreEvent::StatusChanged {
            job_id,
            status,
            completed_at,
        } => index.update_status(job_id, *status, *completed_at),
    }
}

fn replay(index: &InMemoryJobStore, path: &Path, body: &str) {
    for (lineno, line) in body.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let event: StoreEvent = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    target: "engine::store",
                    "{}:{}: skipping unreadable event: {err}",
                    path.display(),
                    lineno + 1
                );
                continue;
            }
        };
        if let Err(err) = apply(index, &event) {
            warn!(
                target: "engine::store",
                "{}:{}: skipping rejected event: {err}",
                path.display(),
                lineno + 1
            );
        }
    }
}

#[async_trait]
impl JobStore for JsonlJobStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        self.record(StoreEvent::JobCreated { job: job.clone() }).await
    }

    async fn append_host_result(&self, job_id: &JobId, result: &HostResult) -> Result<()> {
        self.record(StoreEvent::HostResult {
            job_id: job_id.clone(),
            result: result.clone(),
        })
        .await
    }

    async fn set_job_status(
        &self,
        job_id: &JobId,
        status: JobStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.record(StoreEvent::StatusChanged {
            job_id: job_id.clone(),
            status,
            completed_at,
        })
        .await
    }

    async fn get_job(&self, job_id: &JobId) -> Result<JobRecord> {
        self.index.snapshot(job_id)
    }

    async fn list_jobs(&self) -> Result<Vec<Job>> {
        self.index.jobs()
    }
}
