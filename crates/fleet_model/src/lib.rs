use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type HostId = String;

/// Opaque job identifier. Freshly minted ids are UUIDv4 strings, but any
/// non-empty text read back from a store is accepted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for JobId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err("job id cannot be empty".into());
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
    Cancelled,
}

/// Why a job stopped before every host resolved on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interruption {
    /// The job-level timer fired.
    TimedOut,
    /// An external cancel request arrived.
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::TimedOut,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        !matches!(self, JobStatus::Pending | JobStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed_out",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Folds per-host outcomes into the job's terminal status.
    ///
    /// Precedence is Cancelled > TimedOut > Failed > Completed: an
    /// interruption always wins, otherwise any host that did not succeed
    /// (including a per-host timeout) fails the job.
    pub fn aggregate(results: &[HostResult], interruption: Option<Interruption>) -> JobStatus {
        match interruption {
            Some(Interruption::Cancelled) => JobStatus::Cancelled,
            Some(Interruption::TimedOut) => JobStatus::TimedOut,
            None if results.iter().all(|r| r.status == HostStatus::Success) => {
                JobStatus::Completed
            }
            None => JobStatus::Failed,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "timed_out" | "timedout" | "timeout" => Ok(JobStatus::TimedOut),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("job {job_id}: illegal transition {from} -> {to}")]
pub struct TransitionError {
    pub job_id: JobId,
    pub from: JobStatus,
    pub to: JobStatus,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub hosts: Vec<HostId>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub per_host_timeout: Duration,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub overall_timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
}

impl Job {
    pub fn new(
        command: impl Into<String>,
        hosts: Vec<HostId>,
        per_host_timeout: Duration,
        overall_timeout: Duration,
    ) -> Self {
        Self {
            id: JobId::new(),
            command: command.into(),
            hosts,
            per_host_timeout,
            overall_timeout,
            created_at: Utc::now(),
            completed_at: None,
            status: JobStatus::Pending,
        }
    }

    /// Moves the job along its lifecycle. Terminal states are final and a
    /// running job never returns to pending.
    pub fn transition(&mut self, next: JobStatus) -> Result<(), TransitionError> {
        if !self.status.can_transition_to(next) {
            return Err(TransitionError {
                job_id: self.id.clone(),
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }
}

impl JobStatus {
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Pending, JobStatus::Running) => true,
            (JobStatus::Pending | JobStatus::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HostStatus {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

impl HostStatus {
    pub const ALL: [HostStatus; 4] = [
        HostStatus::Success,
        HostStatus::Failure,
        HostStatus::Timeout,
        HostStatus::Cancelled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            HostStatus::Success => "success",
            HostStatus::Failure => "failure",
            HostStatus::Timeout => "timeout",
            HostStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostResult {
    pub host: HostId,
    pub status: HostStatus,
    pub output: String,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl HostResult {
    /// Result of a process that ran to completion. A missing exit code means
    /// the process was killed by a signal.
    pub fn from_exit(
        host: impl Into<HostId>,
        output: String,
        exit_code: Option<i32>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        let (status, error) = match exit_code {
            Some(0) => (HostStatus::Success, None),
            Some(code) => (HostStatus::Failure, Some(format!("exit status {code}"))),
            None => (HostStatus::Failure, Some("terminated by signal".to_string())),
        };
        Self {
            host: host.into(),
            status,
            output,
            exit_code,
            error,
            duration,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    pub fn failure(
        host: impl Into<HostId>,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Failure,
            output: String::new(),
            exit_code: None,
            error: Some(error.into()),
            duration,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    pub fn timeout(
        host: impl Into<HostId>,
        output: String,
        error: impl Into<String>,
        started_at: DateTime<Utc>,
        duration: Duration,
    ) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Timeout,
            output,
            exit_code: None,
            error: Some(error.into()),
            duration,
            started_at: Some(started_at),
            finished_at: Utc::now(),
        }
    }

    /// A host that never started because its job was stopped first.
    pub fn cancelled(host: impl Into<HostId>, reason: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            status: HostStatus::Cancelled,
            output: String::new(),
            exit_code: None,
            error: Some(reason.into()),
            duration: Duration::ZERO,
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == HostStatus::Success
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub job: Job,
    pub results: Vec<HostResult>,
}

impl JobRecord {
    pub fn count(&self, status: HostStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn success_count(&self) -> usize {
        self.count(HostStatus::Success)
    }

    pub fn result_for(&self, host: &str) -> Option<&HostResult> {
        self.results.iter().find(|r| r.host == host)
    }

    /// Orders results by the job's host order; results for hosts the job
    /// does not list keep their relative order at the end.
    pub fn sort_by_host_order(&mut self) {
        let position = |host: &str| {
            self.job
                .hosts
                .iter()
                .position(|h| h == host)
                .unwrap_or(usize::MAX)
        };
        let mut keyed: Vec<(usize, HostResult)> = self
            .results
            .drain(..)
            .map(|r| (position(&r.host), r))
            .collect();
        keyed.sort_by_key(|(pos, _)| *pos);
        self.results = keyed.into_iter().map(|(_, r)| r).collect();
    }
}
