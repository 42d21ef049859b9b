pub mod config;
pub mod file_store;
pub mod hosts;
mod ledger;
pub mod store;

pub use config::DispatcherSettings;
pub use file_store::JsonlJobStore;
pub use hosts::{dedupe_hosts, parse_host_file, parse_hosts};
pub use store::{InMemoryJobStore, JobStore};

use crate::ledger::ResultLedger;
use chrono::Utc;
use fleet_exec::{DynRemoteExecutor, ExecutionRequest};
use fleet_model::{HostId, HostResult, HostStatus, Interruption, Job, JobId, JobRecord, JobStatus};
use futures::FutureExt;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

const FAULT_CHANNEL_CAPACITY: usize = 256;
const FINISHED_CAPACITY: usize = 1024;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("invalid job request: {0}")]
    Validation(String),
    #[error("persisting job failed: {0:#}")]
    Persistence(#[source] anyhow::Error),
    #[error("unknown job {0}")]
    UnknownJob(JobId),
    #[error("job {0} is not active")]
    NotActive(JobId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Persistence,
    Worker,
}

/// Dispatcher-internal problem that did not stop the job.
#[derive(Debug, Clone)]
pub struct DispatchFault {
    pub job_id: JobId,
    pub host: Option<HostId>,
    pub kind: FaultKind,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct JobRequest {
    pub command: String,
    pub hosts: Vec<HostId>,
    pub per_host_timeout: Duration,
    pub overall_timeout: Duration,
    pub max_concurrency: Option<usize>,
}

impl JobRequest {
    pub fn new(
        command: impl Into<String>,
        hosts: Vec<HostId>,
        per_host_timeout: Duration,
        overall_timeout: Duration,
    ) -> Self {
        Self {
            command: command.into(),
            hosts,
            per_host_timeout,
            overall_timeout,
            max_concurrency: None,
        }
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = Some(max_concurrency);
        self
    }
}

#[derive(Clone)]
struct ActiveJob {
    cancel: CancellationToken,
    done: watch::Receiver<Option<JobRecord>>,
}

impl ActiveJob {
    fn is_done(&self) -> bool {
        self.done.borrow().is_some()
    }
}

/// Terminal records this dispatcher produced, oldest evicted first. `wait`
/// answers from here before the store, so a record whose final write failed
/// is still returned.
#[derive(Default)]
struct FinishedJobs {
    order: VecDeque<JobId>,
    records: HashMap<JobId, JobRecord>,
}

impl FinishedJobs {
    fn insert(&mut self, record: JobRecord) {
        let id = record.job.id.clone();
        if self.records.insert(id.clone(), record).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > FINISHED_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.records.remove(&oldest);
            }
        }
    }

    fn get(&self, job_id: &JobId) -> Option<JobRecord> {
        self.records.get(job_id).cloned()
    }
}

/// Fans jobs out across their hosts.
///
/// Every submitted job gets one coordinator task. The coordinator admits
/// per-host workers through a semaphore in host order, races them against
/// the job timer and external cancellation, fills in results for hosts that
/// never finished, and writes the terminal status once.
pub struct Dispatcher {
    executor: DynRemoteExecutor,
    store: Arc<dyn JobStore>,
    settings: DispatcherSettings,
    active: Arc<Mutex<HashMap<JobId, ActiveJob>>>,
    finished: Arc<Mutex<FinishedJobs>>,
    faults: broadcast::Sender<DispatchFault>,
}

impl Dispatcher {
    pub fn new(executor: DynRemoteExecutor, store: Arc<dyn JobStore>) -> Self {
        let (faults, _) = broadcast::channel(FAULT_CHANNEL_CAPACITY);
        Self {
            executor,
            store,
            settings: DispatcherSettings::from_env(),
            active: Arc::new(Mutex::new(HashMap::new())),
            finished: Arc::new(Mutex::new(FinishedJobs::default())),
            faults,
        }
    }

    pub fn with_settings(mut self, settings: DispatcherSettings) -> Self {
        self.settings = settings;
        self.settings.max_concurrency = self.settings.max_concurrency.max(1);
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.settings.max_concurrency = max_concurrency.max(1);
        self
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Subscribes to faults raised after submission.
    pub fn faults(&self) -> broadcast::Receiver<DispatchFault> {
        self.faults.subscribe()
    }

    pub fn active_jobs(&self) -> usize {
        self.lock_active()
            .values()
            .filter(|active| !active.is_done())
            .count()
    }

    /// Validates and records the job, then starts it in the background.
    /// Nothing is written and nothing runs when validation or the initial
    /// store write fails.
    #[instrument(skip(self, request), fields(hosts = request.hosts.len()))]
    pub async fn submit(&self, request: JobRequest) -> Result<JobId, DispatchError> {
        let (hosts, concurrency) = validate(&request, self.settings.max_concurrency)?;
        let job = Job::new(
            request.command,
            hosts,
            request.per_host_timeout,
            request.overall_timeout,
        );
        self.store
            .create_job(&job)
            .await
            .map_err(DispatchError::Persistence)?;

        let job_id = job.id.clone();
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(None);
        self.lock_active().insert(
            job_id.clone(),
            ActiveJob {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );

        info!(
            target: "engine::dispatch",
            job_id = %job_id,
            hosts = job.hosts.len(),
            concurrency,
            "job accepted"
        );

        let run = JobRun {
            job,
            concurrency,
            cancel,
            grace: self.settings.cancel_grace(),
            store_retries: self.settings.store_retries,
            executor: self.executor.clone(),
            store: self.store.clone(),
            faults: self.faults.clone(),
        };
        let active = self.active.clone();
        let finished = self.finished.clone();
        let span = info_span!("job", job_id = %job_id);
        let task_id = job_id.clone();
        tokio::spawn(
            async move {
                let record = run.coordinate().await;
                finished
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(record.clone());
                done_tx.send_replace(Some(record));
                active
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&task_id);
            }
            .instrument(span),
        );

        Ok(job_id)
    }

    /// Requests cancellation of a running job. Hosts that have not started
    /// are recorded as cancelled and running executions are torn down.
    pub fn cancel(&self, job_id: &JobId) -> Result<(), DispatchError> {
        match self.lock_active().get(job_id) {
            Some(active) if !active.is_done() => {
                info!(target: "engine::dispatch", job_id = %job_id, "cancel requested");
                active.cancel.cancel();
                Ok(())
            }
            _ => Err(DispatchError::NotActive(job_id.clone())),
        }
    }

    /// Waits for the job's terminal record. Jobs that finished earlier are
    /// answered from memory, older ones are read back from the store.
    pub async fn wait(&self, job_id: &JobId) -> Result<JobRecord, DispatchError> {
        let active = self.lock_active().get(job_id).cloned();
        if let Some(mut active) = active {
            let finished = active
                .done
                .wait_for(|record| record.is_some())
                .await
                .ok()
                .and_then(|record| record.clone());
            if let Some(record) = finished {
                return Ok(record);
            }
        }
        let finished = self
            .finished
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(job_id);
        if let Some(record) = finished {
            return Ok(record);
        }

        match self.store.get_job(job_id).await {
            Ok(record) if record.job.status.is_terminal() => Ok(record),
            Ok(_) => Err(DispatchError::NotActive(job_id.clone())),
            Err(err) => {
                debug!(target: "engine::dispatch", job_id = %job_id, "lookup failed: {err:#}");
                Err(DispatchError::UnknownJob(job_id.clone()))
            }
        }
    }

    fn lock_active(&self) -> MutexGuard<'_, HashMap<JobId, ActiveJob>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate(
    request: &JobRequest,
    default_concurrency: usize,
) -> Result<(Vec<HostId>, usize), DispatchError> {
    if request.command.trim().is_empty() {
        return Err(DispatchError::Validation("command is empty".into()));
    }
    let hosts = dedupe_hosts(
        request
            .hosts
            .iter()
            .map(|host| host.trim())
            .filter(|host| !host.is_empty())
            .map(str::to_string),
    );
    if hosts.is_empty() {
        return Err(DispatchError::Validation("no target hosts".into()));
    }
    if request.per_host_timeout.is_zero() {
        return Err(DispatchError::Validation(
            "per-host timeout must be positive".into(),
        ));
    }
    if request.overall_timeout.is_zero() {
        return Err(DispatchError::Validation(
            "overall timeout must be positive".into(),
        ));
    }
    let concurrency = request.max_concurrency.unwrap_or(default_concurrency);
    if concurrency == 0 {
        return Err(DispatchError::Validation(
            "max concurrency must be at least 1".into(),
        ));
    }
    Ok((hosts, concurrency))
}

/// Everything a coordinator owns for one job.
struct JobRun {
    job: Job,
    concurrency: usize,
    cancel: CancellationToken,
    grace: Duration,
    store_retries: usize,
    executor: DynRemoteExecutor,
    store: Arc<dyn JobStore>,
    faults: broadcast::Sender<DispatchFault>,
}

/// Shared with every worker of a job.
struct WorkerContext {
    job_id: JobId,
    command: String,
    per_host_timeout: Duration,
    grace: Duration,
    executor: DynRemoteExecutor,
    store: Arc<dyn JobStore>,
    ledger: ResultLedger,
    faults: broadcast::Sender<DispatchFault>,
}

impl WorkerContext {
    fn fault(&self, kind: FaultKind, host: Option<&str>, message: String) {
        let _ = self.faults.send(DispatchFault {
            job_id: self.job_id.clone(),
            host: host.map(str::to_string),
            kind,
            message,
        });
    }

    async fn record(&self, result: HostResult) {
        let host = result.host.clone();
        if let Err(err) = self.ledger.resolve(result.clone()) {
            error!(target: "engine::dispatch", host = %host, "{err}");
            self.fault(FaultKind::Worker, Some(&host), err.to_string());
            return;
        }
        if let Err(err) = self.store.append_host_result(&self.job_id, &result).await {
            error!(
                target: "engine::dispatch",
                host = %host,
                "failed to persist host result: {err:#}"
            );
            self.fault(FaultKind::Persistence, Some(&host), format!("{err:#}"));
        }
    }
}

impl JobRun {
    async fn coordinate(self) -> JobRecord {
        let JobRun {
            mut job,
            concurrency,
            cancel,
            grace,
            store_retries,
            executor,
            store,
            faults,
        } = self;

        let ctx = Arc::new(WorkerContext {
            job_id: job.id.clone(),
            command: job.command.clone(),
            per_host_timeout: job.per_host_timeout,
            grace,
            executor,
            store,
            ledger: ResultLedger::new(&job.hosts),
            faults,
        });

        match job.transition(JobStatus::Running) {
            Ok(()) => {
                let persisted = ctx
                    .store
                    .set_job_status(&job.id, JobStatus::Running, None)
                    .await;
                if let Err(err) = persisted {
                    error!(
                        target: "engine::dispatch",
                        "failed to persist running status: {err:#}"
                    );
                    ctx.fault(FaultKind::Persistence, None, format!("{err:#}"));
                }
            }
            Err(err) => error!(target: "engine::dispatch", "{err}"),
        }

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let stop = CancellationToken::new();
        let mut workers = JoinSet::new();

        let raced = {
            let fan_out = async {
                for host in &job.hosts {
                    let permit = match semaphore.clone().acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };
                    let span = info_span!("host", host = %host);
                    workers.spawn(
                        run_host(ctx.clone(), host.clone(), stop.child_token(), permit)
                            .instrument(span),
                    );
                }
                while let Some(joined) = workers.join_next().await {
                    if let Err(err) = joined {
                        error!(target: "engine::dispatch", "worker task failed: {err}");
                        ctx.fault(FaultKind::Worker, None, err.to_string());
                    }
                }
            };

            tokio::select! {
                biased;
                _ = fan_out => None,
                _ = cancel.cancelled() => Some(Interruption::Cancelled),
                _ = tokio::time::sleep(job.overall_timeout) => Some(Interruption::TimedOut),
            }
        };

        // A stop that lands after the last host resolved preempted nothing.
        // Workers only see `stop`, so none of them can resolve between the
        // race and this check because of the interruption itself.
        let interruption = raced.filter(|_| !ctx.ledger.all_resolved());
        if let Some(reason) = interruption {
            warn!(target: "engine::dispatch", ?reason, "stopping outstanding hosts");
            stop.cancel();
        }
        drain(&mut workers, grace, &ctx).await;

        for (host, started_at) in ctx.ledger.unresolved() {
            let result = match started_at {
                None => HostResult::cancelled(&host, stop_reason(interruption)),
                Some(started_at) => {
                    let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
                    HostResult::timeout(
                        &host,
                        String::new(),
                        "execution did not stop within the cancel grace period",
                        started_at,
                        elapsed,
                    )
                }
            };
            ctx.record(result).await;
        }

        let results = ctx.ledger.results();
        // A stop that raced the last hosts to completion and preempted none
        // of them leaves the outcome to the hosts.
        let interruption = interruption.filter(|_| {
            results
                .iter()
                .any(|r| matches!(r.status, HostStatus::Timeout | HostStatus::Cancelled))
        });
        let status = JobStatus::aggregate(&results, interruption);
        if let Err(err) = job.transition(status) {
            error!(target: "engine::dispatch", "{err}");
        }
        persist_terminal(&ctx, &job, store_retries).await;

        info!(
            target: "engine::dispatch",
            status = %job.status,
            success = count(&results, HostStatus::Success),
            failure = count(&results, HostStatus::Failure),
            timeout = count(&results, HostStatus::Timeout),
            cancelled = count(&results, HostStatus::Cancelled),
            "job finished"
        );

        JobRecord { job, results }
    }
}

/// Joins the remaining workers, aborting any still running after `grace`.
async fn drain(workers: &mut JoinSet<()>, grace: Duration, ctx: &WorkerContext) {
    let joined = tokio::time::timeout(grace, async {
        while let Some(joined) = workers.join_next().await {
            if let Err(err) = joined {
                ctx.fault(FaultKind::Worker, None, err.to_string());
            }
        }
    })
    .await;
    if joined.is_err() {
        warn!(
            target: "engine::dispatch",
            remaining = workers.len(),
            "aborting workers that ignored cancellation"
        );
        workers.abort_all();
        while workers.join_next().await.is_some() {}
    }
}

async fn persist_terminal(ctx: &WorkerContext, job: &Job, retries: usize) {
    let mut last_error = None;
    for attempt in 0..=retries {
        match ctx
            .store
            .set_job_status(&job.id, job.status, job.completed_at)
            .await
        {
            Ok(()) => return,
            Err(err) => {
                warn!(
                    target: "engine::dispatch",
                    attempt = attempt + 1,
                    "failed to persist terminal status: {err:#}"
                );
                last_error = Some(err);
                if attempt < retries {
                    tokio::time::sleep(Duration::from_millis(50 * (attempt as u64 + 1))).await;
                }
            }
        }
    }
    if let Some(err) = last_error {
        error!(
            target: "engine::dispatch",
            "terminal status for job {} not persisted: {err:#}",
            job.id
        );
        ctx.fault(FaultKind::Persistence, None, format!("{err:#}"));
    }
}

async fn run_host(
    ctx: Arc<WorkerContext>,
    host: HostId,
    cancel: CancellationToken,
    permit: OwnedSemaphorePermit,
) {
    ctx.ledger.mark_started(&host);
    let started_at = Utc::now();
    let clock = Instant::now();
    let request = ExecutionRequest {
        host: &host,
        command: &ctx.command,
        timeout: ctx.per_host_timeout,
    };
    let execution = AssertUnwindSafe(ctx.executor.execute(request, cancel)).catch_unwind();

    // Executors honour their own timeout; this bound only catches those that
    // do not. Process teardown may spend up to two grace periods.
    let bound = ctx
        .per_host_timeout
        .saturating_add(ctx.grace.saturating_mul(3));
    let mut result = match tokio::time::timeout(bound, execution).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => {
            let message = format!("executor panicked: {}", panic_message(&*panic));
            error!(target: "engine::dispatch", host = %host, "{message}");
            ctx.fault(FaultKind::Worker, Some(&host), message.clone());
            HostResult::failure(&host, message, started_at, clock.elapsed())
        }
        Err(_) => {
            warn!(target: "engine::dispatch", host = %host, "executor overran its timeout");
            HostResult::timeout(
                &host,
                String::new(),
                format!("executor did not return within {}ms", bound.as_millis()),
                started_at,
                clock.elapsed(),
            )
        }
    };
    drop(permit);

    if result.host != host {
        result.host = host.clone();
    }
    info!(
        target: "engine::dispatch",
        status = %result.status,
        exit_code = ?result.exit_code,
        duration_ms = result.duration.as_millis() as u64,
        "host finished"
    );
    ctx.record(result).await;
}

fn stop_reason(interruption: Option<Interruption>) -> &'static str {
    match interruption {
        Some(Interruption::Cancelled) => "job cancelled before host started",
        Some(Interruption::TimedOut) => "job timed out before host started",
        None => "host was never started",
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn count(results: &[HostResult], status: HostStatus) -> usize {
    results.iter().filter(|r| r.status == status).count()
}
