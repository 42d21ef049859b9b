use crate::config::{open_store, FileConfig};
use anyhow::{bail, Result};
use clap::Args;
use fleet_engine::{parse_host_file, parse_hosts, Dispatcher, JobRequest};
use fleet_exec::{build_executor, ExecutorKind};
use fleet_model::{HostStatus, JobRecord, JobStatus};
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Args)]
pub struct RunCmd {
    /// Hosts separated by commas, semicolons or whitespace
    #[arg(long, conflicts_with = "hosts_file", required_unless_present = "hosts_file")]
    pub hosts: Option<String>,
    /// File with one or more hosts per line; `#` starts a comment
    #[arg(long)]
    pub hosts_file: Option<PathBuf>,
    #[arg(long)]
    pub command: String,
    /// Seconds each host may run
    #[arg(long)]
    pub per_host_timeout: Option<u64>,
    /// Seconds the whole job may run
    #[arg(long)]
    pub timeout: Option<u64>,
    /// ssh, native-ssh, local or mock
    #[arg(long)]
    pub executor: Option<ExecutorKind>,
    #[arg(long)]
    pub max_concurrency: Option<usize>,
    #[arg(long)]
    pub store: Option<PathBuf>,
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Print the job record as JSON
    #[arg(long, default_value_t = false)]
    pub json: bool,
}

/// Returns whether the job completed.
pub async fn run(cmd: RunCmd) -> Result<bool> {
    let config = FileConfig::load(cmd.config.as_deref())?;
    let hosts = match (&cmd.hosts, &cmd.hosts_file) {
        (Some(text), _) => parse_hosts(text),
        (None, Some(path)) => parse_host_file(path)?,
        (None, None) => bail!("either --hosts or --hosts-file is required"),
    };

    let kind = cmd
        .executor
        .or(config.executor.kind)
        .unwrap_or(ExecutorKind::Ssh);
    let executor = build_executor(kind, &config.executor.settings)?;
    let store = open_store(&config.store_path(cmd.store.clone())).await?;
    let mut dispatcher = Dispatcher::new(executor, store);
    if let Some(settings) = config.dispatcher.clone() {
        dispatcher = dispatcher.with_settings(settings);
    }

    let mut request = JobRequest::new(
        cmd.command.clone(),
        hosts,
        config.per_host_timeout(cmd.per_host_timeout),
        config.timeout(cmd.timeout),
    );
    if let Some(limit) = cmd.max_concurrency {
        request = request.with_max_concurrency(limit);
    }

    let mut faults = dispatcher.faults();
    let job_id = dispatcher.submit(request).await?;
    info!(job_id = %job_id, executor = %kind, "job submitted");

    let wait = dispatcher.wait(&job_id);
    tokio::pin!(wait);
    let mut interrupted = false;
    let record = loop {
        tokio::select! {
            record = &mut wait => break record?,
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                eprintln!("Interrupted, cancelling job {job_id}");
                if let Err(err) = dispatcher.cancel(&job_id) {
                    warn!("{err}");
                }
            }
            Ok(fault) = faults.recv() => {
                warn!(
                    job_id = %fault.job_id,
                    host = ?fault.host,
                    kind = ?fault.kind,
                    "{}",
                    fault.message
                );
            }
        }
    };

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&record)?);
    } else {
        print_results(&record);
    }
    println!("{}", summary(&record));
    Ok(record.job.status == JobStatus::Completed)
}

fn print_results(record: &JobRecord) {
    for result in &record.results {
        let exit = result
            .exit_code
            .map(|code| format!("exit {code}"))
            .unwrap_or_else(|| "no exit".into());
        println!(
            "[{}] {} ({}, {}ms)",
            result.host,
            result.status,
            exit,
            result.duration.as_millis()
        );
        for line in result.output.lines() {
            println!("    {line}");
        }
        if let Some(error) = &result.error {
            println!("    error: {error}");
        }
    }
}

pub fn summary(record: &JobRecord) -> String {
    format!(
        "Job {} {}: success={} failed={} timeout={} cancelled={}",
        record.job.id,
        record.job.status,
        record.count(HostStatus::Success),
        record.count(HostStatus::Failure),
        record.count(HostStatus::Timeout),
        record.count(HostStatus::Cancelled),
    )
}
