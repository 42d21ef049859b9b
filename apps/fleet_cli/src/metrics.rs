use crate::config::{open_existing_store, DEFAULT_STORE};
use anyhow::Result;
use clap::{Args, ValueEnum};
use fleet_engine::JobStore;
use fleet_model::{HostStatus, JobRecord, JobStatus};
use prometheus::{opts, Encoder, IntGaugeVec, Registry, TextEncoder};
use serde::Serialize;
use serde_json::to_string_pretty;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Args)]
pub struct MetricsCmd {
    #[arg(long, default_value = DEFAULT_STORE)]
    pub store: PathBuf,
    #[arg(long, default_value_t = MetricsFormat::Text, value_enum)]
    pub format: MetricsFormat,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
pub enum MetricsFormat {
    Text,
    Json,
}

pub async fn run(cmd: MetricsCmd) -> Result<()> {
    let store = open_existing_store(&cmd.store).await?;
    let mut records = Vec::new();
    for job in store.list_jobs().await? {
        records.push(store.get_job(&job.id).await?);
    }
    let snapshot = MetricsSnapshot::from_records(unix_timestamp(), &records);

    match cmd.format {
        MetricsFormat::Text => emit_prometheus(&snapshot)?,
        MetricsFormat::Json => println!("{}", to_string_pretty(&snapshot)?),
    }
    Ok(())
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn emit_prometheus(snapshot: &MetricsSnapshot) -> Result<()> {
    let registry = Registry::new();
    let jobs = IntGaugeVec::new(opts!("fleet_jobs", "Recorded jobs by status"), &["status"])?;
    let hosts = IntGaugeVec::new(
        opts!("fleet_host_results", "Recorded host results by status"),
        &["status"],
    )?;
    registry.register(Box::new(jobs.clone()))?;
    registry.register(Box::new(hosts.clone()))?;

    for (status, count) in &snapshot.jobs {
        jobs.with_label_values(&[*status]).set(*count);
    }
    for (status, count) in &snapshot.host_results {
        hosts.with_label_values(&[*status]).set(*count);
    }

    let mut buffer = Vec::new();
    TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
    println!("# scraped_at {}", snapshot.scraped_at);
    println!("{}", String::from_utf8(buffer)?);
    Ok(())
}

#[derive(Debug, Serialize)]
struct MetricsSnapshot {
    scraped_at: u64,
    jobs: BTreeMap<&'static str, i64>,
    host_results: BTreeMap<&'static str, i64>,
}

impl MetricsSnapshot {
    fn from_records(scraped_at: u64, records: &[JobRecord]) -> Self {
        let mut jobs: BTreeMap<&'static str, i64> =
            JobStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();
        let mut host_results: BTreeMap<&'static str, i64> =
            HostStatus::ALL.iter().map(|s| (s.as_str(), 0)).collect();

        for record in records {
            *jobs.entry(record.job.status.as_str()).or_default() += 1;
            for result in &record.results {
                *host_results.entry(result.status.as_str()).or_default() += 1;
            }
        }
        Self {
            scraped_at,
            jobs,
            host_results,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use fleet_model::{HostResult, Job};
    use std::time::Duration;

    #[test]
    fn snapshot_counts_jobs_and_hosts() {
        let mut done = Job::new(
            "uptime",
            vec!["a".into(), "b".into()],
            Duration::from_secs(1),
            Duration::from_secs(5),
        );
        done.transition(JobStatus::Running).unwrap();
        done.transition(JobStatus::Completed).unwrap();
        let pending = Job::new(
            "uptime",
            vec!["c".into()],
            Duration::from_secs(1),
            Duration::from_secs(5),
        );

        let records = vec![
            JobRecord {
                job: done,
                results: vec![
                    HostResult::from_exit("a", String::new(), Some(0), Utc::now(), Duration::ZERO),
                    HostResult::from_exit("b", String::new(), Some(0), Utc::now(), Duration::ZERO),
                ],
            },
            JobRecord {
                job: pending,
                results: Vec::new(),
            },
        ];

        let snapshot = MetricsSnapshot::from_records(123, &records);
        assert_eq!(snapshot.scraped_at, 123);
        assert_eq!(snapshot.jobs["completed"], 1);
        assert_eq!(snapshot.jobs["pending"], 1);
        assert_eq!(snapshot.jobs["cancelled"], 0);
        assert_eq!(snapshot.host_results["success"], 2);
        assert_eq!(snapshot.host_results["timeout"], 0);
    }
}
