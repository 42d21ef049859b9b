use crate::config::{open_existing_store, DEFAULT_STORE};
use crate::run::summary;
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use fleet_engine::JobStore;
use fleet_model::JobId;
use std::path::PathBuf;

#[derive(Args)]
pub struct JobsCmd {
    #[command(subcommand)]
    pub action: JobsAction,
}

#[derive(Subcommand)]
pub enum JobsAction {
    /// List recorded jobs, newest first
    List {
        #[arg(long, default_value = DEFAULT_STORE)]
        store: PathBuf,
    },
    /// Show one job with its host results
    Show {
        id: String,
        #[arg(long, default_value = DEFAULT_STORE)]
        store: PathBuf,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

pub async fn run(cmd: JobsCmd) -> Result<()> {
    match cmd.action {
        JobsAction::List { store } => {
            let store = open_existing_store(&store).await?;
            let jobs = store.list_jobs().await?;
            if jobs.is_empty() {
                println!("No jobs recorded");
            }
            for job in jobs {
                println!(
                    "{}  {:<9}  {:>4} hosts  {}  {}",
                    job.id,
                    job.status,
                    job.hosts.len(),
                    job.created_at.format("%Y-%m-%d %H:%M:%S"),
                    job.command
                );
            }
        }
        JobsAction::Show { id, store, json } => {
            let id: JobId = id.parse().map_err(anyhow::Error::msg)?;
            let store = open_existing_store(&store).await?;
            let record = store
                .get_job(&id)
                .await
                .with_context(|| format!("looking up job {id}"))?;
            if json {
                println!("{}", serde_json::to_string_pretty(&record)?);
            } else {
                println!("Command: {}", record.job.command);
                println!("Created: {}", record.job.created_at.to_rfc3339());
                if let Some(done) = record.job.completed_at {
                    println!("Completed: {}", done.to_rfc3339());
                }
                for host in &record.job.hosts {
                    match record.result_for(host) {
                        Some(result) => println!("  {host}: {}", result.status),
                        None => println!("  {host}: pending"),
                    }
                }
                println!("{}", summary(&record));
            }
        }
    }
    Ok(())
}
