use anyhow::Result;
use clap::Args;
use fleet_engine::{Dispatcher, InMemoryJobStore, JobRequest};
use fleet_exec::executors::MockExecutor;
use fleet_model::HostId;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Args)]
pub struct BenchCmd {
    #[arg(long, default_value_t = 1000)]
    pub hosts: usize,
    #[arg(long, default_value_t = 100)]
    pub parallel: usize,
    /// Simulated per-host latency in milliseconds
    #[arg(long, default_value_t = 5)]
    pub latency_ms: u64,
}

pub async fn run(cmd: BenchCmd) -> Result<()> {
    let latency = Duration::from_millis(cmd.latency_ms);
    let executor = Arc::new(MockExecutor::new().with_latency(latency));
    let dispatcher = Dispatcher::new(executor.clone(), Arc::new(InMemoryJobStore::new()));

    let request = JobRequest::new(
        format!("bench-{}-{}", cmd.hosts, cmd.parallel),
        build_hosts(cmd.hosts),
        Duration::from_secs(30),
        Duration::from_secs(3600),
    )
    .with_max_concurrency(cmd.parallel);

    let start = Instant::now();
    let job_id = dispatcher.submit(request).await?;
    let record = dispatcher.wait(&job_id).await?;
    let elapsed = start.elapsed().as_secs_f64();
    let total = record.results.len() as f64;
    let throughput = if elapsed > 0.0 {
        total / elapsed
    } else {
        total
    };

    println!("Hosts processed: {}", total as usize);
    println!("Status: {}", record.job.status);
    println!("Peak concurrency: {}", executor.peak_in_flight());
    println!("Elapsed: {:.2}s", elapsed);
    println!("Throughput: {:.2} hosts/sec", throughput);
    Ok(())
}

fn build_hosts(count: usize) -> Vec<HostId> {
    (0..count).map(|i| format!("bench-{i}")).collect()
}
