mod bench;
mod config;
mod jobs;
mod metrics;
mod run;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "fleet", about = "Run a shell command on many hosts in parallel")]
struct Cli {
    /// Log line format on stderr
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command on a set of hosts and wait for the result
    Run(run::RunCmd),
    /// Inspect recorded jobs
    Jobs(jobs::JobsCmd),
    /// Emit a Prometheus snapshot of recorded jobs
    Metrics(metrics::MetricsCmd),
    /// Run a synthetic job against the mock executor
    Bench(bench::BenchCmd),
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let completed = match cli.command {
        Commands::Run(cmd) => run::run(cmd).await?,
        Commands::Jobs(cmd) => jobs::run(cmd).await.map(|_| true)?,
        Commands::Metrics(cmd) => metrics::run(cmd).await.map(|_| true)?,
        Commands::Bench(cmd) => bench::run(cmd).await.map(|_| true)?,
    };

    Ok(if completed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().init(),
    }
}
