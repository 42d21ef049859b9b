use chrono::Utc;
use fleet_model::HostResult;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Limits applied to one child process.
#[derive(Debug, Clone, Copy)]
pub struct ProcessLimits {
    pub timeout: Duration,
    pub grace: Duration,
    pub max_output_bytes: usize,
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Aborts the reader task if the surrounding future is dropped early.
struct ReaderGuard(Option<JoinHandle<Captured>>);

impl ReaderGuard {
    async fn finish(mut self, grace: Duration) -> Captured {
        let Some(handle) = self.0.take() else {
            return Captured::default();
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(Ok(captured)) => captured,
            Ok(Err(err)) => {
                warn!(target: "exec::process", "output reader failed: {err}");
                Captured::default()
            }
            Err(_) => {
                abort.abort();
                Captured::default()
            }
        }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Runs `command` as a child of this process and turns its outcome into a
/// host result. The child is spawned with `kill_on_drop`, so dropping this
/// future at any await point kills it.
pub async fn run_child(
    host: &str,
    mut command: Command,
    limits: ProcessLimits,
    cancel: CancellationToken,
) -> HostResult {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started_at = Utc::now();
    let clock = Instant::now();
    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(err) => {
            return HostResult::failure(
                host,
                format!("failed to spawn process: {err}"),
                started_at,
                clock.elapsed(),
            )
        }
    };

    let stdout = ReaderGuard(
        child
            .stdout
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, limits.max_output_bytes))),
    );
    let stderr = ReaderGuard(
        child
            .stderr
            .take()
            .map(|pipe| tokio::spawn(read_capped(pipe, limits.max_output_bytes))),
    );

    let outcome = tokio::select! {
        biased;
        status = child.wait() => Outcome::Exited(status),
        _ = cancel.cancelled() => Outcome::Cancelled,
        _ = tokio::time::sleep(limits.timeout) => Outcome::TimedOut,
    };

    if !matches!(outcome, Outcome::Exited(_)) {
        debug!(target: "exec::process", host, "killing child process");
        if let Err(err) = child.start_kill() {
            warn!(target: "exec::process", host, "kill failed: {err}");
        }
        if tokio::time::timeout(limits.grace, child.wait()).await.is_err() {
            warn!(target: "exec::process", host, "child did not exit within grace period");
        }
    }

    let stdout = stdout.finish(limits.grace).await;
    let stderr = stderr.finish(limits.grace).await;
    let output = combine_output(stdout, stderr);
    let elapsed = clock.elapsed();

    match outcome {
        Outcome::Exited(Ok(status)) => {
            HostResult::from_exit(host, output, status.code(), started_at, elapsed)
        }
        Outcome::Exited(Err(err)) => {
            let message = format!("waiting on process: {err}");
            let mut result = HostResult::failure(host, message, started_at, elapsed);
            result.output = output;
            result
        }
        Outcome::TimedOut => HostResult::timeout(
            host,
            output,
            format!("timed out after {}ms", limits.timeout.as_millis()),
            started_at,
            elapsed,
        ),
        Outcome::Cancelled => HostResult::timeout(
            host,
            output,
            "cancelled before completion",
            started_at,
            elapsed,
        ),
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut pipe: R, limit: usize) -> Captured {
    let mut captured = Captured::default();
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                let room = limit.saturating_sub(captured.bytes.len());
                if n > room {
                    captured.truncated = true;
                }
                captured.bytes.extend_from_slice(&chunk[..n.min(room)]);
            }
            Err(err) => {
                debug!(target: "exec::process", "pipe read error: {err}");
                break;
            }
        }
    }
    captured
}

fn combine_output(stdout: Captured, stderr: Captured) -> String {
    let mut output = String::from_utf8_lossy(&stdout.bytes).into_owned();
    if stdout.truncated {
        output.push_str(TRUNCATION_MARKER);
    }
    output.push_str(&String::from_utf8_lossy(&stderr.bytes));
    if stderr.truncated {
        output.push_str(TRUNCATION_MARKER);
    }
    output
}
