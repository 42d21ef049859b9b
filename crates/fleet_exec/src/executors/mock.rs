use crate::{ExecutionRequest, RemoteExecutor};
use async_trait::async_trait;
use chrono::Utc;
use fleet_model::HostResult;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Succeed,
    Fail { exit_code: i32 },
    /// Succeeds after the given delay.
    Delay(Duration),
    /// Never finishes on its own.
    Hang,
    /// Succeeds after the given delay, ignoring both cancellation and the
    /// per-host timeout.
    Unresponsive(Duration),
    Panic,
}

/// Scripted executor for tests and benchmarks. Hosts without a script use
/// the default behaviour after the configured latency.
pub struct MockExecutor {
    default: MockBehavior,
    latency: Duration,
    scripts: HashMap<String, MockBehavior>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    started: Mutex<Vec<String>>,
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExecutor {
    pub fn new() -> Self {
        Self {
            default: MockBehavior::Succeed,
            latency: Duration::from_millis(5),
            scripts: HashMap::new(),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            started: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_default(mut self, behavior: MockBehavior) -> Self {
        self.default = behavior;
        self
    }

    pub fn with_host(mut self, host: impl Into<String>, behavior: MockBehavior) -> Self {
        self.scripts.insert(host.into(), behavior);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Hosts in the order their executions began.
    pub fn start_order(&self) -> Vec<String> {
        self.started
            .lock()
            .map(|started| started.clone())
            .unwrap_or_default()
    }

    fn behavior_for(&self, host: &str) -> MockBehavior {
        self.scripts
            .get(host)
            .cloned()
            .unwrap_or_else(|| self.default.clone())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn execute(
        &self,
        request: ExecutionRequest<'_>,
        cancel: CancellationToken,
    ) -> HostResult {
        let behavior = self.behavior_for(request.host);
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut started) = self.started.lock() {
            started.push(request.host.to_string());
        }
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(&self.in_flight);

        if behavior == MockBehavior::Panic {
            panic!("mock executor panicked on {}", request.host);
        }

        let started_at = Utc::now();
        let clock = Instant::now();
        if let MockBehavior::Unresponsive(delay) = behavior {
            sleep(delay).await;
            let output = format!("[mock] {} => {}\n", request.host, request.command);
            return HostResult::from_exit(
                request.host,
                output,
                Some(0),
                started_at,
                clock.elapsed(),
            );
        }
        let work = async {
            match &behavior {
                MockBehavior::Hang => std::future::pending::<()>().await,
                MockBehavior::Delay(delay) => sleep(*delay).await,
                _ => sleep(self.latency).await,
            }
            let (exit_code, output) = match behavior {
                MockBehavior::Fail { exit_code } => {
                    (exit_code, format!("[mock] {} failed\n", request.host))
                }
                _ => (0, format!("[mock] {} => {}\n", request.host, request.command)),
            };
            HostResult::from_exit(
                request.host,
                output,
                Some(exit_code),
                started_at,
                clock.elapsed(),
            )
        };

        tokio::select! {
            biased;
            result = work => result,
            _ = cancel.cancelled() => HostResult::timeout(
                request.host,
                String::new(),
                "cancelled before completion",
                started_at,
                clock.elapsed(),
            ),
            _ = sleep(request.timeout) => HostResult::timeout(
                request.host,
                String::new(),
                format!("timed out after {}ms", request.timeout.as_millis()),
                started_at,
                clock.elapsed(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::HostStatus;

    fn request(host: &str, timeout: Duration) -> ExecutionRequest<'_> {
        ExecutionRequest {
            host,
            command: "show version",
            timeout,
        }
    }

    #[tokio::test]
    async fn scripted_hosts_follow_their_script() {
        let executor = MockExecutor::new()
            .with_host("bad", MockBehavior::Fail { exit_code: 2 })
            .with_host("slow", MockBehavior::Hang);

        let ok = executor
            .execute(request("good", Duration::from_secs(1)), CancellationToken::new())
            .await;
        assert_eq!(ok.status, HostStatus::Success);

        let bad = executor
            .execute(request("bad", Duration::from_secs(1)), CancellationToken::new())
            .await;
        assert_eq!(bad.exit_code, Some(2));

        let slow = executor
            .execute(request("slow", Duration::from_millis(50)), CancellationToken::new())
            .await;
        assert_eq!(slow.status, HostStatus::Timeout);

        assert_eq!(executor.calls(), 3);
        assert_eq!(executor.in_flight(), 0);
        assert_eq!(executor.start_order(), vec!["good", "bad", "slow"]);
    }

    #[tokio::test]
    async fn unresponsive_host_outlives_cancellation() {
        let executor = MockExecutor::new()
            .with_host("stuck", MockBehavior::Unresponsive(Duration::from_millis(150)));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor
            .execute(request("stuck", Duration::from_millis(10)), cancel)
            .await;
        assert_eq!(result.status, HostStatus::Success);
        assert!(result.duration >= Duration::from_millis(150));
    }
}
