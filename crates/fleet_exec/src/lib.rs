pub mod config;
pub mod executors;
pub mod process;

use anyhow::Result;
use async_trait::async_trait;
use fleet_model::HostResult;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
pub struct ExecutionRequest<'a> {
    pub host: &'a str,
    pub command: &'a str,
    pub timeout: Duration,
}

/// Runs one command on one host.
///
/// Implementations never return an error: connection problems, spawn
/// failures and non-zero exits are all recorded in the returned
/// [`HostResult`]. When `timeout` elapses or `cancel` fires the in-flight
/// process or session must be torn down and a `Timeout` result returned
/// promptly.
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    async fn execute(&self, request: ExecutionRequest<'_>, cancel: CancellationToken) -> HostResult;
}

pub type DynRemoteExecutor = Arc<dyn RemoteExecutor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutorKind {
    Ssh,
    NativeSsh,
    Local,
    Mock,
}

impl FromStr for ExecutorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ssh" | "openssh" => Ok(ExecutorKind::Ssh),
            "native-ssh" | "native_ssh" | "nativessh" => Ok(ExecutorKind::NativeSsh),
            "local" | "shell" => Ok(ExecutorKind::Local),
            "mock" => Ok(ExecutorKind::Mock),
            other => Err(format!("unknown executor '{}'", other)),
        }
    }
}

impl fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutorKind::Ssh => "ssh",
            ExecutorKind::NativeSsh => "native-ssh",
            ExecutorKind::Local => "local",
            ExecutorKind::Mock => "mock",
        })
    }
}

/// Executor options as they appear in the `executor:` section of a config
/// file. Unset fields fall back to the environment-driven defaults in
/// [`config`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub ssh_binary: Option<String>,
    pub ssh_options: Vec<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub connect_timeout_secs: Option<u64>,
    pub key_path: Option<PathBuf>,
    pub key_passphrase: Option<String>,
    pub password_env: Option<String>,
    pub max_output_bytes: Option<usize>,
    pub cancel_grace_ms: Option<u64>,
}

impl ExecutorSettings {
    pub fn cancel_grace(&self) -> Duration {
        self.cancel_grace_ms
            .map(Duration::from_millis)
            .unwrap_or_else(config::cancel_grace)
    }

    pub fn max_output_bytes(&self) -> usize {
        self.max_output_bytes
            .filter(|bytes| *bytes > 0)
            .unwrap_or_else(config::max_output_bytes)
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or_else(config::ssh_connect_timeout)
    }
}

pub fn build_executor(
    kind: ExecutorKind,
    settings: &ExecutorSettings,
) -> Result<DynRemoteExecutor> {
    use executors::{LocalShellExecutor, MockExecutor, NativeSshExecutor, SshCommandExecutor};

    let executor: DynRemoteExecutor = match kind {
        ExecutorKind::Ssh => Arc::new(SshCommandExecutor::from_settings(settings)),
        ExecutorKind::NativeSsh => Arc::new(NativeSshExecutor::from_settings(settings)?),
        ExecutorKind::Local => Arc::new(LocalShellExecutor::from_settings(settings)),
        ExecutorKind::Mock => Arc::new(MockExecutor::new()),
    };
    Ok(executor)
}
