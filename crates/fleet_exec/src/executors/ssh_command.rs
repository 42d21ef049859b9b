use crate::process::{run_child, ProcessLimits};
use crate::{config, ExecutionRequest, ExecutorSettings, RemoteExecutor};
use async_trait::async_trait;
use fleet_model::{HostResult, HostStatus};
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Exit status OpenSSH reserves for its own errors.
const SSH_ERROR_EXIT: i32 = 255;

/// Runs the command through the system OpenSSH client, one `ssh` process
/// per host. Authentication is whatever the client is configured for
/// (agent, `~/.ssh/config`); `BatchMode` keeps it from prompting.
#[derive(Debug, Clone)]
pub struct SshCommandExecutor {
    binary: String,
    options: Vec<String>,
    user: Option<String>,
    port: Option<u16>,
    connect_timeout: Duration,
    grace: Duration,
    max_output_bytes: usize,
}

impl Default for SshCommandExecutor {
    fn default() -> Self {
        Self {
            binary: config::ssh_binary(),
            options: Vec::new(),
            user: None,
            port: None,
            connect_timeout: config::ssh_connect_timeout(),
            grace: config::cancel_grace(),
            max_output_bytes: config::max_output_bytes(),
        }
    }
}

impl SshCommandExecutor {
    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self {
            binary: settings
                .ssh_binary
                .clone()
                .unwrap_or_else(config::ssh_binary),
            options: settings.ssh_options.clone(),
            user: settings.user.clone(),
            port: settings.port,
            connect_timeout: settings.connect_timeout(),
            grace: settings.cancel_grace(),
            max_output_bytes: settings.max_output_bytes(),
        }
    }

    pub fn build_command(&self, request: &ExecutionRequest<'_>) -> Command {
        let mut command = Command::new(&self.binary);
        command
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)));
        for option in &self.options {
            command.arg("-o").arg(option);
        }
        if let Some(port) = self.port {
            command.arg("-p").arg(port.to_string());
        }
        if let Some(user) = &self.user {
            command.arg("-l").arg(user);
        }
        command.arg("--").arg(request.host).arg(request.command);
        command
    }
}

#[async_trait]
impl RemoteExecutor for SshCommandExecutor {
    fn name(&self) -> &'static str {
        "openssh"
    }

    async fn execute(
        &self,
        request: ExecutionRequest<'_>,
        cancel: CancellationToken,
    ) -> HostResult {
        info!(target: "exec::ssh", host = request.host, "ssh {}", request.command);
        let limits = ProcessLimits {
            timeout: request.timeout,
            grace: self.grace,
            max_output_bytes: self.max_output_bytes,
        };
        let command = self.build_command(&request);
        let mut result = run_child(request.host, command, limits, cancel).await;
        if result.status == HostStatus::Failure && result.exit_code == Some(SSH_ERROR_EXIT) {
            warn!(target: "exec::ssh", host = request.host, "ssh reported a connection error");
            result.error = Some(format!(
                "ssh connection or protocol error (exit status {SSH_ERROR_EXIT})"
            ));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(executor: &SshCommandExecutor, host: &str, command: &str) -> Vec<String> {
        let request = ExecutionRequest {
            host,
            command,
            timeout: Duration::from_secs(1),
        };
        executor
            .build_command(&request)
            .as_std()
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn builds_batch_mode_invocation() {
        let executor = SshCommandExecutor::from_settings(&ExecutorSettings {
            user: Some("deploy".into()),
            port: Some(2222),
            connect_timeout_secs: Some(4),
            ssh_options: vec!["StrictHostKeyChecking=yes".into()],
            ..Default::default()
        });
        let args = args(&executor, "web-1", "uptime");
        assert_eq!(
            args,
            vec![
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=4",
                "-o",
                "StrictHostKeyChecking=yes",
                "-p",
                "2222",
                "-l",
                "deploy",
                "--",
                "web-1",
                "uptime",
            ]
        );
    }

    #[test]
    fn host_cannot_smuggle_options() {
        let executor = SshCommandExecutor::default();
        let args = args(&executor, "-oProxyCommand=evil", "true");
        let separator = args.iter().position(|a| a == "--").unwrap();
        assert_eq!(args[separator + 1], "-oProxyCommand=evil");
    }

    #[tokio::test]
    async fn missing_binary_is_a_failure() {
        let executor = SshCommandExecutor::from_settings(&ExecutorSettings {
            ssh_binary: Some("/nonexistent/ssh".into()),
            ..Default::default()
        });
        let request = ExecutionRequest {
            host: "web-1",
            command: "true",
            timeout: Duration::from_secs(1),
        };
        let result = executor.execute(request, CancellationToken::new()).await;
        assert_eq!(result.status, HostStatus::Failure);
        assert_eq!(result.exit_code, None);
    }
}
