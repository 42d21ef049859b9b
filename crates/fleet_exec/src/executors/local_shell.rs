use crate::process::{run_child, ProcessLimits};
use crate::{config, ExecutionRequest, ExecutorSettings, RemoteExecutor};
use async_trait::async_trait;
use fleet_model::HostResult;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs the command through `sh -c` on this machine, exposing the target
/// host as `FLEET_HOST`.
#[derive(Debug, Clone)]
pub struct LocalShellExecutor {
    shell: String,
    grace: Duration,
    max_output_bytes: usize,
}

impl Default for LocalShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".into(),
            grace: config::cancel_grace(),
            max_output_bytes: config::max_output_bytes(),
        }
    }
}

impl LocalShellExecutor {
    pub fn from_settings(settings: &ExecutorSettings) -> Self {
        Self {
            grace: settings.cancel_grace(),
            max_output_bytes: settings.max_output_bytes(),
            ..Self::default()
        }
    }

    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }
}

#[async_trait]
impl RemoteExecutor for LocalShellExecutor {
    fn name(&self) -> &'static str {
        "local-shell"
    }

    async fn execute(
        &self,
        request: ExecutionRequest<'_>,
        cancel: CancellationToken,
    ) -> HostResult {
        info!(target: "exec::local", host = request.host, "running {}", request.command);
        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(request.command)
            .env("FLEET_HOST", request.host);
        let limits = ProcessLimits {
            timeout: request.timeout,
            grace: self.grace,
            max_output_bytes: self.max_output_bytes,
        };
        run_child(request.host, command, limits, cancel).await
    }
}
