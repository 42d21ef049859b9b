use crate::{ExecutionRequest, ExecutorSettings, RemoteExecutor};
use anyhow::{bail, Context, Result};
use async_ssh2_tokio::{AuthMethod, Client, ServerCheckMethod};
use async_trait::async_trait;
use chrono::Utc;
use fleet_model::HostResult;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_SSH_PORT: u16 = 22;

#[derive(Clone)]
pub enum SshAuth {
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
    Password(String),
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field("passphrase", &"******")
                .finish(),
            SshAuth::Password(_) => f.debug_tuple("Password").field(&"******").finish(),
        }
    }
}

/// Opens an in-process SSH session per host. The session lives inside the
/// execution future, so a timeout or cancellation drops and closes it.
#[derive(Debug, Clone)]
pub struct NativeSshExecutor {
    user: String,
    port: u16,
    auth: SshAuth,
    connect_timeout: Duration,
    max_output_bytes: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct Target {
    user: Option<String>,
    host: String,
    port: Option<u16>,
}

impl NativeSshExecutor {
    pub fn new(user: impl Into<String>, auth: SshAuth) -> Self {
        Self {
            user: user.into(),
            port: DEFAULT_SSH_PORT,
            auth,
            connect_timeout: crate::config::ssh_connect_timeout(),
            max_output_bytes: crate::config::max_output_bytes(),
        }
    }

    pub fn from_settings(settings: &ExecutorSettings) -> Result<Self> {
        let auth = match (&settings.key_path, &settings.password_env) {
            (Some(path), _) => SshAuth::KeyFile {
                path: path.clone(),
                passphrase: settings.key_passphrase.clone(),
            },
            (None, Some(var)) => {
                let password = std::env::var(var)
                    .with_context(|| format!("reading ssh password from ${var}"))?;
                SshAuth::Password(password)
            }
            (None, None) => match default_key_file() {
                Some(path) => SshAuth::KeyFile {
                    path,
                    passphrase: settings.key_passphrase.clone(),
                },
                None => bail!("native-ssh executor needs key_path or password_env"),
            },
        };
        let user = settings
            .user
            .clone()
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());
        Ok(Self {
            user,
            port: settings.port.unwrap_or(DEFAULT_SSH_PORT),
            auth,
            connect_timeout: settings.connect_timeout(),
            max_output_bytes: settings.max_output_bytes(),
        })
    }

    async fn auth_method(&self) -> Result<AuthMethod> {
        match &self.auth {
            SshAuth::Password(password) => Ok(AuthMethod::with_password(password)),
            SshAuth::KeyFile { path, passphrase } => {
                let key_content = fs::read_to_string(path)
                    .await
                    .with_context(|| format!("reading ssh key {}", path.display()))?;
                Ok(AuthMethod::with_key(&key_content, passphrase.as_deref()))
            }
        }
    }

    async fn run(&self, target: &Target, command: &str) -> Result<(String, Option<i32>)> {
        let user = target.user.as_deref().unwrap_or(&self.user);
        let port = target.port.unwrap_or(self.port);
        let auth = self.auth_method().await?;
        let connect = Client::connect(
            (target.host.as_str(), port),
            user,
            auth,
            ServerCheckMethod::DefaultKnownHostsFile,
        );
        let client = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| anyhow::anyhow!("connect timed out after {:?}", self.connect_timeout))?
            .with_context(|| format!("ssh connect {}@{}:{}", user, target.host, port))?;

        let executed = client
            .execute(command)
            .await
            .with_context(|| format!("executing on {}", target.host))?;

        let mut output = cap(executed.stdout, self.max_output_bytes);
        output.push_str(&cap(executed.stderr, self.max_output_bytes));
        Ok((output, i32::try_from(executed.exit_status).ok()))
    }
}

#[async_trait]
impl RemoteExecutor for NativeSshExecutor {
    fn name(&self) -> &'static str {
        "native-ssh"
    }

    async fn execute(
        &self,
        request: ExecutionRequest<'_>,
        cancel: CancellationToken,
    ) -> HostResult {
        let target = parse_target(request.host);
        info!(target: "exec::native_ssh", host = %target.host, "ssh {}", request.command);
        let started_at = Utc::now();
        let clock = Instant::now();

        tokio::select! {
            biased;
            outcome = self.run(&target, request.command) => match outcome {
                Ok((output, exit_code)) => HostResult::from_exit(
                    request.host,
                    output,
                    exit_code,
                    started_at,
                    clock.elapsed(),
                ),
                Err(err) => {
                    warn!(target: "exec::native_ssh", host = %target.host, "{err:#}");
                    let message = format!("{err:#}");
                    HostResult::failure(request.host, message, started_at, clock.elapsed())
                }
            },
            _ = cancel.cancelled() => HostResult::timeout(
                request.host,
                String::new(),
                "cancelled before completion",
                started_at,
                clock.elapsed(),
            ),
            _ = tokio::time::sleep(request.timeout) => HostResult::timeout(
                request.host,
                String::new(),
                format!("timed out after {}ms", request.timeout.as_millis()),
                started_at,
                clock.elapsed(),
            ),
        }
    }
}

/// Splits `user@host:port`; bare IPv6 addresses are left whole.
fn parse_target(raw: &str) -> Target {
    let (user, rest) = match raw.rsplit_once('@') {
        Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
        _ => (None, raw),
    };
    if let Some(inner) = rest.strip_prefix('[') {
        if let Some((host, tail)) = inner.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return Target {
                user,
                host: host.to_string(),
                port,
            };
        }
    }
    if rest.matches(':').count() == 1 {
        if let Some((host, port)) = rest.split_once(':') {
            if let Ok(port) = port.parse() {
                return Target {
                    user,
                    host: host.to_string(),
                    port: Some(port),
                };
            }
        }
    }
    Target {
        user,
        host: rest.to_string(),
        port: None,
    }
}

fn cap(mut text: String, limit: usize) -> String {
    if text.len() > limit {
        let mut end = limit;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        text.truncate(end);
        text.push_str("\n[output truncated]\n");
    }
    text
}

fn default_key_file() -> Option<PathBuf> {
    let home = std::env::var_os("HOME")?;
    ["id_ed25519", "id_ecdsa", "id_rsa"]
        .iter()
        .map(|name| Path::new(&home).join(".ssh").join(name))
        .find(|path| path.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_model::HostStatus;

    #[test]
    fn parses_target_forms() {
        assert_eq!(
            parse_target("deploy@web-1:2222"),
            Target {
                user: Some("deploy".into()),
                host: "web-1".into(),
                port: Some(2222),
            }
        );
        assert_eq!(parse_target("web-1").port, None);
        assert_eq!(parse_target("[fe80::1]:22").host, "fe80::1");
        assert_eq!(parse_target("fe80::1").host, "fe80::1");
        assert_eq!(parse_target("web-1:notaport").host, "web-1:notaport");
    }

    #[test]
    fn caps_on_char_boundary() {
        let capped = cap("héllo".to_string(), 2);
        assert!(capped.starts_with('h'));
        assert!(capped.ends_with("[output truncated]\n"));
        assert_eq!(cap("ok".into(), 10), "ok");
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let auth = SshAuth::Password("hunter2".into());
        assert!(!format!("{auth:?}").contains("hunter2"));
    }

    #[tokio::test]
    async fn unreachable_host_fails_without_hanging() {
        let executor = NativeSshExecutor::new("nobody", SshAuth::Password("x".into()));
        let request = ExecutionRequest {
            host: "127.0.0.1:1",
            command: "true",
            timeout: Duration::from_secs(10),
        };
        let result = executor.execute(request, CancellationToken::new()).await;
        assert_eq!(result.status, HostStatus::Failure);
        assert_eq!(result.exit_code, None);
    }
}
