use serde::Deserialize;
use std::time::Duration;

const DEFAULT_MAX_CONCURRENCY: usize = 16;
const DEFAULT_STORE_RETRIES: usize = 2;

/// Dispatcher tunables. `Default` reads the `FLEET_*` environment
/// variables; a config file section overrides individual fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    /// Upper bound on hosts executing at once for a single job.
    pub max_concurrency: usize,
    /// Time cancelled workers get to report before they are aborted.
    pub cancel_grace_ms: u64,
    /// Extra attempts for the final status write.
    pub store_retries: usize,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self::from_env()
    }
}

impl DispatcherSettings {
    pub fn from_env() -> Self {
        Self {
            max_concurrency: env_parse("FLEET_MAX_CONCURRENCY")
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_MAX_CONCURRENCY),
            cancel_grace_ms: fleet_exec::config::cancel_grace().as_millis() as u64,
            store_retries: env_parse("FLEET_STORE_RETRIES").unwrap_or(DEFAULT_STORE_RETRIES),
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|value| value.trim().parse().ok())
}
