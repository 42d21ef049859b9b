use once_cell::sync::Lazy;
use std::time::Duration;

const DEFAULT_SSH_BINARY: &str = "ssh";
const DEFAULT_SSH_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const DEFAULT_CANCEL_GRACE_MS: u64 = 2_000;

static SSH_BINARY: Lazy<String> = Lazy::new(|| {
    std::env::var("FLEET_SSH_BINARY")
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_SSH_BINARY.to_string())
});

static SSH_CONNECT_TIMEOUT: Lazy<Duration> = Lazy::new(|| {
    env_parse("FLEET_SSH_CONNECT_TIMEOUT_SECS")
        .filter(|secs| *secs > 0)
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(DEFAULT_SSH_CONNECT_TIMEOUT_SECS))
});

static MAX_OUTPUT_BYTES: Lazy<usize> = Lazy::new(|| {
    env_parse("FLEET_MAX_OUTPUT_BYTES")
        .filter(|bytes| *bytes > 0)
        .unwrap_or(DEFAULT_MAX_OUTPUT_BYTES)
});

static CANCEL_GRACE: Lazy<Duration> = Lazy::new(|| {
    env_parse("FLEET_CANCEL_GRACE_MS")
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(DEFAULT_CANCEL_GRACE_MS))
});

pub fn ssh_binary() -> String {
    SSH_BINARY.clone()
}

pub fn ssh_connect_timeout() -> Duration {
    *SSH_CONNECT_TIMEOUT
}

/// Per-stream capture limit; output beyond it is dropped.
pub fn max_output_bytes() -> usize {
    *MAX_OUTPUT_BYTES
}

/// How long a cancelled execution may take to tear down.
pub fn cancel_grace() -> Duration {
    *CANCEL_GRACE
}

fn env_parse<T: std::str::FromStr>(var: &str) -> Option<T> {
    std::env::var(var).ok().and_then(|value| value.trim().parse().ok())
}
