use anyhow::{bail, Context, Result};
use fleet_engine::{DispatcherSettings, JsonlJobStore};
use fleet_exec::{ExecutorKind, ExecutorSettings};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_STORE: &str = ".fleet/jobs.jsonl";
const DEFAULT_PER_HOST_TIMEOUT_SECS: u64 = 30;
const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Optional YAML file passed with `--config`. Command-line flags win over
/// anything set here.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub store: Option<PathBuf>,
    pub per_host_timeout_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub executor: ExecutorSection,
    pub dispatcher: Option<DispatcherSettings>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ExecutorSection {
    pub kind: Option<ExecutorKind>,
    #[serde(flatten)]
    pub settings: ExecutorSettings,
}

impl FileConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn per_host_timeout(&self, flag: Option<u64>) -> Duration {
        Duration::from_secs(
            flag.or(self.per_host_timeout_secs)
                .unwrap_or(DEFAULT_PER_HOST_TIMEOUT_SECS),
        )
    }

    pub fn timeout(&self, flag: Option<u64>) -> Duration {
        Duration::from_secs(flag.or(self.timeout_secs).unwrap_or(DEFAULT_TIMEOUT_SECS))
    }

    pub fn store_path(&self, flag: Option<PathBuf>) -> PathBuf {
        flag.or_else(|| self.store.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE))
    }
}

pub async fn open_store(path: &Path) -> Result<Arc<JsonlJobStore>> {
    let store = JsonlJobStore::open(path)
        .await
        .with_context(|| format!("opening job store {}", path.display()))?;
    Ok(Arc::new(store))
}

/// Opens a store for reading without creating it.
pub async fn open_existing_store(path: &Path) -> Result<Arc<JsonlJobStore>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        bail!("no job store at {}", path.display());
    }
    open_store(path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sections_and_applies_flag_precedence() {
        let config: FileConfig = serde_yaml::from_str(
            r#"
store: /var/lib/fleet/jobs.jsonl
per_host_timeout_secs: 5
executor:
  kind: native-ssh
  user: deploy
  port: 2222
  ssh_options: ["StrictHostKeyChecking=no"]
dispatcher:
  max_concurrency: 4
"#,
        )
        .unwrap();

        assert_eq!(config.executor.kind, Some(ExecutorKind::NativeSsh));
        assert_eq!(config.executor.settings.user.as_deref(), Some("deploy"));
        assert_eq!(config.executor.settings.port, Some(2222));
        assert_eq!(config.dispatcher.as_ref().unwrap().max_concurrency, 4);
        assert_eq!(config.per_host_timeout(None), Duration::from_secs(5));
        assert_eq!(config.per_host_timeout(Some(9)), Duration::from_secs(9));
        assert_eq!(config.timeout(None), Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        assert_eq!(
            config.store_path(Some("other.jsonl".into())),
            PathBuf::from("other.jsonl")
        );
    }

    #[test]
    fn missing_config_means_defaults() {
        let config = FileConfig::load(None).unwrap();
        assert!(config.executor.kind.is_none());
        assert_eq!(config.store_path(None), PathBuf::from(DEFAULT_STORE));
    }

    #[tokio::test]
    async fn missing_store_is_not_created_for_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("jobs.jsonl");
        let err = open_existing_store(&path).await.unwrap_err();
        assert!(err.to_string().starts_with("no job store at"));
        assert!(!path.exists());
        assert!(!dir.path().join("state").exists());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(serde_yaml::from_str::<FileConfig>("parallelism: 3\n").is_err());
    }
}
