use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::scheduler::ParallelismPolicy;

pub const STORE_ENV: &str = "CYTOFLOW_STORE";
pub const WORKERS_ENV: &str = "CYTOFLOW_WORKERS";
pub const DEFAULT_STORE_ROOT: &str = ".cytoflow";

/// Per-stage policy from the `stages` table. `max_attempts` raises the
/// retry budget of retryable stages and is ignored, with a warning, for the
/// rest.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StageOverride {
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
}

impl StageOverride {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub store_root: PathBuf,
    pub parallelism: ParallelismPolicy,
    pub workers: Option<usize>,
    pub persistence_retry: RetryPolicy,
    pub stages: BTreeMap<String, StageOverride>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            store_root: PathBuf::from(DEFAULT_STORE_ROOT),
            parallelism: ParallelismPolicy::Auto,
            workers: None,
            persistence_retry: RetryPolicy::default(),
            stages: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: EngineConfig = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config YAML: {}", path.display()))?;
        Ok(config)
    }

    /// Load `path` if given, otherwise start from defaults; then apply
    /// `CYTOFLOW_STORE` and `CYTOFLOW_WORKERS`. Command-line flags are applied
    /// by the caller.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        if let Ok(root) = std::env::var(STORE_ENV)
            && !root.trim().is_empty()
        {
            config.store_root = PathBuf::from(root);
        }
        if let Ok(raw) = std::env::var(WORKERS_ENV)
            && !raw.trim().is_empty()
        {
            let workers: usize = raw
                .trim()
                .parse()
                .with_context(|| format!("{WORKERS_ENV} must be a positive integer, got '{raw}'"))?;
            config.workers = Some(workers.max(1));
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "store_root: /tmp/cyto\nparallelism: serial\nstages:\n  cluster:\n    timeout_ms: 5000\n"
        )
        .unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.store_root, PathBuf::from("/tmp/cyto"));
        assert_eq!(config.parallelism, ParallelismPolicy::Serial);
        assert_eq!(config.persistence_retry, RetryPolicy::default());
        assert_eq!(
            config.stages["cluster"].timeout(),
            Some(Duration::from_millis(5000))
        );
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "store: somewhere").unwrap();
        assert!(EngineConfig::load(file.path()).is_err());
    }
}
