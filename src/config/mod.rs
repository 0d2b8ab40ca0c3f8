//! Server configuration
//!
//! Values are layered: built-in defaults, then an optional YAML file, then
//! `PORCH_*` environment variables, then command-line flags.
//!
//! ```yaml
//! cacheDir: /var/cache/porch
//! dataDir: /var/lib/porch
//! gitTimeoutSeconds: 60
//! apiReadTimeoutSeconds: 10
//! retry: {baseMs: 500, factor: 2, capMs: 30000, jitter: 0.2, maxAttempts: 5}
//! controllers: {workersPerKind: 1, queueDepth: 64, resyncSeconds: 30}
//! functions:
//!   example.com/set-namespace:v1: /usr/local/bin/set-namespace
//! committer: {name: porch, email: porch@kpt.dev}
//! secrets:
//!   default/git-auth: {username: porch, password: s3cret}
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PorchError, Result};
use crate::git::Credentials;
use crate::retry::Backoff;

pub const CACHE_DIR_ENV: &str = "PORCH_CACHE_DIR";
pub const DATA_DIR_ENV: &str = "PORCH_DATA_DIR";
pub const GIT_TIMEOUT_ENV: &str = "PORCH_GIT_TIMEOUT";

/// Identity recorded on commits and tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Committer {
    pub name: String,
    pub email: String,
}

impl Default for Committer {
    fn default() -> Self {
        Self {
            name: "porch".to_string(),
            email: "porch@kpt.dev".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    pub workers_per_kind: usize,
    pub queue_depth: usize,
    pub resync_seconds: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers_per_kind: 1,
            queue_depth: 64,
            resync_seconds: 30,
        }
    }
}

impl ControllerConfig {
    pub fn resync(&self) -> Duration {
        Duration::from_secs(self.resync_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Git mirrors and scratch directories
    pub cache_dir: PathBuf,
    /// Metadata store root; records stay in memory when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    pub git_timeout_seconds: u64,
    pub api_read_timeout_seconds: u64,
    pub retry: Backoff,
    pub controllers: ControllerConfig,
    /// Function image to local executable
    pub functions: BTreeMap<String, PathBuf>,
    pub committer: Committer,
    /// Basic-auth secrets referenced by repositories, keyed `namespace/name`
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub secrets: BTreeMap<String, Credentials>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            data_dir: None,
            git_timeout_seconds: 60,
            api_read_timeout_seconds: 10,
            retry: Backoff::default(),
            controllers: ControllerConfig::default(),
            functions: BTreeMap::new(),
            committer: Committer::default(),
            secrets: BTreeMap::new(),
        }
    }
}

/// `<user cache dir>/porch`, or the temp dir when there is none
pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(crate::temp::temp_dir_base)
        .join("porch")
}

impl Config {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Defaults overlaid with `path` (when given) and the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| crate::file_error_context!("Failed to read config", path.display(), e))?;
                serde_yaml::from_str(&content).map_err(|e| PorchError::ConfigParseFailed {
                    path: path.display().to_string(),
                    reason: e.to_string(),
                })?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PORCH_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(dir) = non_empty_env(CACHE_DIR_ENV) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty_env(DATA_DIR_ENV) {
            self.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(timeout) = non_empty_env(GIT_TIMEOUT_ENV) {
            self.git_timeout_seconds = timeout.parse().map_err(|_| PorchError::ConfigInvalid {
                message: format!("{GIT_TIMEOUT_ENV} must be a number of seconds, got '{timeout}'"),
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        if self.git_timeout_seconds == 0 {
            problems.push("gitTimeoutSeconds must be positive");
        }
        if self.api_read_timeout_seconds == 0 {
            problems.push("apiReadTimeoutSeconds must be positive");
        }
        if self.retry.factor < 1.0 {
            problems.push("retry.factor must be at least 1");
        }
        if !(0.0..1.0).contains(&self.retry.jitter) {
            problems.push("retry.jitter must be in [0, 1)");
        }
        if self.retry.max_attempts == 0 {
            problems.push("retry.maxAttempts must be positive");
        }
        if self.controllers.queue_depth == 0 {
            problems.push("controllers.queueDepth must be positive");
        }
        if self.controllers.workers_per_kind == 0 {
            problems.push("controllers.workersPerKind must be positive");
        }
        if self.secrets.keys().any(|key| key.split_once('/').is_none_or(|(ns, name)| ns.is_empty() || name.is_empty())) {
            problems.push("secrets must be keyed namespace/name");
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(PorchError::ConfigInvalid {
                message: problems.join("; "),
            })
        }
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.git_timeout_seconds)
    }

    pub fn api_read_timeout(&self) -> Duration {
        Duration::from_secs(self.api_read_timeout_seconds)
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.git_timeout(), Duration::from_secs(60));
        assert_eq!(config.api_read_timeout(), Duration::from_secs(10));
        assert_eq!(config.retry.base_ms, 500);
        assert!(config.cache_dir.ends_with("porch"));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = Config::from_yaml("gitTimeoutSeconds: 5\ncontrollers:\n  queueDepth: 8\n").unwrap();
        assert_eq!(config.git_timeout_seconds, 5);
        assert_eq!(config.controllers.queue_depth, 8);
        assert_eq!(config.controllers.workers_per_kind, 1);
        assert_eq!(config.committer, Committer::default());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = Config::default();
        config.retry.factor = 0.5;
        config.retry.jitter = 1.0;
        config.controllers.queue_depth = 0;
        let err = config.validate().unwrap_err();
        let message = err.to_string();
        assert!(message.contains("retry.factor"));
        assert!(message.contains("retry.jitter"));
        assert!(message.contains("queueDepth"));
        assert_eq!(err.kind(), crate::error::ErrorKind::Invalid);
    }

    #[test]
    fn test_secrets_are_keyed_by_namespace() {
        let config = Config::from_yaml("secrets:\n  default/git-auth: {username: u, password: p}\n").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.secrets["default/git-auth"], Credentials::new("u", "p"));

        let bad = Config::from_yaml("secrets:\n  git-auth: {username: u, password: p}\n").unwrap();
        assert!(bad.validate().unwrap_err().to_string().contains("namespace/name"));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("porch.yaml");
        std::fs::write(&path, "cacheDir: /from/file\ngitTimeoutSeconds: 30\n").unwrap();
        // SAFETY: serialized with other environment tests
        unsafe {
            std::env::set_var(CACHE_DIR_ENV, "/from/env");
            std::env::set_var(GIT_TIMEOUT_ENV, "15");
        }
        let config = Config::load(Some(&path));
        unsafe {
            std::env::remove_var(CACHE_DIR_ENV);
            std::env::remove_var(GIT_TIMEOUT_ENV);
        }
        let config = config.unwrap();
        assert_eq!(config.cache_dir, PathBuf::from("/from/env"));
        assert_eq!(config.git_timeout_seconds, 15);
    }

    #[test]
    fn test_unreadable_file_is_reported() {
        let err = Config::load(Some(Path::new("/nonexistent/porch.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Failed to read config"));
    }
}
