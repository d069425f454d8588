//! Runtime configuration shared by localdash clients.
//!
//! Stored as JSON. Every field has a default, so an empty object is a valid
//! configuration; unknown fields are rejected to catch typos early.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bus::DEFAULT_BROADCAST_CAPACITY;
use crate::error::{Error, Result};
use crate::github::DEFAULT_API_BASE_URL;
use crate::reconcile::{ReconcileConfig, RetryPolicy, Strategy};
use crate::util::{is_http_url, normalize_text_option};

const STORE_FILE_NAME: &str = "store.db";
const LEDGER_FILE_NAME: &str = "ledger.db";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Directory holding the store and ledger databases
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Timestamp difference (ms) above which two versions of a record conflict
    #[serde(default = "default_skew_threshold_ms")]
    pub skew_threshold_ms: u64,
    #[serde(default)]
    pub strategy: Strategy,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Events a slow context may fall behind by before it starts missing them
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_github_api_base_url")]
    pub github_api_base_url: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(config: RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            skew_threshold_ms: default_skew_threshold_ms(),
            strategy: Strategy::default(),
            retry: RetryConfig::default(),
            broadcast_capacity: default_broadcast_capacity(),
            github_api_base_url: default_github_api_base_url(),
        }
    }
}

impl AppConfig {
    /// Parse and validate a JSON payload
    pub fn from_json(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => Self::from_json(&raw),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No config at {}; using defaults", path.display());
                Ok(Self::default())
            }
            Err(error) => Err(error.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.max_attempts == 0 {
            return Err(Error::InvalidInput(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(Error::InvalidInput(
                "retry.base_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.broadcast_capacity == 0 {
            return Err(Error::InvalidInput(
                "broadcast_capacity must be at least 1".to_string(),
            ));
        }
        let base_url = normalize_text_option(Some(self.github_api_base_url.clone()))
            .ok_or_else(|| Error::InvalidInput("github_api_base_url must not be empty".to_string()))?;
        if !is_http_url(&base_url) {
            return Err(Error::InvalidInput(
                "github_api_base_url must include http:// or https://".to_string(),
            ));
        }
        Ok(())
    }

    /// Data directory, or `fallback` when none is configured
    pub fn data_dir_or(&self, fallback: &Path) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| fallback.to_path_buf())
    }

    pub fn store_path(data_dir: &Path) -> PathBuf {
        data_dir.join(STORE_FILE_NAME)
    }

    pub fn ledger_path(data_dir: &Path) -> PathBuf {
        data_dir.join(LEDGER_FILE_NAME)
    }

    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            skew_threshold: Duration::from_millis(self.skew_threshold_ms),
            strategy: self.strategy,
            retry: self.retry.into(),
        }
    }
}

const fn default_skew_threshold_ms() -> u64 {
    60_000
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_base_delay_ms() -> u64 {
    1_000
}

const fn default_max_delay_ms() -> u64 {
    30_000
}

const fn default_broadcast_capacity() -> usize {
    DEFAULT_BROADCAST_CAPACITY
}

fn default_github_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn empty_object_uses_defaults() {
        let config = AppConfig::from_json("{}").unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(
            config.reconcile_config().skew_threshold,
            Duration::from_secs(60)
        );
        assert_eq!(config.strategy, Strategy::Merge);
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(AppConfig::from_json(r#"{"skew_treshold_ms": 10}"#).is_err());
    }

    #[test]
    fn rejects_invalid_values() {
        assert!(AppConfig::from_json(r#"{"retry": {"max_attempts": 0}}"#).is_err());
        assert!(AppConfig::from_json(r#"{"broadcast_capacity": 0}"#).is_err());
        assert!(AppConfig::from_json(r#"{"github_api_base_url": "api.github.com"}"#).is_err());
        assert!(AppConfig::from_json(r#"{"retry": {"base_delay_ms": 10, "max_delay_ms": 5}}"#).is_err());
    }

    #[test]
    fn parses_partial_overrides() {
        let config = AppConfig::from_json(
            r#"{"strategy": "server", "skew_threshold_ms": 5000, "retry": {"max_attempts": 5}}"#,
        )
        .unwrap();
        let reconcile = config.reconcile_config();
        assert_eq!(reconcile.strategy, Strategy::Server);
        assert_eq!(reconcile.skew_threshold, Duration::from_secs(5));
        assert_eq!(reconcile.retry.max_attempts, 5);
        assert_eq!(reconcile.retry.base_delay, Duration::from_secs(1));
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = AppConfig {
            data_dir: Some(dir.path().to_path_buf()),
            ..AppConfig::default()
        };

        config.save(&path).unwrap();
        assert_eq!(AppConfig::load(&path).unwrap(), config);
        assert_eq!(
            AppConfig::load(&dir.path().join("missing.json")).unwrap(),
            AppConfig::default()
        );
    }

    #[test]
    fn database_paths_live_in_data_dir() {
        let config = AppConfig::default();
        let dir = config.data_dir_or(Path::new("/tmp/localdash"));
        assert_eq!(AppConfig::store_path(&dir), Path::new("/tmp/localdash/store.db"));
        assert_eq!(AppConfig::ledger_path(&dir), Path::new("/tmp/localdash/ledger.db"));
    }
}
