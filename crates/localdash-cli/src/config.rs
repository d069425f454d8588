//! Config file and data directory resolution for the CLI.

use std::env;
use std::path::{Path, PathBuf};

use localdash_core::config::AppConfig;
use localdash_core::services::Services;
use localdash_core::util::normalize_text_option;

use crate::error::CliError;

const APP_DIR_NAME: &str = "localdash";
const CONFIG_FILE_NAME: &str = "cli-config.json";

pub const CONFIG_PATH_ENV: &str = "LOCALDASH_CONFIG";
pub const DATA_DIR_ENV: &str = "LOCALDASH_DATA_DIR";
pub const GITHUB_TOKEN_ENV: &str = "GITHUB_TOKEN";

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
        .join(CONFIG_FILE_NAME)
}

pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}

/// `--config`, then `LOCALDASH_CONFIG`, then the platform config directory
pub fn resolve_config_path(cli_path: Option<PathBuf>, env_path: Option<PathBuf>) -> PathBuf {
    cli_path.or(env_path).unwrap_or_else(default_config_path)
}

/// `--data-dir`, then `LOCALDASH_DATA_DIR`, then the config file, then the
/// platform data directory
pub fn resolve_data_dir(
    cli_dir: Option<PathBuf>,
    env_dir: Option<PathBuf>,
    config: &AppConfig,
) -> PathBuf {
    cli_dir
        .or(env_dir)
        .unwrap_or_else(|| config.data_dir_or(&default_data_dir()))
}

/// Effective settings for one invocation
#[derive(Debug, Clone)]
pub struct CliContext {
    pub config: AppConfig,
    pub config_path: PathBuf,
    pub data_dir: PathBuf,
}

impl CliContext {
    pub fn resolve(cli_config: Option<PathBuf>, cli_data_dir: Option<PathBuf>) -> Result<Self, CliError> {
        let config_path = resolve_config_path(cli_config, env::var_os(CONFIG_PATH_ENV).map(PathBuf::from));
        let config = load_config(&config_path)?;
        let data_dir = resolve_data_dir(
            cli_data_dir,
            env::var_os(DATA_DIR_ENV).map(PathBuf::from),
            &config,
        );

        Ok(Self {
            config,
            config_path,
            data_dir,
        })
    }

    pub fn open_services(&self) -> Result<Services, CliError> {
        tracing::debug!("Using data directory {}", self.data_dir.display());
        Ok(Services::open(&self.config, &self.data_dir)?)
    }
}

pub fn load_config(path: &Path) -> Result<AppConfig, CliError> {
    AppConfig::load(path).map_err(|error| {
        CliError::Config(format!("Failed to load config at {}: {error}", path.display()))
    })
}

pub fn github_token() -> Option<String> {
    normalize_text_option(env::var(GITHUB_TOKEN_ENV).ok())
}
