use std::path::{Path, PathBuf};

use localdash_core::config::AppConfig;

use crate::cli::{ConfigCommands, StrategyArg};
use crate::config::CliContext;
use crate::error::CliError;

pub fn run_config(command: ConfigCommands, context: &CliContext) -> Result<(), CliError> {
    match command {
        ConfigCommands::Show => run_config_show(context),
        ConfigCommands::Path => {
            println!("{}", context.config_path.display());
            Ok(())
        }
        ConfigCommands::Init {
            data_dir,
            strategy,
            skew_threshold_ms,
            force,
        } => {
            let config = run_config_init(
                &context.config_path,
                data_dir,
                strategy,
                skew_threshold_ms,
                force,
            )?;
            println!("Wrote {}", context.config_path.display());
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn run_config_show(context: &CliContext) -> Result<(), CliError> {
    let mut effective = context.config.clone();
    effective.data_dir = Some(context.data_dir.clone());
    println!("{}", serde_json::to_string_pretty(&effective)?);
    Ok(())
}

/// Write defaults plus overrides to `path`, refusing to clobber without `force`
pub fn run_config_init(
    path: &Path,
    data_dir: Option<PathBuf>,
    strategy: Option<StrategyArg>,
    skew_threshold_ms: Option<u64>,
    force: bool,
) -> Result<AppConfig, CliError> {
    if path.exists() && !force {
        return Err(CliError::Config(format!(
            "{} already exists; pass --force to overwrite",
            path.display()
        )));
    }

    let mut config = AppConfig {
        data_dir,
        ..AppConfig::default()
    };
    if let Some(strategy) = strategy {
        config.strategy = strategy.into();
    }
    if let Some(skew_threshold_ms) = skew_threshold_ms {
        config.skew_threshold_ms = skew_threshold_ms;
    }

    config
        .save(path)
        .map_err(|error| CliError::Config(format!("Failed to write {}: {error}", path.display())))?;
    Ok(config)
}
