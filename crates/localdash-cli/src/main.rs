//! localdash CLI - token ledger and repository cache from the terminal

mod cli;
mod commands;
mod config;
mod error;


use clap::Parser;
use localdash_core::services::github_client;

use crate::cli::{Cli, Commands};
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::repos::run_repos;
use crate::commands::tokens::run_tokens;
use crate::config::{github_token, CliContext};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    if let Ok(directive) = "localdash=info".parse() {
        filter = filter.add_directive(directive);
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Completions need no config or storage
    if let Commands::Completions { shell, output } = &cli.command {
        return run_completions(*shell, output.as_deref());
    }

    let context = CliContext::resolve(cli.config, cli.data_dir)?;

    match cli.command {
        Commands::Tokens { command } => {
            let services = context.open_services()?;
            run_tokens(command, &services.ledger).await?;
        }
        Commands::Repos { command } => {
            let services = context.open_services()?;
            let cache = services.repository_cache().await?;
            let client = github_client(&context.config, github_token())?;
            run_repos(command, &cache, &services.reconciler, &client).await?;
        }
        Commands::Config { command } => run_config(command, &context)?,
        Commands::Completions { .. } => {}
    }

    Ok(())
}
