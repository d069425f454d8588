use localdash_core::github::GithubClient;
use localdash_core::models::Repository;
use localdash_core::reconcile::{Conflict, Reconciler};
use localdash_core::services::{RefreshOutcome, RepositoryCache};

use crate::cli::ReposCommands;
use crate::commands::common::{
    conflict_to_item, format_conflict_lines, format_repository_lines, format_sync_stats,
    ConflictItem,
};
use crate::error::CliError;

pub async fn run_repos(
    command: ReposCommands,
    cache: &RepositoryCache,
    reconciler: &Reconciler,
    client: &GithubClient,
) -> Result<(), CliError> {
    match command {
        ReposCommands::List { json } => run_list(cache, json).await,
        ReposCommands::Sync { user, strategy } => {
            let reconciler = match strategy {
                Some(strategy) => with_strategy(reconciler, strategy.into()),
                None => reconciler.clone(),
            };
            run_sync(cache, &reconciler, client, &user).await.map(|_| ())
        }
        ReposCommands::Diff { user, json } => {
            run_diff(cache, reconciler, client, &user, json).await.map(|_| ())
        }
    }
}

pub fn with_strategy(reconciler: &Reconciler, strategy: localdash_core::reconcile::Strategy) -> Reconciler {
    let mut config = *reconciler.config();
    config.strategy = strategy;
    Reconciler::new(config)
}

pub async fn run_list(cache: &RepositoryCache, as_json: bool) -> Result<(), CliError> {
    let repositories = cache.load().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&repositories)?);
    } else if repositories.is_empty() {
        println!("No cached repositories; run `localdash repos sync <user>`");
    } else {
        for line in format_repository_lines(&repositories) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_sync(
    cache: &RepositoryCache,
    reconciler: &Reconciler,
    client: &GithubClient,
    user: &str,
) -> Result<RefreshOutcome, CliError> {
    let outcome = cache
        .refresh(reconciler, || client.fetch_user_repositories(user))
        .await?;
    report_sync(&outcome, reconciler);
    Ok(outcome)
}

fn report_sync(outcome: &RefreshOutcome, reconciler: &Reconciler) {
    if outcome.stale {
        eprintln!(
            "Warning: could not reach GitHub after {} attempt(s); showing {} cached repositories",
            reconciler.config().retry.max_attempts,
            outcome.repositories.len()
        );
        return;
    }

    let stats = outcome
        .result
        .as_ref()
        .map(|result| format_sync_stats(&result.stats))
        .unwrap_or_default();
    println!(
        "Synced {} repositories (strategy={})  {stats}",
        outcome.repositories.len(),
        reconciler.config().strategy
    );
}

pub async fn run_diff(
    cache: &RepositoryCache,
    reconciler: &Reconciler,
    client: &GithubClient,
    user: &str,
    as_json: bool,
) -> Result<Vec<Conflict<Repository>>, CliError> {
    let server = client.fetch_user_repositories(user).await?;
    let conflicts = cache.diff(reconciler, &server).await?;

    if as_json {
        let items = conflicts.iter().map(conflict_to_item).collect::<Vec<ConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else if conflicts.is_empty() {
        println!("Cache is up to date");
    } else {
        for line in format_conflict_lines(&conflicts) {
            println!("{line}");
        }
    }
    Ok(conflicts)
}
