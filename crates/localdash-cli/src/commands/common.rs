use std::collections::BTreeMap;

use localdash_core::ledger::BalanceDrift;
use localdash_core::models::{Repository, Token};
use localdash_core::reconcile::{Conflict, SyncStats};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct TokenListItem {
    pub id: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub amount: i64,
    pub source: String,
    pub description: String,
    pub timestamp: i64,
    pub relative_time: String,
}

#[derive(Debug, Serialize)]
pub struct ConflictItem {
    pub kind: String,
    pub id: u64,
    pub name: String,
    pub cached_updated_at: Option<String>,
    pub server_updated_at: Option<String>,
}

pub fn token_to_list_item(token: &Token, now_ms: i64) -> TokenListItem {
    TokenListItem {
        id: token.id.to_string(),
        token_type: token.token_type.clone(),
        amount: token.amount,
        source: token.source.clone(),
        description: token.description.clone(),
        timestamp: token.timestamp,
        relative_time: format_relative_time(token.timestamp, now_ms),
    }
}

pub fn format_amount(amount: i64) -> String {
    if amount > 0 {
        format!("+{amount}")
    } else {
        amount.to_string()
    }
}

pub fn format_token_lines(tokens: &[Token], now_ms: i64) -> Vec<String> {
    tokens
        .iter()
        .map(|token| {
            let short_id = token.id.to_string().chars().take(13).collect::<String>();
            let amount = format_amount(token.amount);
            let relative_time = format_relative_time(token.timestamp, now_ms);
            let description = preview(&token.description, 32);
            format!(
                "{short_id:<13}  {:<20}  {amount:>8}  {:<16}  {description:<32}  {relative_time}",
                token.token_type, token.source
            )
        })
        .collect()
}

pub fn format_balance_lines(balances: &BTreeMap<String, i64>) -> Vec<String> {
    let width = balances.keys().map(String::len).max().unwrap_or(0).max(5);
    let mut lines = balances
        .iter()
        .map(|(token_type, balance)| format!("{token_type:<width$}  {balance:>10}"))
        .collect::<Vec<_>>();
    let total: i64 = balances.values().sum();
    lines.push(format!("{:<width$}  {total:>10}", "total"));
    lines
}

pub fn format_drift_lines(drift: &[BalanceDrift]) -> Vec<String> {
    drift
        .iter()
        .map(|entry| {
            format!(
                "{}: recorded {} but the log sums to {}",
                entry.token_type, entry.recorded, entry.expected
            )
        })
        .collect()
}

pub fn format_repository_lines(repositories: &[Repository]) -> Vec<String> {
    repositories
        .iter()
        .map(|repo| {
            let language = repo.language.as_deref().unwrap_or("-");
            let description = preview(repo.description.as_deref().unwrap_or(""), 48);
            format!(
                "{:<32}  {language:<12}  ★{:<6}  {description}",
                repo.full_name, repo.stargazers_count
            )
        })
        .collect()
}

pub fn conflict_to_item(conflict: &Conflict<Repository>) -> ConflictItem {
    let (name, cached, server) = match conflict {
        Conflict::Added { server } => (server.full_name.clone(), None, Some(server)),
        Conflict::Deleted { cached } => (cached.full_name.clone(), Some(cached), None),
        Conflict::Modified { cached, server } => {
            (server.full_name.clone(), Some(cached), Some(server))
        }
    };
    ConflictItem {
        kind: conflict.kind().to_string(),
        id: conflict.record_id(),
        name,
        cached_updated_at: cached.map(|repo| repo.updated_at.to_rfc3339()),
        server_updated_at: server.map(|repo| repo.updated_at.to_rfc3339()),
    }
}

pub fn format_conflict_lines(conflicts: &[Conflict<Repository>]) -> Vec<String> {
    conflicts
        .iter()
        .map(conflict_to_item)
        .map(|item| {
            let mut line = format!("{:<8}  {:<10}  {}", item.kind, item.id, item.name);
            if let (Some(cached), Some(server)) = (&item.cached_updated_at, &item.server_updated_at) {
                line.push_str(&format!("  cached={cached} server={server}"));
            }
            line
        })
        .collect()
}

pub fn format_sync_stats(stats: &SyncStats) -> String {
    format!(
        "added={} removed={} merged={} server_wins={} cache_wins={} skipped={}",
        stats.added, stats.removed, stats.merged, stats.server_wins, stats.cache_wins, stats.skipped
    )
}

pub fn preview(text: &str, max_chars: usize) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let collapsed = first_line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= max_chars {
        collapsed
    } else {
        let take_len = max_chars.saturating_sub(3);
        let mut truncated = collapsed.chars().take(take_len).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}
