//! Repository snapshot model
//!
//! Only the fields the dashboard reconciles are kept; the rest of the
//! GitHub payload is ignored on deserialization.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::reconcile::Reconcilable;
use crate::store::{FieldKind, Record, Schema};

/// A repository as last seen from the remote API
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Stable numeric id assigned by the remote
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub stargazers_count: u64,
    #[serde(default)]
    pub forks_count: u64,
    #[serde(default)]
    pub watchers_count: u64,
    #[serde(default)]
    pub open_issues_count: u64,
    #[serde(default)]
    pub topics: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Reconcilable for Repository {
    fn record_id(&self) -> u64 {
        self.id
    }

    fn updated_at_millis(&self) -> i64 {
        self.updated_at.timestamp_millis()
    }

    /// Counters keep the larger value, the description prefers the newer
    /// non-empty text, topics are unioned, and everything else follows `newer`.
    fn merge(newer: &Self, older: &Self) -> Self {
        let topics: BTreeSet<&String> = newer.topics.iter().chain(&older.topics).collect();

        Self {
            stargazers_count: newer.stargazers_count.max(older.stargazers_count),
            forks_count: newer.forks_count.max(older.forks_count),
            watchers_count: newer.watchers_count.max(older.watchers_count),
            open_issues_count: newer.open_issues_count.max(older.open_issues_count),
            description: newer
                .description
                .clone()
                .or_else(|| older.description.clone()),
            topics: topics.into_iter().cloned().collect(),
            ..newer.clone()
        }
    }
}

impl Record for Repository {
    fn schema() -> Result<Schema> {
        Schema::builder("repositories")
            .unique("id", FieldKind::Integer)
            .indexed("name", FieldKind::Text)
            .field("full_name", FieldKind::Text)
            .field("description", FieldKind::Text)
            .field("html_url", FieldKind::Text)
            .indexed("language", FieldKind::Text)
            .field("stargazers_count", FieldKind::Integer)
            .field("forks_count", FieldKind::Integer)
            .field("watchers_count", FieldKind::Integer)
            .field("open_issues_count", FieldKind::Integer)
            .field("topics", FieldKind::Json)
            .field("updated_at", FieldKind::Timestamp)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn repo(stars: u64, description: Option<&str>, topics: &[&str], updated_secs: i64) -> Repository {
        Repository {
            id: 1,
            name: "dash".into(),
            full_name: "me/dash".into(),
            description: description.map(str::to_string),
            html_url: "https://github.com/me/dash".into(),
            language: Some("Rust".into()),
            stargazers_count: stars,
            forks_count: 1,
            watchers_count: stars,
            open_issues_count: 0,
            topics: topics.iter().map(|topic| (*topic).to_string()).collect(),
            updated_at: Utc.timestamp_opt(updated_secs, 0).unwrap(),
        }
    }

    #[test]
    fn merge_combines_fields() {
        let older = repo(5, Some("old text"), &["cli", "rust"], 1_000);
        let mut newer = repo(3, None, &["rust", "sqlite"], 2_000);
        newer.name = "dash-renamed".into();

        let merged = Repository::merge(&newer, &older);
        assert_eq!(merged.stargazers_count, 5);
        assert_eq!(merged.description.as_deref(), Some("old text"));
        assert_eq!(merged.topics, vec!["cli", "rust", "sqlite"]);
        assert_eq!(merged.name, "dash-renamed");
        assert_eq!(merged.updated_at, newer.updated_at);
    }

    #[test]
    fn merge_prefers_newer_description() {
        let older = repo(1, Some("old"), &[], 1_000);
        let newer = repo(1, Some("new"), &[], 2_000);
        assert_eq!(
            Repository::merge(&newer, &older).description.as_deref(),
            Some("new")
        );
    }

    #[test]
    fn deserializes_github_payload_ignoring_extra_fields() {
        let payload = r#"{
            "id": 42,
            "name": "dash",
            "full_name": "me/dash",
            "description": null,
            "html_url": "https://github.com/me/dash",
            "language": null,
            "stargazers_count": 7,
            "forks_count": 2,
            "watchers_count": 7,
            "open_issues_count": 1,
            "private": false,
            "owner": {"login": "me"},
            "updated_at": "2024-05-01T12:00:00Z"
        }"#;

        let repo: Repository = serde_json::from_str(payload).unwrap();
        assert_eq!(repo.id, 42);
        assert_eq!(repo.stargazers_count, 7);
        assert!(repo.topics.is_empty());
        assert_eq!(repo.updated_at_millis(), 1_714_564_800_000);
    }

    #[test]
    fn schema_declares_unique_remote_id() {
        let schema = Repository::schema().unwrap();
        assert!(schema.field("id").is_some_and(|spec| spec.unique));
    }
}
