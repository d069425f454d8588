//! Reconciliation of a cached collection against a fresh server copy
//!
//! Records are matched by [`Reconcilable::record_id`]. Two versions of the
//! same record only conflict when their update timestamps differ by more than
//! the configured skew threshold; smaller differences count as unchanged.

mod retry;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use retry::RetryPolicy;

/// Default timestamp difference below which two versions are considered equal
pub const DEFAULT_SKEW_THRESHOLD: Duration = Duration::from_secs(60);

/// A record that can be compared and merged across cache and server
pub trait Reconcilable: Clone {
    fn record_id(&self) -> u64;

    /// Last modification time (Unix ms)
    fn updated_at_millis(&self) -> i64;

    /// Field-level combination of two versions of the same record
    fn merge(newer: &Self, older: &Self) -> Self;
}

/// Divergence between cache and server for one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Conflict<T> {
    /// Present on the server only
    Added { server: T },
    /// Present in the cache only
    Deleted { cached: T },
    /// Present in both with timestamps further apart than the threshold
    Modified { cached: T, server: T },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictKind {
    Added,
    Deleted,
    Modified,
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Added => "added",
            Self::Deleted => "deleted",
            Self::Modified => "modified",
        })
    }
}

impl<T: Reconcilable> Conflict<T> {
    pub const fn kind(&self) -> ConflictKind {
        match self {
            Self::Added { .. } => ConflictKind::Added,
            Self::Deleted { .. } => ConflictKind::Deleted,
            Self::Modified { .. } => ConflictKind::Modified,
        }
    }

    pub fn record_id(&self) -> u64 {
        match self {
            Self::Added { server } | Self::Modified { server, .. } => server.record_id(),
            Self::Deleted { cached } => cached.record_id(),
        }
    }
}

/// How modified records are resolved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// Take the server version
    Server,
    /// Keep the cached version
    Cache,
    /// Combine both versions field by field
    #[default]
    Merge,
    /// Leave the record unresolved
    Skip,
}

impl Strategy {
    pub const ALL: [Self; 4] = [Self::Server, Self::Cache, Self::Merge, Self::Skip];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Server => "server",
            Self::Cache => "cache",
            Self::Merge => "merge",
            Self::Skip => "skip",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| format!("unknown strategy {s:?}; expected server, cache, merge or skip"))
    }
}

/// Per-outcome counters for one resolution pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStats {
    pub server_wins: usize,
    pub cache_wins: usize,
    pub merged: usize,
    pub added: usize,
    pub removed: usize,
    pub skipped: usize,
}

impl SyncStats {
    /// Number of conflicts this pass handled
    pub const fn total(&self) -> usize {
        self.server_wins + self.cache_wins + self.merged + self.added + self.removed + self.skipped
    }
}

/// Resolved versions keyed by record id, plus statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult<T> {
    pub resolved: BTreeMap<u64, T>,
    pub stats: SyncStats,
}

impl<T> Default for SyncResult<T> {
    fn default() -> Self {
        Self {
            resolved: BTreeMap::new(),
            stats: SyncStats::default(),
        }
    }
}

/// Compare cache and server.
///
/// Conflicts are reported in a stable order: cached records first (in cache
/// order), then server-only records (in server order).
pub fn detect_conflicts<T: Reconcilable>(
    cached: &[T],
    server: &[T],
    skew_threshold: Duration,
) -> Vec<Conflict<T>> {
    let server = dedupe_by_id(server.to_vec());
    let threshold = u64::try_from(skew_threshold.as_millis()).unwrap_or(u64::MAX);
    let server_by_id: HashMap<u64, &T> = server.iter().map(|item| (item.record_id(), item)).collect();
    let cached_ids: HashSet<u64> = cached.iter().map(Reconcilable::record_id).collect();

    let mut conflicts = Vec::new();
    for item in cached {
        match server_by_id.get(&item.record_id()) {
            None => conflicts.push(Conflict::Deleted {
                cached: item.clone(),
            }),
            Some(remote) => {
                let drift = item
                    .updated_at_millis()
                    .abs_diff(remote.updated_at_millis());
                if drift > threshold {
                    conflicts.push(Conflict::Modified {
                        cached: item.clone(),
                        server: (*remote).clone(),
                    });
                }
            }
        }
    }

    conflicts.extend(
        server
            .iter()
            .filter(|item| !cached_ids.contains(&item.record_id()))
            .map(|item| Conflict::Added {
                server: item.clone(),
            }),
    );
    conflicts
}

/// Collapse repeated ids to one entry at the first position, keeping the newest version.
///
/// Paged listings can return a record twice when the list shifts between pages.
pub fn dedupe_by_id<T: Reconcilable>(items: Vec<T>) -> Vec<T> {
    let total = items.len();
    let mut positions: HashMap<u64, usize> = HashMap::with_capacity(total);
    let mut unique: Vec<T> = Vec::with_capacity(total);

    for item in items {
        if let Some(&at) = positions.get(&item.record_id()) {
            if item.updated_at_millis() > unique[at].updated_at_millis() {
                unique[at] = item;
            }
        } else {
            positions.insert(item.record_id(), unique.len());
            unique.push(item);
        }
    }

    if unique.len() < total {
        tracing::debug!("Dropped {} repeated records", total - unique.len());
    }
    unique
}

/// Apply `strategy` to each conflict
pub fn resolve_conflicts<T: Reconcilable>(conflicts: Vec<Conflict<T>>, strategy: Strategy) -> SyncResult<T> {
    let mut result = SyncResult::default();

    for conflict in conflicts {
        match conflict {
            Conflict::Added { server } => {
                result.resolved.insert(server.record_id(), server);
                result.stats.added += 1;
            }
            Conflict::Deleted { .. } => result.stats.removed += 1,
            Conflict::Modified { cached, server } => {
                let id = server.record_id();
                match strategy {
                    Strategy::Server => {
                        result.resolved.insert(id, server);
                        result.stats.server_wins += 1;
                    }
                    Strategy::Cache => {
                        result.resolved.insert(id, cached);
                        result.stats.cache_wins += 1;
                    }
                    Strategy::Merge => {
                        // Ties go to the server copy
                        let merged = if cached.updated_at_millis() > server.updated_at_millis() {
                            T::merge(&cached, &server)
                        } else {
                            T::merge(&server, &cached)
                        };
                        result.resolved.insert(id, merged);
                        result.stats.merged += 1;
                    }
                    Strategy::Skip => result.stats.skipped += 1,
                }
            }
        }
    }
    result
}

/// Build the authoritative collection.
///
/// Server order is preserved; records whose id was resolved are replaced by
/// their resolved version, and resolved records missing from the server are
/// appended in id order.
pub fn perform_sync<T: Reconcilable>(
    cached: &[T],
    server: Vec<T>,
    strategy: Strategy,
    skew_threshold: Duration,
) -> (Vec<T>, SyncResult<T>) {
    let server = dedupe_by_id(server);
    let conflicts = detect_conflicts(cached, &server, skew_threshold);
    if conflicts.is_empty() {
        return (server, SyncResult::default());
    }

    let result = resolve_conflicts(conflicts, strategy);
    let server_ids: HashSet<u64> = server.iter().map(Reconcilable::record_id).collect();

    let mut collection: Vec<T> = server
        .into_iter()
        .map(|item| {
            result
                .resolved
                .get(&item.record_id())
                .cloned()
                .unwrap_or(item)
        })
        .collect();
    collection.extend(
        result
            .resolved
            .iter()
            .filter(|(id, _)| !server_ids.contains(id))
            .map(|(_, item)| item.clone()),
    );

    tracing::debug!(
        "Sync resolved {} conflicts with strategy {strategy}",
        result.stats.total()
    );
    (collection, result)
}

/// Tunables for a [`Reconciler`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileConfig {
    pub skew_threshold: Duration,
    pub strategy: Strategy,
    pub retry: RetryPolicy,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            skew_threshold: DEFAULT_SKEW_THRESHOLD,
            strategy: Strategy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Reconciliation with a fixed configuration
#[derive(Debug, Clone, Default)]
pub struct Reconciler {
    config: ReconcileConfig,
}

impl Reconciler {
    pub const fn new(config: ReconcileConfig) -> Self {
        Self { config }
    }

    pub const fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub fn detect_conflicts<T: Reconcilable>(&self, cached: &[T], server: &[T]) -> Vec<Conflict<T>> {
        detect_conflicts(cached, server, self.config.skew_threshold)
    }

    pub fn resolve_conflicts<T: Reconcilable>(&self, conflicts: Vec<Conflict<T>>) -> SyncResult<T> {
        resolve_conflicts(conflicts, self.config.strategy)
    }

    pub fn perform_sync<T: Reconcilable>(&self, cached: &[T], server: Vec<T>) -> (Vec<T>, SyncResult<T>) {
        perform_sync(cached, server, self.config.strategy, self.config.skew_threshold)
    }

    /// Fetch with retry, then sync.
    ///
    /// When every attempt fails the cached collection comes back unchanged with
    /// no result; the failure is logged, never returned.
    pub async fn sync_with_retry<T, F, Fut, E>(&self, cached: Vec<T>, mut fetch: F) -> (Vec<T>, Option<SyncResult<T>>)
    where
        T: Reconcilable,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Vec<T>, E>>,
        E: fmt::Display,
    {
        let policy = self.config.retry;
        let attempts = policy.max_attempts.max(1);

        for attempt in 0..attempts {
            match fetch().await {
                Ok(server) => {
                    let (collection, result) = self.perform_sync(&cached, server);
                    return (collection, Some(result));
                }
                Err(error) => {
                    tracing::warn!("Fetch attempt {}/{attempts} failed: {error}", attempt + 1);
                    if attempt + 1 < attempts {
                        tokio::time::sleep(policy.delay_for(attempt)).await;
                    }
                }
            }
        }

        tracing::warn!("Giving up after {attempts} attempts; keeping cached data");
        (cached, None)
    }
}
