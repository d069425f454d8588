//! Cached repository snapshots refreshed through reconciliation.

use std::fmt::Display;
use std::future::Future;

use crate::error::Result;
use crate::models::Repository;
use crate::reconcile::{Conflict, Reconciler, SyncResult};
use crate::store::{Collection, DocumentStore, FindOptions, Query};

/// What a refresh produced
#[derive(Debug, Clone)]
pub struct RefreshOutcome {
    /// The collection now in the cache
    pub repositories: Vec<Repository>,
    /// `None` when every fetch attempt failed
    pub result: Option<SyncResult<Repository>>,
    /// The fetch failed and `repositories` is the previous cache
    pub stale: bool,
}

/// Repository cache backed by the `repositories` collection.
#[derive(Clone)]
pub struct RepositoryCache {
    repos: Collection<Repository>,
}

impl RepositoryCache {
    pub async fn open(store: &DocumentStore) -> Result<Self> {
        Ok(Self {
            repos: store.collection::<Repository>().await?,
        })
    }

    /// Cached repositories in the order they were stored
    pub async fn load(&self) -> Result<Vec<Repository>> {
        Ok(self
            .repos
            .find(&Query::new(), &FindOptions::new())
            .await?
            .into_iter()
            .map(|document| document.data)
            .collect())
    }

    /// Replace the cache contents with `repositories`; a failed write keeps the old contents
    pub async fn replace_all(&self, repositories: &[Repository]) -> Result<usize> {
        let stored = self.repos.replace_all(repositories.to_vec()).await?;
        Ok(stored.len())
    }

    /// Conflicts between the cache and a server copy, without applying them
    pub async fn diff(&self, reconciler: &Reconciler, server: &[Repository]) -> Result<Vec<Conflict<Repository>>> {
        let cached = self.load().await?;
        Ok(reconciler.detect_conflicts(&cached, server))
    }

    /// Fetch with retry, reconcile against the cache and persist the result.
    ///
    /// A failed fetch leaves the cache untouched and reports `stale`.
    pub async fn refresh<F, Fut, E>(&self, reconciler: &Reconciler, fetch: F) -> Result<RefreshOutcome>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Vec<Repository>, E>>,
        E: Display,
    {
        let cached = self.load().await?;
        let (repositories, result) = reconciler.sync_with_retry(cached, fetch).await;

        if result.is_none() {
            tracing::warn!("Repository refresh failed; showing cached data");
            return Ok(RefreshOutcome {
                repositories,
                result,
                stale: true,
            });
        }

        self.replace_all(&repositories).await?;
        tracing::info!("Repository cache refreshed with {} entries", repositories.len());
        Ok(RefreshOutcome {
            repositories,
            result,
            stale: false,
        })
    }
}
