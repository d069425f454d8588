//! Explicitly constructed services shared by localdash clients.

mod repo_cache;

use std::path::Path;

pub use repo_cache::{RefreshOutcome, RepositoryCache};

use crate::bus::{BroadcastHub, NotificationBus};
use crate::config::AppConfig;
use crate::error::Result;
use crate::github::GithubClient;
use crate::ledger::LedgerService;
use crate::reconcile::Reconciler;
use crate::store::DocumentStore;

/// Everything one execution context needs, wired from an [`AppConfig`].
#[derive(Clone, Debug)]
pub struct Services {
    pub hub: BroadcastHub,
    pub store: DocumentStore,
    pub ledger: LedgerService,
    pub reconciler: Reconciler,
}

impl Services {
    /// Open the store and ledger under `data_dir`.
    ///
    /// Either substrate degrades to its fallback instead of failing when its
    /// database cannot be opened.
    pub fn open(config: &AppConfig, data_dir: &Path) -> Result<Self> {
        config.validate()?;
        let hub = BroadcastHub::new(config.broadcast_capacity);
        let store = DocumentStore::open_or_fallback(AppConfig::store_path(data_dir));
        let ledger = LedgerService::open(
            AppConfig::ledger_path(data_dir),
            NotificationBus::connected(&hub),
        )?;

        Ok(Self {
            hub,
            store,
            ledger,
            reconciler: Reconciler::new(config.reconcile_config()),
        })
    }

    /// Non-durable services (tests and previews)
    pub fn in_memory(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let hub = BroadcastHub::new(config.broadcast_capacity);
        let ledger = LedgerService::open_in_memory(NotificationBus::connected(&hub))?;

        Ok(Self {
            hub,
            store: DocumentStore::open_in_memory(),
            ledger,
            reconciler: Reconciler::new(config.reconcile_config()),
        })
    }

    pub async fn repository_cache(&self) -> Result<RepositoryCache> {
        RepositoryCache::open(&self.store).await
    }

    /// A new bus for another context sharing this hub
    pub fn context_bus(&self) -> NotificationBus {
        NotificationBus::connected(&self.hub)
    }
}

/// GitHub client configured from `config`, authenticated when `token` is set
pub fn github_client(config: &AppConfig, token: Option<String>) -> crate::github::GithubResult<GithubClient> {
    GithubClient::new(config.github_api_base_url.clone(), token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::LedgerBackend;
    use crate::store::BackendKind;
    use tempfile::tempdir;

    #[tokio::test(flavor = "multi_thread")]
    async fn open_creates_databases_in_data_dir() {
        let dir = tempdir().unwrap();
        let services = Services::open(&AppConfig::default(), dir.path()).unwrap();

        assert_eq!(services.store.backend_kind(), BackendKind::Sqlite);
        assert_eq!(services.ledger.backend(), LedgerBackend::Sqlite);
        services.ledger.earn("a", 2, "s", "d").await.unwrap();
        assert!(dir.path().join("ledger.db").exists());
        assert!(dir.path().join("store.db").exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn in_memory_services_share_a_hub() {
        let services = Services::in_memory(&AppConfig::default()).unwrap();
        let other = services.context_bus();
        assert_ne!(other.context(), services.ledger.bus().context());
        assert!(services.repository_cache().await.unwrap().load().await.unwrap().is_empty());
    }
}
