//! Token ledger service
//!
//! An append-only log of signed amounts with a materialized balance per
//! token type. The service owns one repository behind an async mutex, so
//! balance updates from concurrent callers are serialized, and every
//! mutation is announced on the [`NotificationBus`].

mod flat_file;
mod repository;
mod sqlite;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::bus::{Event, NotificationBus};
use crate::error::{Error, Result};
use crate::models::{balances_from_log, Balance, NewToken, Token, TokenId, TokenPatch};

pub use flat_file::FlatFileTokenRepository;
pub use repository::{LedgerBackend, TokenRepository};
pub use sqlite::SqliteTokenRepository;

/// Result of [`LedgerService::spend`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpendOutcome {
    /// The debit was booked
    Spent(Token),
    /// Nothing was booked; `balance` is what was available
    Insufficient { balance: i64, requested: i64 },
}

impl SpendOutcome {
    pub const fn is_spent(&self) -> bool {
        matches!(self, Self::Spent(_))
    }
}

/// A type whose materialized balance disagrees with its token log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BalanceDrift {
    pub token_type: String,
    pub recorded: i64,
    pub expected: i64,
}

/// Where the flat-file fallback for a database path lives
pub fn fallback_path(db_path: &Path) -> PathBuf {
    db_path.with_extension("fallback.json")
}

/// Thread-safe ledger service.
#[derive(Clone)]
pub struct LedgerService {
    repo: Arc<Mutex<Box<dyn TokenRepository>>>,
    backend: LedgerBackend,
    bus: NotificationBus,
}

impl LedgerService {
    /// Open the `SQLite` ledger at `path`, switching to the flat-file
    /// fallback next to it when the database cannot be initialized.
    pub fn open(path: impl AsRef<Path>, bus: NotificationBus) -> Result<Self> {
        let path = path.as_ref();
        match SqliteTokenRepository::open(path) {
            Ok(repo) => Ok(Self::with_repository(Box::new(repo), bus)),
            Err(error) => {
                let fallback = fallback_path(path);
                tracing::warn!(
                    "Ledger database {} unavailable ({error}); using {}",
                    path.display(),
                    fallback.display()
                );
                let repo = FlatFileTokenRepository::open(fallback)?;
                Ok(Self::with_repository(Box::new(repo), bus))
            }
        }
    }

    /// In-memory `SQLite` ledger (primarily for tests).
    pub fn open_in_memory(bus: NotificationBus) -> Result<Self> {
        Ok(Self::with_repository(
            Box::new(SqliteTokenRepository::open_in_memory()?),
            bus,
        ))
    }

    pub fn with_repository(repo: Box<dyn TokenRepository>, bus: NotificationBus) -> Self {
        let backend = repo.backend();
        Self {
            repo: Arc::new(Mutex::new(repo)),
            backend,
            bus,
        }
    }

    pub const fn backend(&self) -> LedgerBackend {
        self.backend
    }

    pub const fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Book a token of any sign and announce it
    pub async fn create_token(&self, new_token: NewToken) -> Result<Token> {
        let token = new_token.into_token()?;
        self.repo.lock().await.append(&token)?;

        tracing::debug!("Booked {} {} from {}", token.amount, token.token_type, token.source);
        self.bus.emit(Event::TokenCreated(token.clone()));
        Ok(token)
    }

    /// Credit a strictly positive amount
    pub async fn earn(
        &self,
        token_type: &str,
        amount: i64,
        source: &str,
        description: &str,
    ) -> Result<Token> {
        if amount <= 0 {
            return Err(Error::InvalidAmount(amount));
        }
        self.create_token(NewToken::new(token_type, amount, source, description))
            .await
    }

    /// Debit a strictly positive amount if the balance covers it
    pub async fn spend(
        &self,
        token_type: &str,
        amount: i64,
        source: &str,
        description: &str,
    ) -> Result<SpendOutcome> {
        if amount <= 0 {
            return Err(Error::InvalidAmount(amount));
        }
        let token = NewToken::new(token_type, -amount, source, description).into_token()?;

        let mut repo = self.repo.lock().await;
        if !repo.append_debit(&token)? {
            let balance = repo.balance(&token.token_type)?;
            tracing::debug!("Refused to spend {amount} {}: balance {balance}", token.token_type);
            return Ok(SpendOutcome::Insufficient {
                balance,
                requested: amount,
            });
        }
        drop(repo);

        self.bus.emit(Event::TokenCreated(token.clone()));
        Ok(SpendOutcome::Spent(token))
    }

    /// Balance of one type, 0 when nothing was booked
    pub async fn get_balance(&self, token_type: &str) -> Result<i64> {
        self.repo.lock().await.balance(token_type.trim())
    }

    pub async fn get_all_balances(&self) -> Result<BTreeMap<String, i64>> {
        Ok(self
            .balance_snapshot()
            .await?
            .into_iter()
            .map(|balance| (balance.token_type, balance.balance))
            .collect())
    }

    /// Sum over every type; fails with [`Error::BalanceOverflow`] past `i64`
    pub async fn get_total_balance(&self) -> Result<i64> {
        let total: i128 = self
            .get_all_balances()
            .await?
            .values()
            .map(|balance| i128::from(*balance))
            .sum();
        i64::try_from(total).map_err(|_| Error::BalanceOverflow("total".to_string()))
    }

    /// Balances with their last update times, ordered by type
    pub async fn balance_snapshot(&self) -> Result<Vec<Balance>> {
        self.repo.lock().await.balances()
    }

    /// Tokens in booking order, optionally of one type
    pub async fn get_all(&self, token_type: Option<&str>) -> Result<Vec<Token>> {
        self.repo.lock().await.list(token_type.map(str::trim))
    }

    pub async fn get_token(&self, id: &TokenId) -> Result<Option<Token>> {
        self.repo.lock().await.get(id)
    }

    /// Correct a booked token; `None` if the id is unknown
    pub async fn update_token(&self, id: &TokenId, patch: &TokenPatch) -> Result<Option<Token>> {
        let mut repo = self.repo.lock().await;
        let Some(existing) = repo.get(id)? else {
            return Ok(None);
        };
        let updated = patch.apply(&existing)?;
        repo.replace(&updated)?;
        drop(repo);

        self.bus.emit(Event::TokenUpdated(updated.clone()));
        Ok(Some(updated))
    }

    /// Remove a token and reverse its amount; `false` if the id is unknown
    pub async fn delete_token(&self, id: &TokenId) -> Result<bool> {
        let removed = self.repo.lock().await.remove(id)?;
        let Some(token) = removed else {
            return Ok(false);
        };

        self.bus.emit(Event::TokenDeleted { id: *id, token });
        Ok(true)
    }

    /// Delete every token and balance
    pub async fn clear_all(&self) -> Result<()> {
        self.repo.lock().await.clear()?;
        tracing::info!("Cleared token ledger");
        self.bus.emit(Event::TokensCleared {});
        Ok(())
    }

    /// Observe ledger events from other contexts sharing the bus hub.
    ///
    /// Idempotent: returns `true` only on the call that started listening.
    pub fn init_auto_tracking(&self) -> bool {
        self.bus.start_remote_listener()
    }

    /// Recompute materialized balances from the token log
    pub async fn rebuild_balances(&self) -> Result<()> {
        self.repo.lock().await.rebuild_balances()?;
        tracing::info!("Rebuilt token balances from the log");
        Ok(())
    }

    /// Compare materialized balances against the token log
    pub async fn verify_balances(&self) -> Result<Vec<BalanceDrift>> {
        let repo = self.repo.lock().await;
        let tokens = repo.list(None)?;
        let recorded: BTreeMap<String, i64> = repo
            .balances()?
            .into_iter()
            .map(|balance| (balance.token_type, balance.balance))
            .collect();
        drop(repo);

        let expected: BTreeMap<String, i64> = balances_from_log(&tokens)?
            .into_iter()
            .map(|balance| (balance.token_type, balance.balance))
            .collect();

        let mut types: Vec<&String> = recorded.keys().chain(expected.keys()).collect();
        types.sort();
        types.dedup();

        Ok(types
            .into_iter()
            .filter_map(|token_type| {
                let recorded = recorded.get(token_type).copied().unwrap_or(0);
                let expected = expected.get(token_type).copied().unwrap_or(0);
                (recorded != expected).then(|| BalanceDrift {
                    token_type: token_type.clone(),
                    recorded,
                    expected,
                })
            })
            .collect())
    }
}

impl std::fmt::Debug for LedgerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerService")
            .field("backend", &self.backend)
            .field("bus", &self.bus)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{BroadcastHub, EventKind};
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    fn ledger() -> LedgerService {
        LedgerService::open_in_memory(NotificationBus::new()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sequential_credits_sum() {
        let ledger = ledger();
        ledger
            .create_token(NewToken::new("infinity_tokens", 100, "repoA", "x"))
            .await
            .unwrap();
        ledger
            .create_token(NewToken::new("infinity_tokens", 50, "repoA", "y"))
            .await
            .unwrap();

        assert_eq!(ledger.get_balance("infinity_tokens").await.unwrap(), 150);
        assert_eq!(ledger.get_total_balance().await.unwrap(), 150);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spend_without_balance_changes_nothing() {
        let ledger = ledger();
        let outcome = ledger.spend("art_tokens", 10, "x", "y").await.unwrap();

        assert_eq!(
            outcome,
            SpendOutcome::Insufficient {
                balance: 0,
                requested: 10
            }
        );
        assert_eq!(ledger.get_balance("art_tokens").await.unwrap(), 0);
        assert!(ledger.get_all(None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn spend_with_cover_books_debit() {
        let ledger = ledger();
        ledger.earn("art_tokens", 25, "repo", "stars").await.unwrap();

        let outcome = ledger.spend("art_tokens", 10, "shop", "sticker").await.unwrap();
        assert!(outcome.is_spent());
        assert_eq!(ledger.get_balance("art_tokens").await.unwrap(), 15);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_positive_amounts_are_rejected() {
        let ledger = ledger();
        assert!(matches!(
            ledger.earn("a", 0, "s", "d").await,
            Err(Error::InvalidAmount(0))
        ));
        assert!(matches!(
            ledger.spend("a", -4, "s", "d").await,
            Err(Error::InvalidAmount(-4))
        ));
        assert!(ledger.get_all(None).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_credits_are_not_lost() {
        let ledger = ledger();
        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let ledger = ledger.clone();
                tokio::spawn(async move {
                    ledger.earn("a", 5, "repo", &format!("task {i}")).await.unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(ledger.get_balance("a").await.unwrap(), 100);
        assert!(ledger.verify_balances().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn clear_all_is_idempotent() {
        let ledger = ledger();
        ledger.earn("a", 1, "s", "d").await.unwrap();
        ledger.clear_all().await.unwrap();
        ledger.clear_all().await.unwrap();

        assert!(ledger.get_all(None).await.unwrap().is_empty());
        assert!(ledger.get_all_balances().await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mutations_emit_events() {
        let bus = NotificationBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _subscriptions: Vec<_> = [
            EventKind::TokenCreated,
            EventKind::TokenUpdated,
            EventKind::TokenDeleted,
            EventKind::TokensCleared,
        ]
        .into_iter()
        .map(|kind| {
            let seen = Arc::clone(&seen);
            bus.on(kind, move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

        let ledger = LedgerService::open_in_memory(bus).unwrap();
        let token = ledger.earn("a", 3, "s", "d").await.unwrap();
        ledger
            .update_token(&token.id, &TokenPatch::new().amount(4))
            .await
            .unwrap();
        assert!(ledger.delete_token(&token.id).await.unwrap());
        ledger.clear_all().await.unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn corrections_adjust_balances() {
        let ledger = ledger();
        let token = ledger.earn("a", 10, "s", "d").await.unwrap();

        let updated = ledger
            .update_token(&token.id, &TokenPatch::new().amount(7))
            .await
            .unwrap();
        assert_eq!(updated.map(|token| token.amount), Some(7));
        assert_eq!(ledger.get_balance("a").await.unwrap(), 7);

        assert!(ledger.delete_token(&token.id).await.unwrap());
        assert!(!ledger.delete_token(&token.id).await.unwrap());
        assert_eq!(ledger.get_balance("a").await.unwrap(), 0);
        assert!(ledger
            .update_token(&token.id, &TokenPatch::new().amount(1))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn falls_back_when_database_cannot_open() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("ledger.db");
        std::fs::create_dir(&db_path).unwrap();

        let ledger = LedgerService::open(&db_path, NotificationBus::new()).unwrap();
        assert_eq!(ledger.backend(), LedgerBackend::FlatFile);

        ledger.earn("a", 100, "s", "d").await.unwrap();
        ledger.earn("a", 50, "s", "d").await.unwrap();
        assert_eq!(ledger.get_balance("a").await.unwrap(), 150);
        assert!(fallback_path(&db_path).exists());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn fallback_has_same_semantics() {
        let ledger = LedgerService::with_repository(
            Box::new(FlatFileTokenRepository::in_memory()),
            NotificationBus::new(),
        );
        assert!(ledger.backend().is_fallback());

        assert!(!ledger.spend("art_tokens", 10, "x", "y").await.unwrap().is_spent());
        ledger.earn("art_tokens", 10, "x", "y").await.unwrap();
        assert!(ledger.spend("art_tokens", 10, "x", "y").await.unwrap().is_spent());
        assert_eq!(ledger.get_balance("art_tokens").await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn overflowing_earn_is_rejected_on_both_backends() {
        let ledgers = [
            ledger(),
            LedgerService::with_repository(
                Box::new(FlatFileTokenRepository::in_memory()),
                NotificationBus::new(),
            ),
        ];
        for ledger in ledgers {
            ledger.earn("a", i64::MAX, "s", "d").await.unwrap();
            assert!(matches!(
                ledger.earn("a", 1, "s", "d").await,
                Err(Error::BalanceOverflow(_))
            ));

            assert_eq!(ledger.get_balance("a").await.unwrap(), i64::MAX);
            assert_eq!(ledger.get_all(None).await.unwrap().len(), 1);
            assert!(ledger.verify_balances().await.unwrap().is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn total_past_i64_is_an_error() {
        let ledger = ledger();
        ledger.earn("a", i64::MAX, "s", "d").await.unwrap();
        ledger.earn("b", i64::MAX, "s", "d").await.unwrap();

        assert!(matches!(
            ledger.get_total_balance().await,
            Err(Error::BalanceOverflow(_))
        ));
    }

    fn booked_at(kind: &str, amount: i64, timestamp: i64) -> Token {
        let mut token = NewToken::new(kind, amount, "s", "d").into_token().unwrap();
        token.timestamp = timestamp;
        token
    }

    #[test]
    fn corrections_give_the_same_snapshot_on_both_backends() {
        let first = booked_at("a", 10, 1_000);
        let second = booked_at("a", 5, 2_000);
        let third = booked_at("b", 3, 3_000);

        let repos: Vec<Box<dyn TokenRepository>> = vec![
            Box::new(SqliteTokenRepository::open_in_memory().unwrap()),
            Box::new(FlatFileTokenRepository::in_memory()),
        ];
        let snapshots: Vec<Vec<Balance>> = repos
            .into_iter()
            .map(|mut repo| {
                for token in [&first, &second, &third] {
                    repo.append(token).unwrap();
                }
                let mut moved = second.clone();
                moved.token_type = "b".into();
                moved.amount = 4;
                repo.replace(&moved).unwrap();
                repo.remove(&third.id).unwrap();
                repo.remove(&first.id).unwrap();
                repo.balances().unwrap()
            })
            .collect();

        let expected = vec![Balance {
            token_type: "b".into(),
            balance: 4,
            last_updated: 2_000,
        }];
        assert_eq!(snapshots[0], expected);
        assert_eq!(snapshots[1], expected);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn auto_tracking_sees_other_contexts() {
        let hub = BroadcastHub::default();
        let here = LedgerService::open_in_memory(NotificationBus::connected(&hub)).unwrap();
        let there = LedgerService::open_in_memory(NotificationBus::connected(&hub)).unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let _subscription = here.bus().on(EventKind::TokenCreated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(here.init_auto_tracking());
        assert!(!here.init_auto_tracking());

        there.earn("a", 1, "s", "d").await.unwrap();
        for _ in 0..100 {
            if seen.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
