//! JSON-file token repository used when `SQLite` is unavailable
//!
//! The file holds two keys: `tokens`, the log in booking order, and
//! `balances`, an object mapping type to balance. Writes go to a sibling
//! temporary file which is then renamed over the original.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::repository::{LedgerBackend, TokenRepository};
use crate::error::{Error, Result};
use crate::models::{balances_from_log, Balance, Token, TokenId};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct LedgerFile {
    #[serde(default)]
    tokens: Vec<Token>,
    #[serde(default)]
    balances: BTreeMap<String, i64>,
}

impl LedgerFile {
    fn derived_balances(&self) -> Result<BTreeMap<String, i64>> {
        Ok(balances_from_log(&self.tokens)?
            .into_iter()
            .map(|balance| (balance.token_type, balance.balance))
            .collect())
    }

    fn credit(&mut self, token_type: &str, amount: i64) -> Result<()> {
        let balance = self.balances.entry(token_type.to_string()).or_insert(0);
        *balance = balance
            .checked_add(amount)
            .ok_or_else(|| Error::BalanceOverflow(token_type.to_string()))?;
        Ok(())
    }

    /// Re-derive one type's balance from the log; drops it when no tokens remain
    fn recount(&mut self, token_type: &str) -> Result<()> {
        let derived = balances_from_log(
            self.tokens
                .iter()
                .filter(|token| token.token_type == token_type),
        )?;
        match derived.into_iter().next() {
            Some(balance) => self.balances.insert(balance.token_type, balance.balance),
            None => self.balances.remove(token_type),
        };
        Ok(())
    }
}

/// Flat-file ledger; memory-only when constructed without a path
pub struct FlatFileTokenRepository {
    path: Option<PathBuf>,
    state: LedgerFile,
}

impl FlatFileTokenRepository {
    /// Load `path`, or start empty if it does not exist yet.
    ///
    /// Balances that disagree with the token log are rebuilt from the log.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = match std::fs::read_to_string(&path) {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => LedgerFile::default(),
            Err(error) => return Err(error.into()),
        };

        let mut repo = Self {
            path: Some(path),
            state,
        };
        let derived = repo.state.derived_balances()?;
        if without_zeros(&repo.state.balances) != without_zeros(&derived) {
            tracing::warn!("Ledger file balances disagree with the token log; rebuilding");
            let mut repaired = repo.state.clone();
            repaired.balances = derived;
            repo.commit(repaired)?;
        }
        tracing::debug!("Opened flat-file ledger with {} tokens", repo.state.tokens.len());
        Ok(repo)
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: LedgerFile::default(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Persist `next`, then make it the current state
    fn commit(&mut self, next: LedgerFile) -> Result<()> {
        if let Some(path) = &self.path {
            if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let staging = path.with_extension("json.tmp");
            std::fs::write(&staging, serde_json::to_vec_pretty(&next)?)?;
            std::fs::rename(&staging, path)?;
        }
        self.state = next;
        Ok(())
    }

    fn last_updated(&self, token_type: &str) -> i64 {
        self.state
            .tokens
            .iter()
            .filter(|token| token.token_type == token_type)
            .map(|token| token.timestamp)
            .max()
            .unwrap_or(0)
    }
}

fn without_zeros(balances: &BTreeMap<String, i64>) -> BTreeMap<&str, i64> {
    balances
        .iter()
        .filter(|(_, balance)| **balance != 0)
        .map(|(token_type, balance)| (token_type.as_str(), *balance))
        .collect()
}

impl TokenRepository for FlatFileTokenRepository {
    fn backend(&self) -> LedgerBackend {
        LedgerBackend::FlatFile
    }

    fn append(&mut self, token: &Token) -> Result<()> {
        let mut next = self.state.clone();
        next.tokens.push(token.clone());
        next.credit(&token.token_type, token.amount)?;
        self.commit(next)
    }

    fn append_debit(&mut self, token: &Token) -> Result<bool> {
        let current = self.balance(&token.token_type)?;
        match current.checked_add(token.amount) {
            None => return Err(Error::BalanceOverflow(token.token_type.clone())),
            Some(next) if next < 0 => return Ok(false),
            Some(_) => {}
        }
        self.append(token)?;
        Ok(true)
    }

    fn get(&self, id: &TokenId) -> Result<Option<Token>> {
        Ok(self.state.tokens.iter().find(|token| token.id == *id).cloned())
    }

    fn list(&self, token_type: Option<&str>) -> Result<Vec<Token>> {
        Ok(self
            .state
            .tokens
            .iter()
            .filter(|token| token_type.map_or(true, |wanted| token.token_type == wanted))
            .cloned()
            .collect())
    }

    fn balance(&self, token_type: &str) -> Result<i64> {
        Ok(self.state.balances.get(token_type).copied().unwrap_or(0))
    }

    fn balances(&self) -> Result<Vec<Balance>> {
        Ok(self
            .state
            .balances
            .iter()
            .map(|(token_type, balance)| Balance {
                token_type: token_type.clone(),
                balance: *balance,
                last_updated: self.last_updated(token_type),
            })
            .collect())
    }

    fn replace(&mut self, token: &Token) -> Result<Option<Token>> {
        let mut next = self.state.clone();
        let Some(slot) = next.tokens.iter_mut().find(|stored| stored.id == token.id) else {
            return Ok(None);
        };
        let previous = std::mem::replace(slot, token.clone());
        next.recount(&previous.token_type)?;
        if token.token_type != previous.token_type {
            next.recount(&token.token_type)?;
        }
        self.commit(next)?;
        Ok(Some(previous))
    }

    fn remove(&mut self, id: &TokenId) -> Result<Option<Token>> {
        let Some(index) = self.state.tokens.iter().position(|token| token.id == *id) else {
            return Ok(None);
        };
        let mut next = self.state.clone();
        let previous = next.tokens.remove(index);
        next.recount(&previous.token_type)?;
        self.commit(next)?;
        Ok(Some(previous))
    }

    fn clear(&mut self) -> Result<()> {
        self.commit(LedgerFile::default())
    }

    fn rebuild_balances(&mut self) -> Result<()> {
        let mut next = self.state.clone();
        next.balances = next.derived_balances()?;
        self.commit(next)
    }
}
