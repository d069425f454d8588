//! Storage seam for the token ledger

use std::fmt;

use crate::error::Result;
use crate::models::{Balance, Token, TokenId};

/// Which substrate backs a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerBackend {
    /// `SQLite` database with atomic balance increments
    Sqlite,
    /// JSON file (or memory) used when the database cannot be opened
    FlatFile,
}

impl LedgerBackend {
    pub const fn is_fallback(self) -> bool {
        matches!(self, Self::FlatFile)
    }
}

impl fmt::Display for LedgerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sqlite => "sqlite",
            Self::FlatFile => "flat-file",
        })
    }
}

/// Token log plus materialized balances.
///
/// Every mutating method applies the log change and the balance change
/// together or not at all.
pub trait TokenRepository: Send {
    fn backend(&self) -> LedgerBackend;

    /// Append a token and add its amount to the balance of its type
    fn append(&mut self, token: &Token) -> Result<()>;

    /// Append a debit only when the balance covers it.
    ///
    /// Returns `false` without touching anything if `balance + amount < 0`.
    fn append_debit(&mut self, token: &Token) -> Result<bool>;

    fn get(&self, id: &TokenId) -> Result<Option<Token>>;

    /// Tokens in booking order, optionally restricted to one type
    fn list(&self, token_type: Option<&str>) -> Result<Vec<Token>>;

    /// Materialized balance, 0 for unknown types
    fn balance(&self, token_type: &str) -> Result<i64>;

    /// All materialized balances ordered by type
    fn balances(&self) -> Result<Vec<Balance>>;

    /// Overwrite a stored token and move its amount between balances.
    /// Returns the previous version, `None` if the id is unknown.
    fn replace(&mut self, token: &Token) -> Result<Option<Token>>;

    /// Delete a token and subtract its amount from its balance
    fn remove(&mut self, id: &TokenId) -> Result<Option<Token>>;

    /// Delete every token and every balance
    fn clear(&mut self) -> Result<()>;

    /// Recompute every balance from the token log
    fn rebuild_balances(&mut self) -> Result<()>;
}
