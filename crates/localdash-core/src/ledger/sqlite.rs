//! `SQLite` token repository

use std::path::Path;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::repository::{LedgerBackend, TokenRepository};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::models::{balances_from_log, Balance, Token, TokenId};

const TOKEN_COLUMNS: &str = "id, type, amount, source, description, timestamp, metadata";

/// Ledger tables in a migrated [`Database`]
pub struct SqliteTokenRepository {
    db: Database,
}

impl SqliteTokenRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub const fn new(db: Database) -> Self {
        Self { db }
    }

    fn insert_token(conn: &Connection, token: &Token) -> Result<()> {
        conn.execute(
            "INSERT INTO tokens (id, type, amount, source, description, timestamp, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                token.id.as_str(),
                token.token_type,
                token.amount,
                token.source,
                token.description,
                token.timestamp,
                token.metadata,
            ],
        )?;
        Ok(())
    }

    /// `balance += amount` inside the caller's transaction, refusing to leave the `i64` range
    fn add_to_balance(conn: &Connection, token_type: &str, amount: i64, at: i64) -> Result<()> {
        let balance = Self::read_balance(conn, token_type)?
            .checked_add(amount)
            .ok_or_else(|| Error::BalanceOverflow(token_type.to_string()))?;
        conn.execute(
            "INSERT INTO balances (type, balance, last_updated) VALUES (?1, ?2, ?3)
             ON CONFLICT(type) DO UPDATE SET
                balance = excluded.balance,
                last_updated = MAX(last_updated, excluded.last_updated)",
            params![token_type, balance, at],
        )?;
        Ok(())
    }

    /// Re-derive one type's row from the token log; drops the row when no tokens remain
    fn recount_balance(conn: &Connection, token_type: &str) -> Result<()> {
        let tokens = {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TOKEN_COLUMNS} FROM tokens WHERE type = ? ORDER BY seq"
            ))?;
            let rows = stmt.query_map(params![token_type], Self::parse_token)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };

        match balances_from_log(&tokens)?.pop() {
            Some(balance) => {
                conn.execute(
                    "INSERT INTO balances (type, balance, last_updated) VALUES (?1, ?2, ?3)
                     ON CONFLICT(type) DO UPDATE SET
                        balance = excluded.balance,
                        last_updated = excluded.last_updated",
                    params![balance.token_type, balance.balance, balance.last_updated],
                )?;
            }
            None => {
                conn.execute("DELETE FROM balances WHERE type = ?", params![token_type])?;
            }
        }
        Ok(())
    }

    fn read_balance(conn: &Connection, token_type: &str) -> Result<i64> {
        let balance = conn
            .query_row(
                "SELECT balance FROM balances WHERE type = ?",
                params![token_type],
                |row| row.get(0),
            )
            .optional()?;
        Ok(balance.unwrap_or(0))
    }

    fn find(conn: &Connection, id: &TokenId) -> Result<Option<Token>> {
        let token = conn
            .query_row(
                &format!("SELECT {TOKEN_COLUMNS} FROM tokens WHERE id = ?"),
                params![id.as_str()],
                Self::parse_token,
            )
            .optional()?;
        Ok(token)
    }

    fn parse_token(row: &rusqlite::Row<'_>) -> rusqlite::Result<Token> {
        let id: String = row.get(0)?;
        Ok(Token {
            id: id
                .parse()
                .map_err(|error| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(error)))?,
            token_type: row.get(1)?,
            amount: row.get(2)?,
            source: row.get(3)?,
            description: row.get(4)?,
            timestamp: row.get(5)?,
            metadata: row.get(6)?,
        })
    }
}

impl TokenRepository for SqliteTokenRepository {
    fn backend(&self) -> LedgerBackend {
        LedgerBackend::Sqlite
    }

    fn append(&mut self, token: &Token) -> Result<()> {
        let tx = self.db.connection_mut().transaction()?;
        Self::insert_token(&tx, token)?;
        Self::add_to_balance(&tx, &token.token_type, token.amount, token.timestamp)?;
        tx.commit()?;
        Ok(())
    }

    fn append_debit(&mut self, token: &Token) -> Result<bool> {
        // IMMEDIATE takes the write lock before the balance read
        let tx = self
            .db
            .connection_mut()
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = Self::read_balance(&tx, &token.token_type)?;
        match current.checked_add(token.amount) {
            None => return Err(Error::BalanceOverflow(token.token_type.clone())),
            Some(next) if next < 0 => return Ok(false),
            Some(_) => {}
        }

        Self::insert_token(&tx, token)?;
        Self::add_to_balance(&tx, &token.token_type, token.amount, token.timestamp)?;
        tx.commit()?;
        Ok(true)
    }

    fn get(&self, id: &TokenId) -> Result<Option<Token>> {
        Self::find(self.db.connection(), id)
    }

    fn list(&self, token_type: Option<&str>) -> Result<Vec<Token>> {
        let conn = self.db.connection();
        let tokens = if let Some(token_type) = token_type {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TOKEN_COLUMNS} FROM tokens WHERE type = ? ORDER BY seq"
            ))?;
            let rows = stmt.query_map(params![token_type], Self::parse_token)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        } else {
            let mut stmt = conn.prepare(&format!("SELECT {TOKEN_COLUMNS} FROM tokens ORDER BY seq"))?;
            let rows = stmt.query_map([], Self::parse_token)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        Ok(tokens)
    }

    fn balance(&self, token_type: &str) -> Result<i64> {
        Self::read_balance(self.db.connection(), token_type)
    }

    fn balances(&self) -> Result<Vec<Balance>> {
        let mut stmt = self
            .db
            .connection()
            .prepare("SELECT type, balance, last_updated FROM balances ORDER BY type")?;
        let balances = stmt
            .query_map([], |row| {
                Ok(Balance {
                    token_type: row.get(0)?,
                    balance: row.get(1)?,
                    last_updated: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(balances)
    }

    fn replace(&mut self, token: &Token) -> Result<Option<Token>> {
        let tx = self.db.connection_mut().transaction()?;
        let Some(previous) = Self::find(&tx, &token.id)? else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE tokens SET type = ?2, amount = ?3, source = ?4, description = ?5, metadata = ?6
             WHERE id = ?1",
            params![
                token.id.as_str(),
                token.token_type,
                token.amount,
                token.source,
                token.description,
                token.metadata,
            ],
        )?;
        Self::recount_balance(&tx, &previous.token_type)?;
        if token.token_type != previous.token_type {
            Self::recount_balance(&tx, &token.token_type)?;
        }
        tx.commit()?;
        Ok(Some(previous))
    }

    fn remove(&mut self, id: &TokenId) -> Result<Option<Token>> {
        let tx = self.db.connection_mut().transaction()?;
        let Some(previous) = Self::find(&tx, id)? else {
            return Ok(None);
        };

        tx.execute("DELETE FROM tokens WHERE id = ?", params![id.as_str()])?;
        Self::recount_balance(&tx, &previous.token_type)?;
        tx.commit()?;
        Ok(Some(previous))
    }

    fn clear(&mut self) -> Result<()> {
        let tx = self.db.connection_mut().transaction()?;
        tx.execute_batch("DELETE FROM tokens; DELETE FROM balances;")?;
        tx.commit()?;
        Ok(())
    }

    fn rebuild_balances(&mut self) -> Result<()> {
        let tx = self.db.connection_mut().transaction()?;
        let tokens = {
            let mut stmt = tx.prepare(&format!("SELECT {TOKEN_COLUMNS} FROM tokens ORDER BY seq"))?;
            let rows = stmt.query_map([], Self::parse_token)?;
            rows.collect::<std::result::Result<Vec<_>, _>>()?
        };
        let balances = balances_from_log(&tokens)?;

        tx.execute("DELETE FROM balances", [])?;
        for balance in balances {
            tx.execute(
                "INSERT INTO balances (type, balance, last_updated) VALUES (?1, ?2, ?3)",
                params![balance.token_type, balance.balance, balance.last_updated],
            )?;
        }
        tx.commit()?;
        Ok(())
    }
}
