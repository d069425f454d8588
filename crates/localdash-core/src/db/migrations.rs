//! Database migrations

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use crate::error::Result;

/// Current schema version
const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations
///
/// The version is read under the write lock, so processes opening the same
/// fresh file serialize here and later ones see the finished schema.
pub fn run(conn: &mut Connection) -> Result<()> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let version = get_version(&tx)?;

    if version < 1 {
        migrate_v1(&tx)?;
    }
    if version < 2 {
        migrate_v2(&tx)?;
    }

    tx.commit()?;
    if version < CURRENT_VERSION {
        tracing::info!("Migrated database from version {version} to {CURRENT_VERSION}");
    }
    Ok(())
}

/// Get the current schema version
fn get_version(conn: &Connection) -> Result<i32> {
    let exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version')",
        [],
        |row| row.get(0),
    )?;

    if !exists {
        return Ok(0);
    }

    let version = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get::<_, i32>(0),
        )
        .optional()?
        .unwrap_or(0);

    Ok(version)
}

/// Migration to version 1: schema tracking and the collection registry
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );
        CREATE TABLE IF NOT EXISTS collections (
            name TEXT PRIMARY KEY,
            schema TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO schema_version (version) VALUES (1);",
    )?;
    Ok(())
}

/// Migration to version 2: token ledger with materialized balances
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS tokens (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            type TEXT NOT NULL,
            amount INTEGER NOT NULL,
            source TEXT NOT NULL,
            description TEXT NOT NULL,
            timestamp INTEGER NOT NULL,
            metadata TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_tokens_type ON tokens(type);
        CREATE INDEX IF NOT EXISTS idx_tokens_timestamp ON tokens(timestamp);
        CREATE TABLE IF NOT EXISTS balances (
            type TEXT PRIMARY KEY,
            balance INTEGER NOT NULL,
            last_updated INTEGER NOT NULL
        );
        INSERT OR IGNORE INTO schema_version (version) VALUES (2);",
    )?;
    Ok(())
}
