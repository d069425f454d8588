//! SQLite connection and schema management shared by the document store
//! and the ledger.

mod connection;
mod migrations;

pub use connection::Database;
