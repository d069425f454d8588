//! localdash-core - Core library for localdash
//!
//! This crate contains the document store, token ledger, notification bus
//! and reconciliation engine used by localdash clients, plus the GitHub
//! collaborator that feeds repository snapshots into reconciliation.

pub mod bus;
pub mod config;
pub mod db;
pub mod error;
pub mod github;
pub mod ledger;
pub mod models;
pub mod reconcile;
pub mod services;
pub mod store;
pub mod util;

pub use error::{Error, Result};
pub use models::{Repository, Token, TokenId};
