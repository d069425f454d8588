//! Data models for localdash

mod repository;
mod token;

pub use repository::Repository;
pub use token::{balances_from_log, Balance, NewToken, Token, TokenId, TokenPatch};
