use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Core(#[from] localdash_core::Error),
    #[error(transparent)]
    Github(#[from] localdash_core::github::GithubError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("Insufficient {token_type} balance: have {balance}, need {requested}")]
    InsufficientBalance {
        token_type: String,
        balance: i64,
        requested: i64,
    },
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Balances disagree with the token log for {0} type(s); run `localdash tokens verify --repair`")]
    BalanceDrift(usize),
}
