//! Ledger token model

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::util::{normalize_text_option, now_millis};

/// A unique identifier for a token, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    /// Create a new unique token ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }
}

impl Default for TokenId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TokenId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// An immutable ledger entry. Positive amounts credit, negative amounts debit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: TokenId,
    /// Category key the amount is booked against
    #[serde(rename = "type")]
    pub token_type: String,
    pub amount: i64,
    /// Origin identifier (repository, feature, ...)
    pub source: String,
    pub description: String,
    /// Booking time (Unix ms)
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Request to book a token
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub struct NewToken {
    pub token_type: String,
    pub amount: i64,
    pub source: String,
    pub description: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewToken {
    pub fn new(
        token_type: impl Into<String>,
        amount: i64,
        source: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            token_type: token_type.into(),
            amount,
            source: source.into(),
            description: description.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    /// Stamp an id and timestamp. The type must be non-blank.
    pub fn into_token(self) -> Result<Token> {
        let token_type = normalize_text_option(Some(self.token_type))
            .ok_or_else(|| Error::InvalidInput("token type cannot be empty".into()))?;

        Ok(Token {
            id: TokenId::new(),
            token_type,
            amount: self.amount,
            source: self.source.trim().to_string(),
            description: self.description,
            timestamp: now_millis(),
            metadata: self.metadata,
        })
    }
}

/// Field changes for the ledger's correction path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct TokenPatch {
    pub token_type: Option<String>,
    pub amount: Option<i64>,
    pub source: Option<String>,
    pub description: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

impl TokenPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn amount(mut self, amount: i64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn token_type(mut self, token_type: impl Into<String>) -> Self {
        self.token_type = Some(token_type.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Produce the patched token; id and timestamp are preserved
    pub fn apply(&self, token: &Token) -> Result<Token> {
        let mut patched = token.clone();
        if let Some(token_type) = &self.token_type {
            patched.token_type = normalize_text_option(Some(token_type.clone()))
                .ok_or_else(|| Error::InvalidInput("token type cannot be empty".into()))?;
        }
        if let Some(amount) = self.amount {
            patched.amount = amount;
        }
        if let Some(source) = &self.source {
            patched.source.clone_from(source);
        }
        if let Some(description) = &self.description {
            patched.description.clone_from(description);
        }
        if let Some(metadata) = &self.metadata {
            patched.metadata = Some(metadata.clone());
        }
        Ok(patched)
    }
}

/// Materialized running total for one token type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Balance {
    #[serde(rename = "type")]
    pub token_type: String,
    pub balance: i64,
    /// Timestamp of the most recent contributing token (Unix ms)
    pub last_updated: i64,
}

/// Derive balances from a token log, the reference the materialized values must match.
///
/// Fails with [`Error::BalanceOverflow`] when a type's total does not fit in `i64`.
pub fn balances_from_log<'a>(tokens: impl IntoIterator<Item = &'a Token>) -> Result<Vec<Balance>> {
    let mut totals: std::collections::BTreeMap<&str, (i128, i64)> = std::collections::BTreeMap::new();
    for token in tokens {
        let (sum, last_updated) = totals
            .entry(token.token_type.as_str())
            .or_insert((0, token.timestamp));
        *sum += i128::from(token.amount);
        *last_updated = (*last_updated).max(token.timestamp);
    }

    totals
        .into_iter()
        .map(|(token_type, (sum, last_updated))| {
            let balance =
                i64::try_from(sum).map_err(|_| Error::BalanceOverflow(token_type.to_string()))?;
            Ok(Balance {
                token_type: token_type.to_string(),
                balance,
                last_updated,
            })
        })
        .collect()
}
