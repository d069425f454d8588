use chrono::Utc;
use localdash_core::ledger::{LedgerService, SpendOutcome};
use localdash_core::models::Token;

use crate::cli::TokensCommands;
use crate::commands::common::{
    format_amount, format_balance_lines, format_drift_lines, format_token_lines,
    token_to_list_item, TokenListItem,
};
use crate::error::CliError;

pub async fn run_tokens(command: TokensCommands, ledger: &LedgerService) -> Result<(), CliError> {
    match command {
        TokensCommands::Earn {
            token_type,
            amount,
            source,
            description,
        } => {
            run_earn(ledger, &token_type, amount, &source, &description).await?;
        }
        TokensCommands::Spend {
            token_type,
            amount,
            source,
            description,
        } => {
            run_spend(ledger, &token_type, amount, &source, &description).await?;
        }
        TokensCommands::Balance { token_type, json } => {
            run_balance(ledger, token_type.as_deref(), json).await?;
        }
        TokensCommands::List { token_type, json } => {
            run_list(ledger, token_type.as_deref(), json).await?;
        }
        TokensCommands::Clear => run_clear(ledger).await?,
        TokensCommands::Verify { repair } => run_verify(ledger, repair).await?,
    }
    Ok(())
}

pub async fn run_earn(
    ledger: &LedgerService,
    token_type: &str,
    amount: i64,
    source: &str,
    description: &str,
) -> Result<Token, CliError> {
    let token = ledger.earn(token_type, amount, source, description).await?;
    let balance = ledger.get_balance(&token.token_type).await?;
    println!(
        "{}  {} {}  balance={balance}",
        token.id,
        format_amount(token.amount),
        token.token_type
    );
    Ok(token)
}

pub async fn run_spend(
    ledger: &LedgerService,
    token_type: &str,
    amount: i64,
    source: &str,
    description: &str,
) -> Result<Token, CliError> {
    match ledger.spend(token_type, amount, source, description).await? {
        SpendOutcome::Spent(token) => {
            let balance = ledger.get_balance(&token.token_type).await?;
            println!(
                "{}  {} {}  balance={balance}",
                token.id,
                format_amount(token.amount),
                token.token_type
            );
            Ok(token)
        }
        SpendOutcome::Insufficient { balance, requested } => Err(CliError::InsufficientBalance {
            token_type: token_type.trim().to_string(),
            balance,
            requested,
        }),
    }
}

pub async fn run_balance(
    ledger: &LedgerService,
    token_type: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    if let Some(token_type) = token_type {
        let balance = ledger.get_balance(token_type).await?;
        if as_json {
            println!("{}", serde_json::json!({ "type": token_type, "balance": balance }));
        } else {
            println!("{balance}");
        }
        return Ok(());
    }

    let balances = ledger.get_all_balances().await?;
    if as_json {
        println!("{}", serde_json::to_string_pretty(&balances)?);
    } else if balances.is_empty() {
        println!("No tokens booked yet");
    } else {
        for line in format_balance_lines(&balances) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_list(
    ledger: &LedgerService,
    token_type: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let tokens = ledger.get_all(token_type).await?;
    let now_ms = Utc::now().timestamp_millis();

    if as_json {
        let items = tokens
            .iter()
            .map(|token| token_to_list_item(token, now_ms))
            .collect::<Vec<TokenListItem>>();
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for line in format_token_lines(&tokens, now_ms) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_clear(ledger: &LedgerService) -> Result<(), CliError> {
    ledger.clear_all().await?;
    println!("Cleared all tokens and balances");
    Ok(())
}

pub async fn run_verify(ledger: &LedgerService, repair: bool) -> Result<(), CliError> {
    let drift = ledger.verify_balances().await?;
    if drift.is_empty() {
        println!("Balances match the token log");
        return Ok(());
    }

    for line in format_drift_lines(&drift) {
        eprintln!("{line}");
    }
    if !repair {
        return Err(CliError::BalanceDrift(drift.len()));
    }

    ledger.rebuild_balances().await?;
    println!("Rebuilt {} balance(s) from the token log", drift.len());
    Ok(())
}
