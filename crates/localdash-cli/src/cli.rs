use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use localdash_core::reconcile::Strategy;

#[derive(Parser)]
#[command(name = "localdash")]
#[command(about = "Track tokens and keep a local cache of your GitHub repositories")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the CLI config file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Directory holding the local databases
    #[arg(long, global = true, value_name = "DIR")]
    pub data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Book, spend and inspect tokens
    Tokens {
        #[command(subcommand)]
        command: TokensCommands,
    },
    /// Inspect and refresh cached repositories
    Repos {
        #[command(subcommand)]
        command: ReposCommands,
    },
    /// Show or create the CLI config
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
pub enum TokensCommands {
    /// Credit tokens
    Earn {
        /// Token type, e.g. infinity_tokens
        token_type: String,
        /// Amount to credit (greater than zero)
        amount: i64,
        /// Origin of the tokens
        #[arg(long, default_value = "cli")]
        source: String,
        /// Free-form note
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Debit tokens if the balance covers it
    Spend {
        /// Token type
        token_type: String,
        /// Amount to debit (greater than zero)
        amount: i64,
        /// What the tokens were spent on
        #[arg(long, default_value = "cli")]
        source: String,
        /// Free-form note
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Show balances
    Balance {
        /// Only this token type
        token_type: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List booked tokens
    List {
        /// Only this token type
        #[arg(long = "type", value_name = "TYPE")]
        token_type: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete every token and balance
    Clear,
    /// Check balances against the token log
    Verify {
        /// Rebuild balances from the log when they disagree
        #[arg(long)]
        repair: bool,
    },
}

#[derive(Subcommand)]
pub enum ReposCommands {
    /// List cached repositories
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fetch a user's repositories and reconcile them with the cache
    Sync {
        /// GitHub user name
        user: String,
        /// Override the configured conflict strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
    },
    /// Show what a sync would change without writing
    Diff {
        /// GitHub user name
        user: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Write a config file with defaults and the given overrides
    Init {
        /// Directory for the local databases
        #[arg(long = "set-data-dir", value_name = "DIR")]
        data_dir: Option<PathBuf>,
        /// Default conflict strategy
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,
        /// Timestamp difference (ms) above which versions conflict
        #[arg(long, value_name = "MS")]
        skew_threshold_ms: Option<u64>,
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum StrategyArg {
    Server,
    Cache,
    Merge,
    Skip,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::Server => Self::Server,
            StrategyArg::Cache => Self::Cache,
            StrategyArg::Merge => Self::Merge,
            StrategyArg::Skip => Self::Skip,
        }
    }
}
