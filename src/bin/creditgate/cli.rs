use std::path::PathBuf;

use clap::{Parser, Subcommand};

use creditgate::{BillingPeriod, TransactionKind, UserId};

/// Operate a credit ledger stored in a SQLite file.
#[derive(Debug, Parser)]
#[command(name = "creditgate", version)]
pub(crate) struct Cli {
    /// TOML or JSON config; built-in defaults when omitted.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "creditgate.sqlite")]
    pub db: PathBuf,

    #[arg(long, global = true)]
    pub json_logs: bool,

    #[arg(long, global = true)]
    pub otel: bool,

    #[arg(long, global = true)]
    pub otel_endpoint: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub(crate) enum Command {
    /// Create the database schema.
    Init,
    Balance {
        #[arg(long)]
        user: UserId,
    },
    Grant {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        amount: i64,
        #[arg(long, default_value = "admin", value_parser = parse_kind)]
        kind: TransactionKind,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        correlation_id: Option<String>,
        /// 0 keeps the credits forever.
        #[arg(long, default_value_t = 0)]
        expiry_days: u32,
    },
    Spend {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        amount: i64,
        #[arg(long, default_value = "admin", value_parser = parse_kind)]
        kind: TransactionKind,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Claim the daily grant for a user.
    Daily {
        #[arg(long)]
        user: UserId,
        #[arg(long, default_value_t = 0)]
        bonus_percent: u32,
    },
    History {
        #[arg(long)]
        user: UserId,
        #[arg(long, default_value_t = 20)]
        limit: usize,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Reverse expired grants and lapsed subscriptions.
    Sweep {
        /// Sweep as of this epoch millisecond instead of now.
        #[arg(long)]
        now_ms: Option<u64>,
    },
    Plans,
    Subscribe {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        plan: String,
        #[arg(long, default_value = "monthly", value_parser = parse_period)]
        period: BillingPeriod,
        #[arg(long)]
        payment_id: Option<String>,
    },
    Purchase {
        #[arg(long)]
        user: UserId,
        #[arg(long)]
        package: i64,
        #[arg(long)]
        payment_id: String,
    },
    /// Request counts per model and recent usage.
    Stats {
        #[arg(long)]
        user: UserId,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    Audit {
        #[arg(long, default_value_t = 50)]
        limit: usize,
        #[arg(long)]
        since_ms: Option<u64>,
    },
}

fn parse_kind(raw: &str) -> Result<TransactionKind, String> {
    raw.parse()
}

fn parse_period(raw: &str) -> Result<BillingPeriod, String> {
    raw.parse()
}
