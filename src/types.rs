use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::LedgerError;

pub type UserId = i64;

/// Opaque key/value data attached to ledger and usage records.
pub type Metadata = BTreeMap<String, serde_json::Value>;

pub const HOUR_MS: u64 = 60 * 60 * 1000;
pub const DAY_MS: u64 = 24 * HOUR_MS;

/// Correlation id stamped on debits produced by the expiry sweep.
pub const EXPIRE_SYSTEM_CORRELATION: &str = "expire_system";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Daily,
    Purchase,
    Usage,
    Referral,
    Bonus,
    Subscription,
    Admin,
    Promo,
    Achievement,
}

impl TransactionKind {
    pub const ALL: [TransactionKind; 9] = [
        Self::Daily,
        Self::Purchase,
        Self::Usage,
        Self::Referral,
        Self::Bonus,
        Self::Subscription,
        Self::Admin,
        Self::Promo,
        Self::Achievement,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Purchase => "purchase",
            Self::Usage => "usage",
            Self::Referral => "referral",
            Self::Bonus => "bonus",
            Self::Subscription => "subscription",
            Self::Admin => "admin",
            Self::Promo => "promo",
            Self::Achievement => "achievement",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("unknown transaction kind: {raw}"))
    }
}

/// Materialized balance of one user. The ledger is the source of truth; this row caches its sum.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub user_id: UserId,
    pub amount: i64,
    pub lifetime_earned: i64,
    pub lifetime_spent: i64,
    pub last_daily_grant_at_ms: Option<u64>,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
}

impl Balance {
    pub fn zero(user_id: UserId, now_ms: u64) -> Self {
        Self {
            user_id,
            amount: 0,
            lifetime_earned: 0,
            lifetime_spent: 0,
            last_daily_grant_at_ms: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Milliseconds left until the next daily grant may be claimed, `None` when claimable now.
    pub fn daily_grant_wait_ms(&self, now_ms: u64, window_ms: u64) -> Option<u64> {
        let last = self.last_daily_grant_at_ms?;
        let elapsed = now_ms.saturating_sub(last);
        if elapsed >= window_ms {
            None
        } else {
            Some(window_ms - elapsed)
        }
    }

    /// Applies a delta, refusing results that are negative or out of range.
    ///
    /// `daily_grant` stamps the daily window; only the daily-grant path sets it.
    pub(crate) fn applied(
        &self,
        delta: i64,
        daily_grant: bool,
        at_ms: u64,
    ) -> Result<Self, LedgerError> {
        let amount = self
            .amount
            .checked_add(delta)
            .ok_or(LedgerError::InvalidAmount { amount: delta })?;
        if amount < 0 {
            return Err(LedgerError::InsufficientBalance {
                required: delta.saturating_neg(),
                available: self.amount,
            });
        }
        let mut next = self.clone();
        next.amount = amount;
        if delta > 0 {
            next.lifetime_earned = next.lifetime_earned.saturating_add(delta);
        } else {
            next.lifetime_spent = next.lifetime_spent.saturating_add(delta.saturating_neg());
        }
        if daily_grant {
            next.last_daily_grant_at_ms = Some(at_ms);
        }
        next.updated_at_ms = at_ms;
        Ok(next)
    }
}

/// Immutable record of one balance mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: i64,
    pub user_id: UserId,
    pub delta: i64,
    pub balance_after: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub expires_at_ms: Option<u64>,
    pub correlation_id: Option<String>,
    pub metadata: Metadata,
    pub created_at_ms: u64,
}

/// A mutation request handed to a [`crate::BalanceStore`].
#[derive(Clone, Debug)]
pub struct LedgerEntry {
    pub user_id: UserId,
    pub delta: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub expires_at_ms: Option<u64>,
    pub correlation_id: Option<String>,
    pub metadata: Metadata,
    /// When set, the store refuses the entry if the previous daily grant is younger than this.
    pub daily_window_ms: Option<u64>,
    pub at_ms: u64,
}

impl LedgerEntry {
    pub fn new(user_id: UserId, delta: i64, kind: TransactionKind, at_ms: u64) -> Self {
        Self {
            user_id,
            delta,
            kind,
            description: String::new(),
            expires_at_ms: None,
            correlation_id: None,
            metadata: Metadata::new(),
            daily_window_ms: None,
            at_ms,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_expiry(mut self, expires_at_ms: Option<u64>) -> Self {
        self.expires_at_ms = expires_at_ms;
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Option<String>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_daily_window(mut self, window_ms: u64) -> Self {
        self.daily_window_ms = Some(window_ms);
        self
    }

    pub(crate) fn into_transaction(self, id: i64, balance_after: i64) -> LedgerTransaction {
        LedgerTransaction {
            id,
            user_id: self.user_id,
            delta: self.delta,
            balance_after,
            kind: self.kind,
            description: self.description,
            expires_at_ms: self.expires_at_ms,
            correlation_id: self.correlation_id,
            metadata: self.metadata,
            created_at_ms: self.at_ms,
        }
    }
}

/// Result of reversing one user's expired grants.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpiryOutcome {
    pub user_id: UserId,
    pub grants_closed: usize,
    pub expired_total: i64,
    pub debited: i64,
    pub transaction: Option<LedgerTransaction>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub user_id: UserId,
    pub model: String,
    pub prompt_chars: u64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub credits_charged: i64,
    pub fingerprint: String,
    pub transaction_id: Option<i64>,
    pub cached_from: Option<i64>,
    pub response_text: String,
    pub metadata: Metadata,
    pub created_at_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NewUsageRecord {
    pub user_id: UserId,
    pub model: String,
    pub prompt_chars: u64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub credits_charged: i64,
    pub fingerprint: String,
    pub transaction_id: Option<i64>,
    pub cached_from: Option<i64>,
    pub response_text: String,
    pub metadata: Metadata,
    pub created_at_ms: u64,
}

impl NewUsageRecord {
    pub(crate) fn into_record(self, id: i64) -> UsageRecord {
        UsageRecord {
            id,
            user_id: self.user_id,
            model: self.model,
            prompt_chars: self.prompt_chars,
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            credits_charged: self.credits_charged,
            fingerprint: self.fingerprint,
            transaction_id: self.transaction_id,
            cached_from: self.cached_from,
            response_text: self.response_text,
            metadata: self.metadata,
            created_at_ms: self.created_at_ms,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditLogRecord {
    pub id: i64,
    pub ts_ms: u64,
    pub kind: String,
    pub payload: serde_json::Value,
}
