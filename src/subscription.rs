use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::types::{DAY_MS, UserId};

/// Length of the window synthesized for users without a stored subscription.
pub const DEFAULT_PLAN_WINDOW_MS: u64 = 100 * 365 * DAY_MS;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim() {
            "active" => Ok(Self::Active),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            other => Err(format!("unknown subscription status: {other}")),
        }
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Monthly,
    Yearly,
}

impl BillingPeriod {
    pub fn duration_ms(self) -> u64 {
        match self {
            Self::Monthly => 30 * DAY_MS,
            Self::Yearly => 365 * DAY_MS,
        }
    }
}

impl FromStr for BillingPeriod {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "monthly" | "month" => Ok(Self::Monthly),
            "yearly" | "year" | "annual" => Ok(Self::Yearly),
            other => Err(format!("unknown billing period: {other}")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    /// `None` for the synthesized default-plan subscription, which is never stored.
    pub id: Option<i64>,
    pub user_id: UserId,
    pub plan_code: String,
    pub status: SubscriptionStatus,
    pub start_ms: u64,
    pub end_ms: u64,
    pub auto_renew: bool,
    pub payment_id: Option<String>,
}

impl Subscription {
    pub fn synthesized(user_id: UserId, plan_code: impl Into<String>, now_ms: u64) -> Self {
        Self {
            id: None,
            user_id,
            plan_code: plan_code.into(),
            status: SubscriptionStatus::Active,
            start_ms: now_ms,
            end_ms: now_ms.saturating_add(DEFAULT_PLAN_WINDOW_MS),
            auto_renew: false,
            payment_id: None,
        }
    }

    pub fn is_active_at(&self, now_ms: u64) -> bool {
        self.status == SubscriptionStatus::Active && self.end_ms > now_ms
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewSubscription {
    pub user_id: UserId,
    pub plan_code: String,
    pub start_ms: u64,
    pub end_ms: u64,
    pub auto_renew: bool,
    pub payment_id: Option<String>,
}

impl NewSubscription {
    pub(crate) fn into_subscription(self, id: i64) -> Subscription {
        Subscription {
            id: Some(id),
            user_id: self.user_id,
            plan_code: self.plan_code,
            status: SubscriptionStatus::Active,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            auto_renew: self.auto_renew,
            payment_id: self.payment_id,
        }
    }
}
