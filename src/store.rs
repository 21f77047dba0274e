//! Storage seams for balances, usage records and subscriptions.
//!
//! Every balance mutation goes through [`BalanceStore::apply_delta`], which locks the user's
//! balance, validates the result and appends the transaction in one unit.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::subscription::{NewSubscription, Subscription};
use crate::types::{
    AuditLogRecord, Balance, ExpiryOutcome, LedgerEntry, LedgerTransaction, NewUsageRecord,
    UsageRecord, UserId,
};

#[async_trait]
pub trait BalanceStore: Send + Sync {
    /// Returns the user's balance, creating a zero balance on first access.
    async fn get_balance(&self, user_id: UserId, now_ms: u64) -> Result<Balance>;

    /// Applies `entry` atomically and returns the appended transaction.
    ///
    /// Fails with `InsufficientBalance` when the result would be negative, with `AlreadyGranted`
    /// when the entry's daily window has not elapsed, and with `LockTimeout` when the user's
    /// balance stays locked for longer than the store's lock timeout. Nothing is written on
    /// failure.
    async fn apply_delta(&self, entry: LedgerEntry) -> Result<LedgerTransaction>;

    /// Newest first.
    async fn transactions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>>;

    /// Users holding positive grants that expired before `now_ms` and were not swept yet.
    async fn users_with_expired_grants(&self, now_ms: u64) -> Result<Vec<UserId>>;

    /// Sweeps one user's expired grants in a single unit.
    ///
    /// Debits `min(expired sum, balance)` with an `admin` transaction correlated to
    /// [`crate::types::EXPIRE_SYSTEM_CORRELATION`] and marks every swept grant so a later call
    /// ignores it.
    async fn expire_grants(&self, user_id: UserId, now_ms: u64) -> Result<ExpiryOutcome>;

    async fn append_audit_log(
        &self,
        ts_ms: u64,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()>;

    /// Newest first.
    async fn list_audit_logs(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<AuditLogRecord>>;
}

#[async_trait]
pub trait UsageStore: Send + Sync {
    /// Appends a usage record. Records that are not themselves cache hits become the cached
    /// response for their fingerprint.
    async fn insert_usage(&self, record: NewUsageRecord) -> Result<UsageRecord>;

    /// Most recent cacheable record for `fingerprint` created at or after `not_before_ms`.
    async fn cached_usage(
        &self,
        fingerprint: &str,
        not_before_ms: Option<u64>,
    ) -> Result<Option<UsageRecord>>;

    /// Request count per model.
    async fn usage_statistics(&self, user_id: UserId) -> Result<BTreeMap<String, u64>>;

    /// Newest first.
    async fn usage_history(&self, user_id: UserId, limit: usize) -> Result<Vec<UsageRecord>>;
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn active_subscription(
        &self,
        user_id: UserId,
        now_ms: u64,
    ) -> Result<Option<Subscription>>;

    /// Stores a new active subscription, cancelling any subscription of the user that is still
    /// marked active, in one unit.
    async fn create_subscription(&self, subscription: NewSubscription) -> Result<Subscription>;

    /// Fails with `SubscriptionNotFound` when `id` does not belong to `user_id`.
    async fn cancel_subscription(&self, user_id: UserId, id: i64) -> Result<Subscription>;

    /// Marks active subscriptions whose window ended at or before `now_ms` as expired.
    async fn expire_subscriptions(&self, now_ms: u64) -> Result<u64>;

    /// Newest first.
    async fn subscriptions(&self, user_id: UserId) -> Result<Vec<Subscription>>;
}
