use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{ErrorCode, OptionalExtension, TransactionBehavior};
use thiserror::Error;

use crate::error::{LedgerError, Result};
use crate::store::{BalanceStore, SubscriptionStore, UsageStore};
use crate::subscription::{NewSubscription, Subscription, SubscriptionStatus};
use crate::types::{
    AuditLogRecord, Balance, EXPIRE_SYSTEM_CORRELATION, ExpiryOutcome, LedgerEntry,
    LedgerTransaction, Metadata, NewUsageRecord, TransactionKind, UsageRecord, UserId,
};

#[derive(Clone, Debug)]
pub struct SqliteStore {
    path: PathBuf,
    lock_timeout: Duration,
}

#[derive(Debug, Error)]
pub enum SqliteStoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row: {0}")]
    Corrupt(String),
    #[error("balance of user {user_id} is locked")]
    Locked { user_id: UserId },
    #[error(transparent)]
    Rejected(LedgerError),
    #[error("daily grant already claimed; retry in {retry_after_ms}ms")]
    AlreadyGranted { retry_after_ms: u64 },
    #[error("subscription not found: {id}")]
    SubscriptionNotFound { id: i64 },
}

impl SqliteStoreError {
    /// Reports a busy database inside a user-scoped unit as a lock timeout on that user.
    fn scoped_to(self, user_id: UserId) -> Self {
        match self {
            Self::Sqlite(err) if is_busy(&err) => Self::Locked { user_id },
            other => other,
        }
    }
}

impl From<SqliteStoreError> for LedgerError {
    fn from(err: SqliteStoreError) -> Self {
        match err {
            SqliteStoreError::Locked { user_id } => LedgerError::LockTimeout { user_id },
            SqliteStoreError::Rejected(err) => err,
            SqliteStoreError::AlreadyGranted { retry_after_ms } => {
                LedgerError::AlreadyGranted { retry_after_ms }
            }
            SqliteStoreError::SubscriptionNotFound { id } => {
                LedgerError::SubscriptionNotFound { id }
            }
            SqliteStoreError::Sqlite(err) if is_busy(&err) => LedgerError::Timeout {
                operation: "sqlite_busy",
            },
            other => LedgerError::StoreUnavailable {
                message: other.to_string(),
            },
        }
    }
}

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

impl SqliteStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock_timeout: Duration::from_secs(5),
        }
    }

    /// Bounds how long a writer waits for another writer's transaction.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> std::result::Result<(), SqliteStoreError> {
        let path = self.path.clone();
        let lock_timeout = self.lock_timeout;
        tokio::task::spawn_blocking(move || -> std::result::Result<(), SqliteStoreError> {
            let conn = open_connection(&path, lock_timeout)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn run<T, F>(&self, op: F) -> std::result::Result<T, SqliteStoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut rusqlite::Connection) -> std::result::Result<T, SqliteStoreError>
            + Send
            + 'static,
    {
        let path = self.path.clone();
        let lock_timeout = self.lock_timeout;
        tokio::task::spawn_blocking(move || -> std::result::Result<T, SqliteStoreError> {
            let mut conn = open_connection(&path, lock_timeout)?;
            init_schema(&conn)?;
            op(&mut conn)
        })
        .await?
    }
}

#[async_trait]
impl BalanceStore for SqliteStore {
    async fn get_balance(&self, user_id: UserId, now_ms: u64) -> Result<Balance> {
        let balance = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                ensure_balance(&tx, user_id, now_ms)?;
                let balance = load_balance(&tx, user_id)?;
                tx.commit()?;
                Ok(balance)
            })
            .await
            .map_err(|err| err.scoped_to(user_id))?;
        Ok(balance)
    }

    async fn apply_delta(&self, entry: LedgerEntry) -> Result<LedgerTransaction> {
        let user_id = entry.user_id;
        let metadata_json = serde_json::to_string(&entry.metadata)
            .map_err(SqliteStoreError::from)?;

        let transaction = self
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_balance(&tx, entry.user_id, entry.at_ms)?;
                let balance = load_balance(&tx, entry.user_id)?;

                if let Some(window_ms) = entry.daily_window_ms {
                    if let Some(retry_after_ms) = balance.daily_grant_wait_ms(entry.at_ms, window_ms)
                    {
                        return Err(SqliteStoreError::AlreadyGranted { retry_after_ms });
                    }
                }

                let next = balance
                    .applied(entry.delta, entry.daily_window_ms.is_some(), entry.at_ms)
                    .map_err(SqliteStoreError::Rejected)?;
                store_balance(&tx, &next)?;
                let id = insert_transaction(&tx, &entry, next.amount, &metadata_json)?;
                tx.commit()?;
                Ok(entry.into_transaction(id, next.amount))
            })
            .await
            .map_err(|err| err.scoped_to(user_id))?;
        Ok(transaction)
    }

    async fn transactions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        let transactions = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, delta, balance_after, kind, description, expires_at_ms,
                            correlation_id, metadata_json, created_at_ms
                     FROM ledger_transactions
                     WHERE user_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2 OFFSET ?3",
                )?;
                let rows = stmt.query_map(rusqlite::params![user_id, limit, offset], read_transaction)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?.decode()?);
                }
                Ok(out)
            })
            .await?;
        Ok(transactions)
    }

    async fn users_with_expired_grants(&self, now_ms: u64) -> Result<Vec<UserId>> {
        let now = u64_to_i64(now_ms);
        let users = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT t.user_id
                     FROM ledger_transactions t
                     WHERE t.delta > 0
                       AND t.expires_at_ms IS NOT NULL
                       AND t.expires_at_ms < ?1
                       AND NOT EXISTS (SELECT 1 FROM expired_grants e WHERE e.grant_id = t.id)
                     ORDER BY t.user_id",
                )?;
                let rows = stmt.query_map(rusqlite::params![now], |row| row.get::<_, i64>(0))?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?);
                }
                Ok(out)
            })
            .await?;
        Ok(users)
    }

    async fn expire_grants(&self, user_id: UserId, now_ms: u64) -> Result<ExpiryOutcome> {
        let outcome = self
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                ensure_balance(&tx, user_id, now_ms)?;
                let balance = load_balance(&tx, user_id)?;

                let grants: Vec<(i64, i64)> = {
                    let mut stmt = tx.prepare(
                        "SELECT t.id, t.delta
                         FROM ledger_transactions t
                         WHERE t.user_id = ?1
                           AND t.delta > 0
                           AND t.expires_at_ms IS NOT NULL
                           AND t.expires_at_ms < ?2
                           AND NOT EXISTS (SELECT 1 FROM expired_grants e WHERE e.grant_id = t.id)
                         ORDER BY t.id",
                    )?;
                    let rows = stmt.query_map(
                        rusqlite::params![user_id, u64_to_i64(now_ms)],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )?;
                    rows.collect::<rusqlite::Result<_>>()?
                };

                let grant_ids: Vec<i64> = grants.iter().map(|(id, _)| *id).collect();
                let expired_total = grants
                    .iter()
                    .fold(0i64, |acc, (_, delta)| acc.saturating_add(*delta));
                let debited = expired_total.min(balance.amount);

                let mut outcome = ExpiryOutcome {
                    user_id,
                    grants_closed: grant_ids.len(),
                    expired_total,
                    debited,
                    transaction: None,
                };

                if debited > 0 {
                    let mut metadata = Metadata::new();
                    metadata.insert("expired_grants".to_string(), serde_json::json!(grant_ids));
                    metadata.insert("expired_total".to_string(), serde_json::json!(expired_total));
                    let metadata_json = serde_json::to_string(&metadata)?;
                    let entry = LedgerEntry::new(user_id, -debited, TransactionKind::Admin, now_ms)
                        .with_description("Expired credits")
                        .with_correlation_id(Some(EXPIRE_SYSTEM_CORRELATION.to_string()))
                        .with_metadata(metadata);
                    let next = balance
                        .applied(entry.delta, false, now_ms)
                        .map_err(SqliteStoreError::Rejected)?;
                    store_balance(&tx, &next)?;
                    let id = insert_transaction(&tx, &entry, next.amount, &metadata_json)?;
                    outcome.transaction = Some(entry.into_transaction(id, next.amount));
                }

                let reversal_id = outcome.transaction.as_ref().map(|t| t.id);
                for grant_id in &grant_ids {
                    tx.execute(
                        "INSERT INTO expired_grants (grant_id, user_id, reversal_id, swept_at_ms)
                         VALUES (?1, ?2, ?3, ?4)",
                        rusqlite::params![grant_id, user_id, reversal_id, u64_to_i64(now_ms)],
                    )?;
                }
                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(|err| err.scoped_to(user_id))?;
        Ok(outcome)
    }

    async fn append_audit_log(
        &self,
        ts_ms: u64,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let kind = kind.to_string();
        let payload_json = serde_json::to_string(&payload).map_err(SqliteStoreError::from)?;
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO audit_logs (ts_ms, kind, payload_json) VALUES (?1, ?2, ?3)",
                rusqlite::params![u64_to_i64(ts_ms), kind, payload_json],
            )?;
            Ok(())
        })
        .await?;
        Ok(())
    }

    async fn list_audit_logs(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<AuditLogRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let since = since_ts_ms.map(u64_to_i64).unwrap_or(0);
        let logs = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, ts_ms, kind, payload_json
                     FROM audit_logs
                     WHERE ts_ms >= ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![since, limit], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?;
                let mut out = Vec::new();
                for row in rows {
                    let (id, ts_ms, kind, payload_json) = row?;
                    let payload = serde_json::from_str(&payload_json)?;
                    out.push(AuditLogRecord {
                        id,
                        ts_ms: i64_to_u64(ts_ms),
                        kind,
                        payload,
                    });
                }
                Ok(out)
            })
            .await?;
        Ok(logs)
    }
}

#[async_trait]
impl UsageStore for SqliteStore {
    async fn insert_usage(&self, record: NewUsageRecord) -> Result<UsageRecord> {
        let metadata_json = serde_json::to_string(&record.metadata).map_err(SqliteStoreError::from)?;
        let record = self
            .run(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO usage_records (
                        user_id, model, prompt_chars, prompt_tokens, completion_tokens,
                        credits_charged, fingerprint, transaction_id, cached_from,
                        response_text, metadata_json, created_at_ms
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                    rusqlite::params![
                        record.user_id,
                        record.model,
                        u64_to_i64(record.prompt_chars),
                        record.prompt_tokens,
                        record.completion_tokens,
                        record.credits_charged,
                        record.fingerprint,
                        record.transaction_id,
                        record.cached_from,
                        record.response_text,
                        metadata_json,
                        u64_to_i64(record.created_at_ms),
                    ],
                )?;
                let id = tx.last_insert_rowid();
                if record.cached_from.is_none() {
                    tx.execute(
                        "INSERT INTO response_cache (fingerprint, usage_id, updated_at_ms)
                         VALUES (?1, ?2, ?3)
                         ON CONFLICT(fingerprint) DO UPDATE SET
                            usage_id = excluded.usage_id,
                            updated_at_ms = excluded.updated_at_ms",
                        rusqlite::params![record.fingerprint, id, u64_to_i64(record.created_at_ms)],
                    )?;
                }
                tx.commit()?;
                Ok(record.into_record(id))
            })
            .await?;
        Ok(record)
    }

    async fn cached_usage(
        &self,
        fingerprint: &str,
        not_before_ms: Option<u64>,
    ) -> Result<Option<UsageRecord>> {
        let fingerprint = fingerprint.to_string();
        let not_before = not_before_ms.map(u64_to_i64).unwrap_or(0);
        let record = self
            .run(move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT u.id, u.user_id, u.model, u.prompt_chars, u.prompt_tokens,
                                u.completion_tokens, u.credits_charged, u.fingerprint,
                                u.transaction_id, u.cached_from, u.response_text,
                                u.metadata_json, u.created_at_ms
                         FROM response_cache c
                         JOIN usage_records u ON u.id = c.usage_id
                         WHERE c.fingerprint = ?1 AND u.created_at_ms >= ?2",
                        rusqlite::params![fingerprint, not_before],
                        read_usage,
                    )
                    .optional()?;
                raw.map(RawUsage::decode).transpose()
            })
            .await?;
        Ok(record)
    }

    async fn usage_statistics(&self, user_id: UserId) -> Result<BTreeMap<String, u64>> {
        let stats = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT model, COUNT(*) FROM usage_records WHERE user_id = ?1 GROUP BY model",
                )?;
                let rows = stmt.query_map(rusqlite::params![user_id], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?;
                let mut out = BTreeMap::new();
                for row in rows {
                    let (model, count) = row?;
                    out.insert(model, i64_to_u64(count));
                }
                Ok(out)
            })
            .await?;
        Ok(stats)
    }

    async fn usage_history(&self, user_id: UserId, limit: usize) -> Result<Vec<UsageRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let records = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, model, prompt_chars, prompt_tokens, completion_tokens,
                            credits_charged, fingerprint, transaction_id, cached_from,
                            response_text, metadata_json, created_at_ms
                     FROM usage_records
                     WHERE user_id = ?1
                     ORDER BY id DESC
                     LIMIT ?2",
                )?;
                let rows = stmt.query_map(rusqlite::params![user_id, limit], read_usage)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?.decode()?);
                }
                Ok(out)
            })
            .await?;
        Ok(records)
    }
}

#[async_trait]
impl SubscriptionStore for SqliteStore {
    async fn active_subscription(
        &self,
        user_id: UserId,
        now_ms: u64,
    ) -> Result<Option<Subscription>> {
        let subscription = self
            .run(move |conn| {
                let raw = conn
                    .query_row(
                        "SELECT id, user_id, plan_code, status, start_ms, end_ms, auto_renew,
                                payment_id
                         FROM subscriptions
                         WHERE user_id = ?1 AND status = 'active' AND end_ms > ?2
                         ORDER BY id DESC
                         LIMIT 1",
                        rusqlite::params![user_id, u64_to_i64(now_ms)],
                        read_subscription,
                    )
                    .optional()?;
                raw.map(RawSubscription::decode).transpose()
            })
            .await?;
        Ok(subscription)
    }

    async fn create_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        let user_id = subscription.user_id;
        let created = self
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                tx.execute(
                    "UPDATE subscriptions SET status = 'cancelled'
                     WHERE user_id = ?1 AND status = 'active'",
                    rusqlite::params![subscription.user_id],
                )?;
                tx.execute(
                    "INSERT INTO subscriptions (
                        user_id, plan_code, status, start_ms, end_ms, auto_renew, payment_id
                     ) VALUES (?1, ?2, 'active', ?3, ?4, ?5, ?6)",
                    rusqlite::params![
                        subscription.user_id,
                        subscription.plan_code,
                        u64_to_i64(subscription.start_ms),
                        u64_to_i64(subscription.end_ms),
                        subscription.auto_renew,
                        subscription.payment_id,
                    ],
                )?;
                let id = tx.last_insert_rowid();
                tx.commit()?;
                Ok(subscription.into_subscription(id))
            })
            .await
            .map_err(|err| err.scoped_to(user_id))?;
        Ok(created)
    }

    async fn cancel_subscription(&self, user_id: UserId, id: i64) -> Result<Subscription> {
        let cancelled = self
            .run(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let updated = tx.execute(
                    "UPDATE subscriptions
                     SET status = CASE WHEN status = 'active' THEN 'cancelled' ELSE status END,
                         auto_renew = 0
                     WHERE id = ?1 AND user_id = ?2",
                    rusqlite::params![id, user_id],
                )?;
                if updated == 0 {
                    return Err(SqliteStoreError::SubscriptionNotFound { id });
                }
                let raw = tx.query_row(
                    "SELECT id, user_id, plan_code, status, start_ms, end_ms, auto_renew,
                            payment_id
                     FROM subscriptions WHERE id = ?1",
                    rusqlite::params![id],
                    read_subscription,
                )?;
                tx.commit()?;
                raw.decode()
            })
            .await
            .map_err(|err| err.scoped_to(user_id))?;
        Ok(cancelled)
    }

    async fn expire_subscriptions(&self, now_ms: u64) -> Result<u64> {
        let expired = self
            .run(move |conn| {
                let changed = conn.execute(
                    "UPDATE subscriptions SET status = 'expired'
                     WHERE status = 'active' AND end_ms <= ?1",
                    rusqlite::params![u64_to_i64(now_ms)],
                )?;
                Ok(u64::try_from(changed).unwrap_or(u64::MAX))
            })
            .await?;
        Ok(expired)
    }

    async fn subscriptions(&self, user_id: UserId) -> Result<Vec<Subscription>> {
        let subscriptions = self
            .run(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, user_id, plan_code, status, start_ms, end_ms, auto_renew,
                            payment_id
                     FROM subscriptions
                     WHERE user_id = ?1
                     ORDER BY id DESC",
                )?;
                let rows = stmt.query_map(rusqlite::params![user_id], read_subscription)?;
                let mut out = Vec::new();
                for row in rows {
                    out.push(row?.decode()?);
                }
                Ok(out)
            })
            .await?;
        Ok(subscriptions)
    }
}

fn ensure_balance(
    tx: &rusqlite::Transaction<'_>,
    user_id: UserId,
    now_ms: u64,
) -> std::result::Result<(), rusqlite::Error> {
    let now = u64_to_i64(now_ms);
    tx.execute(
        "INSERT OR IGNORE INTO balances (
            user_id, amount, lifetime_earned, lifetime_spent, last_daily_grant_at_ms,
            created_at_ms, updated_at_ms
         ) VALUES (?1, 0, 0, 0, NULL, ?2, ?2)",
        rusqlite::params![user_id, now],
    )?;
    Ok(())
}

fn load_balance(
    tx: &rusqlite::Transaction<'_>,
    user_id: UserId,
) -> std::result::Result<Balance, rusqlite::Error> {
    tx.query_row(
        "SELECT user_id, amount, lifetime_earned, lifetime_spent, last_daily_grant_at_ms,
                created_at_ms, updated_at_ms
         FROM balances WHERE user_id = ?1",
        rusqlite::params![user_id],
        |row| {
            Ok(Balance {
                user_id: row.get(0)?,
                amount: row.get(1)?,
                lifetime_earned: row.get(2)?,
                lifetime_spent: row.get(3)?,
                last_daily_grant_at_ms: row.get::<_, Option<i64>>(4)?.map(i64_to_u64),
                created_at_ms: i64_to_u64(row.get(5)?),
                updated_at_ms: i64_to_u64(row.get(6)?),
            })
        },
    )
}

fn store_balance(
    tx: &rusqlite::Transaction<'_>,
    balance: &Balance,
) -> std::result::Result<(), rusqlite::Error> {
    tx.execute(
        "UPDATE balances
         SET amount = ?2, lifetime_earned = ?3, lifetime_spent = ?4,
             last_daily_grant_at_ms = ?5, updated_at_ms = ?6
         WHERE user_id = ?1",
        rusqlite::params![
            balance.user_id,
            balance.amount,
            balance.lifetime_earned,
            balance.lifetime_spent,
            balance.last_daily_grant_at_ms.map(u64_to_i64),
            u64_to_i64(balance.updated_at_ms),
        ],
    )?;
    Ok(())
}

fn insert_transaction(
    tx: &rusqlite::Transaction<'_>,
    entry: &LedgerEntry,
    balance_after: i64,
    metadata_json: &str,
) -> std::result::Result<i64, rusqlite::Error> {
    tx.execute(
        "INSERT INTO ledger_transactions (
            user_id, delta, balance_after, kind, description, expires_at_ms, correlation_id,
            metadata_json, created_at_ms
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        rusqlite::params![
            entry.user_id,
            entry.delta,
            balance_after,
            entry.kind.as_str(),
            entry.description,
            entry.expires_at_ms.map(u64_to_i64),
            entry.correlation_id,
            metadata_json,
            u64_to_i64(entry.at_ms),
        ],
    )?;
    Ok(tx.last_insert_rowid())
}

struct RawTransaction {
    id: i64,
    user_id: i64,
    delta: i64,
    balance_after: i64,
    kind: String,
    description: String,
    expires_at_ms: Option<i64>,
    correlation_id: Option<String>,
    metadata_json: String,
    created_at_ms: i64,
}

fn read_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTransaction> {
    Ok(RawTransaction {
        id: row.get(0)?,
        user_id: row.get(1)?,
        delta: row.get(2)?,
        balance_after: row.get(3)?,
        kind: row.get(4)?,
        description: row.get(5)?,
        expires_at_ms: row.get(6)?,
        correlation_id: row.get(7)?,
        metadata_json: row.get(8)?,
        created_at_ms: row.get(9)?,
    })
}

impl RawTransaction {
    fn decode(self) -> std::result::Result<LedgerTransaction, SqliteStoreError> {
        let kind = self.kind.parse().map_err(SqliteStoreError::Corrupt)?;
        let metadata: Metadata = serde_json::from_str(&self.metadata_json)?;
        Ok(LedgerTransaction {
            id: self.id,
            user_id: self.user_id,
            delta: self.delta,
            balance_after: self.balance_after,
            kind,
            description: self.description,
            expires_at_ms: self.expires_at_ms.map(i64_to_u64),
            correlation_id: self.correlation_id,
            metadata,
            created_at_ms: i64_to_u64(self.created_at_ms),
        })
    }
}

struct RawUsage {
    id: i64,
    user_id: i64,
    model: String,
    prompt_chars: i64,
    prompt_tokens: u32,
    completion_tokens: u32,
    credits_charged: i64,
    fingerprint: String,
    transaction_id: Option<i64>,
    cached_from: Option<i64>,
    response_text: String,
    metadata_json: String,
    created_at_ms: i64,
}

fn read_usage(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawUsage> {
    Ok(RawUsage {
        id: row.get(0)?,
        user_id: row.get(1)?,
        model: row.get(2)?,
        prompt_chars: row.get(3)?,
        prompt_tokens: row.get(4)?,
        completion_tokens: row.get(5)?,
        credits_charged: row.get(6)?,
        fingerprint: row.get(7)?,
        transaction_id: row.get(8)?,
        cached_from: row.get(9)?,
        response_text: row.get(10)?,
        metadata_json: row.get(11)?,
        created_at_ms: row.get(12)?,
    })
}

impl RawUsage {
    fn decode(self) -> std::result::Result<UsageRecord, SqliteStoreError> {
        Ok(UsageRecord {
            id: self.id,
            user_id: self.user_id,
            model: self.model,
            prompt_chars: i64_to_u64(self.prompt_chars),
            prompt_tokens: self.prompt_tokens,
            completion_tokens: self.completion_tokens,
            credits_charged: self.credits_charged,
            fingerprint: self.fingerprint,
            transaction_id: self.transaction_id,
            cached_from: self.cached_from,
            response_text: self.response_text,
            metadata: serde_json::from_str(&self.metadata_json)?,
            created_at_ms: i64_to_u64(self.created_at_ms),
        })
    }
}

struct RawSubscription {
    id: i64,
    user_id: i64,
    plan_code: String,
    status: String,
    start_ms: i64,
    end_ms: i64,
    auto_renew: bool,
    payment_id: Option<String>,
}

fn read_subscription(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSubscription> {
    Ok(RawSubscription {
        id: row.get(0)?,
        user_id: row.get(1)?,
        plan_code: row.get(2)?,
        status: row.get(3)?,
        start_ms: row.get(4)?,
        end_ms: row.get(5)?,
        auto_renew: row.get(6)?,
        payment_id: row.get(7)?,
    })
}

impl RawSubscription {
    fn decode(self) -> std::result::Result<Subscription, SqliteStoreError> {
        let status: SubscriptionStatus = self.status.parse().map_err(SqliteStoreError::Corrupt)?;
        Ok(Subscription {
            id: Some(self.id),
            user_id: self.user_id,
            plan_code: self.plan_code,
            status,
            start_ms: i64_to_u64(self.start_ms),
            end_ms: i64_to_u64(self.end_ms),
            auto_renew: self.auto_renew,
            payment_id: self.payment_id,
        })
    }
}

fn init_schema(conn: &rusqlite::Connection) -> std::result::Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS balances (
            user_id INTEGER PRIMARY KEY NOT NULL,
            amount INTEGER NOT NULL DEFAULT 0 CHECK (amount >= 0),
            lifetime_earned INTEGER NOT NULL DEFAULT 0,
            lifetime_spent INTEGER NOT NULL DEFAULT 0,
            last_daily_grant_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ledger_transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            delta INTEGER NOT NULL,
            balance_after INTEGER NOT NULL,
            kind TEXT NOT NULL,
            description TEXT NOT NULL,
            expires_at_ms INTEGER,
            correlation_id TEXT,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_transactions_user_created
            ON ledger_transactions(user_id, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_ledger_transactions_expiring
            ON ledger_transactions(expires_at_ms)
            WHERE delta > 0 AND expires_at_ms IS NOT NULL;

        CREATE TABLE IF NOT EXISTS expired_grants (
            grant_id INTEGER PRIMARY KEY NOT NULL,
            user_id INTEGER NOT NULL,
            reversal_id INTEGER,
            swept_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS usage_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            prompt_chars INTEGER NOT NULL,
            prompt_tokens INTEGER NOT NULL,
            completion_tokens INTEGER NOT NULL,
            credits_charged INTEGER NOT NULL,
            fingerprint TEXT NOT NULL,
            transaction_id INTEGER,
            cached_from INTEGER,
            response_text TEXT NOT NULL,
            metadata_json TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_usage_records_fingerprint
            ON usage_records(fingerprint);
        CREATE INDEX IF NOT EXISTS idx_usage_records_user_id
            ON usage_records(user_id);

        CREATE TABLE IF NOT EXISTS response_cache (
            fingerprint TEXT PRIMARY KEY NOT NULL,
            usage_id INTEGER NOT NULL,
            updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS subscriptions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id INTEGER NOT NULL,
            plan_code TEXT NOT NULL,
            status TEXT NOT NULL,
            start_ms INTEGER NOT NULL,
            end_ms INTEGER NOT NULL,
            auto_renew INTEGER NOT NULL DEFAULT 0,
            payment_id TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_subscriptions_user_status
            ON subscriptions(user_id, status);

        CREATE TABLE IF NOT EXISTS audit_logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            kind TEXT NOT NULL,
            payload_json TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_audit_logs_ts_ms
            ON audit_logs(ts_ms);
        CREATE INDEX IF NOT EXISTS idx_audit_logs_kind_ts_ms
            ON audit_logs(kind, ts_ms);",
    )?;
    Ok(())
}

fn open_connection(
    path: &Path,
    lock_timeout: Duration,
) -> std::result::Result<rusqlite::Connection, rusqlite::Error> {
    let conn = rusqlite::Connection::open(path)?;
    conn.busy_timeout(lock_timeout)?;
    let _ = conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;");
    Ok(conn)
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(value: i64) -> u64 {
    if value <= 0 { 0 } else { value as u64 }
}

#[cfg(test)]
mod tests;
