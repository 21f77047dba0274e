use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::{LedgerError, Result};
use crate::store::{BalanceStore, SubscriptionStore, UsageStore};
use crate::subscription::{NewSubscription, Subscription, SubscriptionStatus};
use crate::types::{
    AuditLogRecord, Balance, EXPIRE_SYSTEM_CORRELATION, ExpiryOutcome, LedgerEntry,
    LedgerTransaction, Metadata, NewUsageRecord, TransactionKind, UsageRecord, UserId,
};

#[derive(Debug)]
struct Account {
    balance: Balance,
    transactions: Vec<LedgerTransaction>,
    swept_grants: HashSet<i64>,
}

impl Account {
    fn expired_grants(&self, now_ms: u64) -> impl Iterator<Item = &LedgerTransaction> {
        self.transactions.iter().filter(move |tx| {
            tx.delta > 0
                && tx.expires_at_ms.is_some_and(|at| at < now_ms)
                && !self.swept_grants.contains(&tx.id)
        })
    }
}

#[derive(Debug, Default)]
struct UsageState {
    records: Vec<UsageRecord>,
    cache: HashMap<String, usize>,
}

/// In-process store. Each user's balance sits behind its own async mutex so mutations of one
/// user are linearized while different users proceed in parallel.
#[derive(Debug)]
pub struct MemoryStore {
    accounts: Mutex<HashMap<UserId, Arc<Mutex<Account>>>>,
    lock_timeout: Duration,
    next_transaction_id: AtomicI64,
    usage: Mutex<UsageState>,
    subscriptions: Mutex<Vec<Subscription>>,
    audit_logs: Mutex<Vec<AuditLogRecord>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl MemoryStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
            lock_timeout,
            next_transaction_id: AtomicI64::new(1),
            usage: Mutex::new(UsageState::default()),
            subscriptions: Mutex::new(Vec::new()),
            audit_logs: Mutex::new(Vec::new()),
        }
    }

    async fn account(&self, user_id: UserId, now_ms: u64) -> Arc<Mutex<Account>> {
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(user_id)
            .or_insert_with(|| {
                Arc::new(Mutex::new(Account {
                    balance: Balance::zero(user_id, now_ms),
                    transactions: Vec::new(),
                    swept_grants: HashSet::new(),
                }))
            })
            .clone()
    }

    async fn lock_account(&self, user_id: UserId, now_ms: u64) -> Result<OwnedMutexGuard<Account>> {
        let account = self.account(user_id, now_ms).await;
        tokio::time::timeout(self.lock_timeout, account.lock_owned())
            .await
            .map_err(|_| LedgerError::LockTimeout { user_id })
    }

    fn next_id(&self) -> i64 {
        self.next_transaction_id.fetch_add(1, Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceStore for MemoryStore {
    async fn get_balance(&self, user_id: UserId, now_ms: u64) -> Result<Balance> {
        let account = self.lock_account(user_id, now_ms).await?;
        Ok(account.balance.clone())
    }

    async fn apply_delta(&self, entry: LedgerEntry) -> Result<LedgerTransaction> {
        let mut account = self.lock_account(entry.user_id, entry.at_ms).await?;

        if let Some(window_ms) = entry.daily_window_ms {
            if let Some(retry_after_ms) = account.balance.daily_grant_wait_ms(entry.at_ms, window_ms)
            {
                return Err(LedgerError::AlreadyGranted { retry_after_ms });
            }
        }

        let next = account.balance.applied(
            entry.delta,
            entry.daily_window_ms.is_some(),
            entry.at_ms,
        )?;

        let transaction = entry.into_transaction(self.next_id(), next.amount);
        account.balance = next;
        account.transactions.push(transaction.clone());
        Ok(transaction)
    }

    async fn transactions(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        let account = {
            let accounts = self.accounts.lock().await;
            match accounts.get(&user_id) {
                Some(account) => account.clone(),
                None => return Ok(Vec::new()),
            }
        };
        let account = tokio::time::timeout(self.lock_timeout, account.lock())
            .await
            .map_err(|_| LedgerError::LockTimeout { user_id })?;
        Ok(account
            .transactions
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn users_with_expired_grants(&self, now_ms: u64) -> Result<Vec<UserId>> {
        let accounts: Vec<(UserId, Arc<Mutex<Account>>)> = {
            let accounts = self.accounts.lock().await;
            accounts
                .iter()
                .map(|(user_id, account)| (*user_id, account.clone()))
                .collect()
        };

        let mut users = Vec::new();
        for (user_id, account) in accounts {
            let account = tokio::time::timeout(self.lock_timeout, account.lock())
                .await
                .map_err(|_| LedgerError::LockTimeout { user_id })?;
            if account.expired_grants(now_ms).next().is_some() {
                users.push(user_id);
            }
        }
        users.sort_unstable();
        Ok(users)
    }

    async fn expire_grants(&self, user_id: UserId, now_ms: u64) -> Result<ExpiryOutcome> {
        let mut account = self.lock_account(user_id, now_ms).await?;

        let grant_ids: Vec<i64> = account.expired_grants(now_ms).map(|tx| tx.id).collect();
        let expired_total: i64 = account
            .expired_grants(now_ms)
            .fold(0i64, |acc, tx| acc.saturating_add(tx.delta));
        let debited = expired_total.min(account.balance.amount);

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
            let entry = LedgerEntry::new(user_id, -debited, TransactionKind::Admin, now_ms)
                .with_description("Expired credits")
                .with_correlation_id(Some(EXPIRE_SYSTEM_CORRELATION.to_string()))
                .with_metadata(metadata);
            let next = account.balance.applied(entry.delta, false, now_ms)?;
            let transaction = entry.into_transaction(self.next_id(), next.amount);
            account.balance = next;
            account.transactions.push(transaction.clone());
            outcome.transaction = Some(transaction);
        }

        account.swept_grants.extend(grant_ids);
        Ok(outcome)
    }

    async fn append_audit_log(
        &self,
        ts_ms: u64,
        kind: &str,
        payload: serde_json::Value,
    ) -> Result<()> {
        let mut logs = self.audit_logs.lock().await;
        let id = i64::try_from(logs.len()).unwrap_or(i64::MAX).saturating_add(1);
        logs.push(AuditLogRecord {
            id,
            ts_ms,
            kind: kind.to_string(),
            payload,
        });
        Ok(())
    }

    async fn list_audit_logs(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<AuditLogRecord>> {
        let logs = self.audit_logs.lock().await;
        Ok(logs
            .iter()
            .rev()
            .filter(|log| since_ts_ms.is_none_or(|since| log.ts_ms >= since))
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn insert_usage(&self, record: NewUsageRecord) -> Result<UsageRecord> {
        let mut usage = self.usage.lock().await;
        let id = i64::try_from(usage.records.len())
            .unwrap_or(i64::MAX)
            .saturating_add(1);
        let record = record.into_record(id);
        let index = usage.records.len();
        if record.cached_from.is_none() {
            usage.cache.insert(record.fingerprint.clone(), index);
        }
        usage.records.push(record.clone());
        Ok(record)
    }

    async fn cached_usage(
        &self,
        fingerprint: &str,
        not_before_ms: Option<u64>,
    ) -> Result<Option<UsageRecord>> {
        let usage = self.usage.lock().await;
        Ok(usage
            .cache
            .get(fingerprint)
            .and_then(|idx| usage.records.get(*idx))
            .filter(|record| not_before_ms.is_none_or(|at| record.created_at_ms >= at))
            .cloned())
    }

    async fn usage_statistics(&self, user_id: UserId) -> Result<BTreeMap<String, u64>> {
        let usage = self.usage.lock().await;
        let mut stats = BTreeMap::new();
        for record in usage.records.iter().filter(|r| r.user_id == user_id) {
            *stats.entry(record.model.clone()).or_insert(0) += 1;
        }
        Ok(stats)
    }

    async fn usage_history(&self, user_id: UserId, limit: usize) -> Result<Vec<UsageRecord>> {
        let usage = self.usage.lock().await;
        Ok(usage
            .records
            .iter()
            .rev()
            .filter(|r| r.user_id == user_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SubscriptionStore for MemoryStore {
    async fn active_subscription(
        &self,
        user_id: UserId,
        now_ms: u64,
    ) -> Result<Option<Subscription>> {
        let subscriptions = self.subscriptions.lock().await;
        Ok(subscriptions
            .iter()
            .rev()
            .find(|sub| sub.user_id == user_id && sub.is_active_at(now_ms))
            .cloned())
    }

    async fn create_subscription(&self, subscription: NewSubscription) -> Result<Subscription> {
        let mut subscriptions = self.subscriptions.lock().await;
        for existing in subscriptions.iter_mut().filter(|sub| {
            sub.user_id == subscription.user_id && sub.status == SubscriptionStatus::Active
        }) {
            existing.status = SubscriptionStatus::Cancelled;
        }
        let id = i64::try_from(subscriptions.len())
            .unwrap_or(i64::MAX)
            .saturating_add(1);
        let created = subscription.into_subscription(id);
        subscriptions.push(created.clone());
        Ok(created)
    }

    async fn cancel_subscription(&self, user_id: UserId, id: i64) -> Result<Subscription> {
        let mut subscriptions = self.subscriptions.lock().await;
        let sub = subscriptions
            .iter_mut()
            .find(|sub| sub.id == Some(id) && sub.user_id == user_id)
            .ok_or(LedgerError::SubscriptionNotFound { id })?;
        if sub.status == SubscriptionStatus::Active {
            sub.status = SubscriptionStatus::Cancelled;
        }
        sub.auto_renew = false;
        Ok(sub.clone())
    }

    async fn expire_subscriptions(&self, now_ms: u64) -> Result<u64> {
        let mut subscriptions = self.subscriptions.lock().await;
        let mut expired = 0u64;
        for sub in subscriptions
            .iter_mut()
            .filter(|sub| sub.status == SubscriptionStatus::Active && sub.end_ms <= now_ms)
        {
            sub.status = SubscriptionStatus::Expired;
            expired += 1;
        }
        Ok(expired)
    }

    async fn subscriptions(&self, user_id: UserId) -> Result<Vec<Subscription>> {
        let subscriptions = self.subscriptions.lock().await;
        Ok(subscriptions
            .iter()
            .rev()
            .filter(|sub| sub.user_id == user_id)
            .cloned()
            .collect())
    }
}
