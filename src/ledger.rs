use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::LedgerConfig;
use crate::entitlement::EntitlementResolver;
use crate::error::{LedgerError, Result};
use crate::store::BalanceStore;
use crate::subscription::Subscription;
use crate::types::{
    AuditLogRecord, Balance, DAY_MS, LedgerEntry, LedgerTransaction, Metadata, TransactionKind,
    UserId,
};

/// A credit grant request.
#[derive(Clone, Debug)]
pub struct Grant {
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub metadata: Metadata,
    pub correlation_id: Option<String>,
    /// 0 means the credits never expire.
    pub expiry_days: u32,
}

impl Grant {
    pub fn new(amount: i64, kind: TransactionKind) -> Self {
        Self {
            amount,
            kind,
            description: String::new(),
            metadata: Metadata::new(),
            correlation_id: None,
            expiry_days: 0,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn expiry_days(mut self, days: u32) -> Self {
        self.expiry_days = days;
        self
    }
}

/// A credit spend request.
#[derive(Clone, Debug)]
pub struct Spend {
    pub amount: i64,
    pub kind: TransactionKind,
    pub description: String,
    pub metadata: Metadata,
    pub correlation_id: Option<String>,
}

impl Spend {
    pub fn new(amount: i64, kind: TransactionKind) -> Self {
        Self {
            amount,
            kind,
            description: String::new(),
            metadata: Metadata::new(),
            correlation_id: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SweepReport {
    pub users_scanned: usize,
    pub users_debited: usize,
    pub grants_closed: usize,
    pub credits_expired: i64,
    pub failures: Vec<SweepFailure>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SweepFailure {
    pub user_id: UserId,
    pub error: String,
}

pub struct CreditLedger {
    store: Arc<dyn BalanceStore>,
    entitlements: Arc<EntitlementResolver>,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl CreditLedger {
    pub fn new(
        store: Arc<dyn BalanceStore>,
        entitlements: Arc<EntitlementResolver>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            store,
            entitlements,
            clock,
            config,
        }
    }

    pub fn entitlements(&self) -> &EntitlementResolver {
        &self.entitlements
    }

    pub async fn balance(&self, user_id: UserId) -> Result<Balance> {
        self.store
            .get_balance(user_id, self.clock.now_millis())
            .await
    }

    pub async fn has_enough(&self, user_id: UserId, amount: i64) -> Result<bool> {
        Ok(self.balance(user_id).await?.amount >= amount)
    }

    pub async fn history(
        &self,
        user_id: UserId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerTransaction>> {
        self.store.transactions(user_id, limit, offset).await
    }

    /// Claims the plan's daily credits. The window is enforced again inside the store lock, so
    /// two concurrent claims cannot both succeed.
    pub async fn grant_daily(
        &self,
        user_id: UserId,
        loyalty_bonus_percent: u32,
    ) -> Result<LedgerTransaction> {
        let now_ms = self.clock.now_millis();
        let window_ms = self.config.daily_grant_window_ms();

        let balance = self.store.get_balance(user_id, now_ms).await?;
        if let Some(retry_after_ms) = balance.daily_grant_wait_ms(now_ms, window_ms) {
            return Err(LedgerError::AlreadyGranted { retry_after_ms });
        }

        let plan = self.entitlements.resolve_plan(user_id).await?;
        let amount = self.entitlements.daily_credits(&plan, loyalty_bonus_percent);
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount { amount });
        }
        let expiry_days = self.entitlements.credit_lifetime_days(&plan);

        let mut metadata = Metadata::new();
        metadata.insert(
            "loyalty_bonus_percent".to_string(),
            serde_json::json!(loyalty_bonus_percent),
        );
        metadata.insert("expiry_days".to_string(), serde_json::json!(expiry_days));
        metadata.insert("plan".to_string(), serde_json::json!(plan.code));

        let entry = LedgerEntry::new(user_id, amount, TransactionKind::Daily, now_ms)
            .with_description(format!("Daily credits ({})", plan.name))
            .with_expiry(expiry_at(now_ms, expiry_days))
            .with_metadata(metadata)
            .with_daily_window(window_ms);
        self.apply(entry).await
    }

    pub async fn grant(&self, user_id: UserId, grant: Grant) -> Result<LedgerTransaction> {
        if grant.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount: grant.amount,
            });
        }
        let now_ms = self.clock.now_millis();
        let entry = LedgerEntry::new(user_id, grant.amount, grant.kind, now_ms)
            .with_description(grant.description)
            .with_expiry(expiry_at(now_ms, grant.expiry_days))
            .with_correlation_id(grant.correlation_id)
            .with_metadata(grant.metadata);
        self.apply(entry).await
    }

    pub async fn spend(&self, user_id: UserId, spend: Spend) -> Result<LedgerTransaction> {
        if spend.amount <= 0 {
            return Err(LedgerError::InvalidAmount {
                amount: spend.amount,
            });
        }
        let entry = LedgerEntry::new(
            user_id,
            spend.amount.saturating_neg(),
            spend.kind,
            self.clock.now_millis(),
        )
        .with_description(spend.description)
        .with_correlation_id(spend.correlation_id)
        .with_metadata(spend.metadata);
        self.apply(entry).await
    }

    /// Credits a purchased package using the buyer's plan lifetime.
    pub async fn purchase_package(
        &self,
        user_id: UserId,
        package_id: i64,
        payment_id: &str,
    ) -> Result<LedgerTransaction> {
        let package = self.entitlements.catalog().package(package_id)?.clone();
        let plan = self.entitlements.resolve_plan(user_id).await?;

        let mut metadata = Metadata::new();
        metadata.insert("package_id".to_string(), serde_json::json!(package.id));
        metadata.insert("amount".to_string(), serde_json::json!(package.amount));
        metadata.insert("bonus_amount".to_string(), serde_json::json!(package.bonus_amount));
        metadata.insert("price".to_string(), serde_json::json!(package.price));

        let grant = Grant::new(package.total_credits(), TransactionKind::Purchase)
            .description(format!("Purchase: {}", package.name))
            .metadata(metadata)
            .correlation_id(payment_id)
            .expiry_days(plan.credit_lifetime_days);
        self.grant(user_id, grant).await
    }

    /// Grants the plan's welcome bonus for a freshly started subscription, if it has one.
    pub async fn grant_welcome_bonus(
        &self,
        subscription: &Subscription,
    ) -> Result<Option<LedgerTransaction>> {
        let plan = self.entitlements.catalog().get(&subscription.plan_code)?;
        if plan.welcome_bonus <= 0 {
            return Ok(None);
        }
        let mut grant = Grant::new(plan.welcome_bonus, TransactionKind::Subscription)
            .description(format!("Welcome bonus ({})", plan.name))
            .expiry_days(plan.credit_lifetime_days);
        if let Some(id) = subscription.id {
            grant = grant.correlation_id(format!("subscription:{id}"));
        }
        self.grant(subscription.user_id, grant).await.map(Some)
    }

    /// Reverses every grant that expired before `now_ms` and was not swept yet.
    ///
    /// Each user is swept in its own unit; one user's failure is recorded and does not stop
    /// the others. Running it again for the same `now_ms` changes nothing.
    pub async fn sweep_expired(&self, now_ms: u64) -> Result<SweepReport> {
        let users = self.store.users_with_expired_grants(now_ms).await?;
        let mut report = SweepReport {
            users_scanned: users.len(),
            ..SweepReport::default()
        };

        for user_id in users {
            match self.store.expire_grants(user_id, now_ms).await {
                Ok(outcome) => {
                    report.grants_closed += outcome.grants_closed;
                    report.credits_expired =
                        report.credits_expired.saturating_add(outcome.debited);
                    if let Some(tx) = &outcome.transaction {
                        report.users_debited += 1;
                        info!(
                            user_id,
                            debited = outcome.debited,
                            expired_total = outcome.expired_total,
                            transaction_id = tx.id,
                            "expired credits debited"
                        );
                    }
                }
                Err(err) => {
                    warn!(user_id, error = %err, "expiry sweep failed for user");
                    report.failures.push(SweepFailure {
                        user_id,
                        error: err.to_string(),
                    });
                }
            }
        }

        info!(
            users_scanned = report.users_scanned,
            users_debited = report.users_debited,
            credits_expired = report.credits_expired,
            failures = report.failures.len(),
            "expiry sweep finished"
        );
        if report.users_scanned > 0 {
            let payload = serde_json::to_value(&report).unwrap_or_default();
            self.audit("ledger.sweep", payload).await;
        }
        Ok(report)
    }

    pub async fn audit_logs(
        &self,
        limit: usize,
        since_ts_ms: Option<u64>,
    ) -> Result<Vec<AuditLogRecord>> {
        self.store.list_audit_logs(limit, since_ts_ms).await
    }

    async fn apply(&self, entry: LedgerEntry) -> Result<LedgerTransaction> {
        let user_id = entry.user_id;
        let delta = entry.delta;
        let kind = entry.kind;
        let correlation_id = entry.correlation_id.clone();

        match self.store.apply_delta(entry).await {
            Ok(tx) => {
                info!(
                    user_id,
                    delta,
                    kind = %kind,
                    balance_after = tx.balance_after,
                    transaction_id = tx.id,
                    "ledger transaction applied"
                );
                Ok(tx)
            }
            Err(err) => {
                warn!(user_id, delta, kind = %kind, error = %err, "ledger transaction rejected");
                self.audit(
                    "ledger.rejected",
                    serde_json::json!({
                        "user_id": user_id,
                        "delta": delta,
                        "kind": kind,
                        "correlation_id": correlation_id,
                        "error": err.to_string(),
                    }),
                )
                .await;
                Err(err)
            }
        }
    }

    async fn audit(&self, kind: &str, payload: serde_json::Value) {
        let ts_ms = self.clock.now_millis();
        if let Err(err) = self.store.append_audit_log(ts_ms, kind, payload).await {
            warn!(kind, error = %err, "failed to append audit log");
        }
    }
}

fn expiry_at(now_ms: u64, days: u32) -> Option<u64> {
    (days > 0).then(|| now_ms.saturating_add(u64::from(days).saturating_mul(DAY_MS)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::clock::ManualClock;
    use crate::config::GatewayConfig;
    use crate::memory_store::MemoryStore;
    use crate::plans::CreditPackage;
    use crate::subscription::BillingPeriod;

    fn ledger_with(config: GatewayConfig) -> (Arc<ManualClock>, CreditLedger) {
        let clock = Arc::new(ManualClock::new(10 * DAY_MS));
        let store = Arc::new(MemoryStore::default());
        let entitlements = Arc::new(EntitlementResolver::new(
            Arc::new(config.plan_catalog().expect("catalog")),
            store.clone(),
            clock.clone(),
        ));
        let ledger = CreditLedger::new(store, entitlements, clock.clone(), config.ledger);
        (clock, ledger)
    }

    fn ledger() -> (Arc<ManualClock>, CreditLedger) {
        ledger_with(GatewayConfig::default())
    }

    #[tokio::test]
    async fn daily_grant_uses_plan_amount_and_lifetime() {
        let (clock, ledger) = ledger();
        let now = clock.now_millis();
        let tx = ledger.grant_daily(1, 0).await.expect("daily");
        assert_eq!(tx.delta, 5);
        assert_eq!(tx.expires_at_ms, Some(now + 3 * DAY_MS));
        assert_eq!(tx.metadata["plan"], "free");
        assert_eq!(tx.metadata["expiry_days"], 3);
    }

    #[tokio::test]
    async fn daily_grant_window_boundary() {
        let (clock, ledger) = ledger();
        ledger.grant_daily(1, 0).await.expect("first");

        clock.advance(Duration::from_secs(19 * 3600 + 59 * 60));
        let err = ledger.grant_daily(1, 0).await.expect_err("too early");
        assert!(matches!(
            err,
            LedgerError::AlreadyGranted {
                retry_after_ms: 60_000
            }
        ));

        clock.advance(Duration::from_secs(2 * 60));
        let tx = ledger.grant_daily(1, 0).await.expect("second");
        assert_eq!(tx.balance_after, 10);
    }

    #[tokio::test]
    async fn concurrent_daily_claims_grant_once() {
        let (_clock, ledger) = ledger();
        let ledger = Arc::new(ledger);
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            tasks.spawn(async move { ledger.grant_daily(1, 0).await });
        }
        let mut granted = 0;
        while let Some(result) = tasks.join_next().await {
            if result.expect("join").is_ok() {
                granted += 1;
            }
        }
        assert_eq!(granted, 1);
        assert_eq!(ledger.balance(1).await.expect("balance").amount, 5);
    }

    #[tokio::test]
    async fn grant_and_spend_reject_non_positive_amounts() {
        let (_clock, ledger) = ledger();
        let err = ledger
            .grant(1, Grant::new(0, TransactionKind::Bonus))
            .await
            .expect_err("zero grant");
        assert!(matches!(err, LedgerError::InvalidAmount { amount: 0 }));
        let err = ledger
            .spend(1, Spend::new(-4, TransactionKind::Usage))
            .await
            .expect_err("negative spend");
        assert!(matches!(err, LedgerError::InvalidAmount { amount: -4 }));
    }

    #[tokio::test]
    async fn daily_kind_grant_does_not_block_the_daily_claim() {
        let (_clock, ledger) = ledger();
        ledger
            .grant(1, Grant::new(3, TransactionKind::Daily))
            .await
            .expect("grant");
        assert_eq!(
            ledger.balance(1).await.expect("balance").last_daily_grant_at_ms,
            None
        );
        let tx = ledger.grant_daily(1, 0).await.expect("daily still claimable");
        assert_eq!(tx.balance_after, 8);
    }

    #[tokio::test]
    async fn overflowing_grant_is_invalid_amount() {
        let (_clock, ledger) = ledger();
        ledger
            .grant(1, Grant::new(1, TransactionKind::Admin))
            .await
            .expect("grant");
        let err = ledger
            .grant(1, Grant::new(i64::MAX, TransactionKind::Admin))
            .await
            .expect_err("overflow");
        assert!(matches!(
            err,
            LedgerError::InvalidAmount { amount: i64::MAX }
        ));
        assert_eq!(ledger.balance(1).await.expect("balance").amount, 1);
    }

    #[tokio::test]
    async fn audit_log_limit_zero_returns_nothing() {
        let (_clock, ledger) = ledger();
        ledger
            .spend(1, Spend::new(1, TransactionKind::Usage))
            .await
            .expect_err("overdraft");
        assert_eq!(ledger.audit_logs(10, None).await.expect("audit").len(), 1);
        assert!(ledger.audit_logs(0, None).await.expect("audit").is_empty());
    }

    #[tokio::test]
    async fn overdraft_is_rejected_and_audited() {
        let (_clock, ledger) = ledger();
        ledger
            .grant(1, Grant::new(2, TransactionKind::Promo))
            .await
            .expect("grant");
        let err = ledger
            .spend(1, Spend::new(3, TransactionKind::Usage).correlation_id("req-1"))
            .await
            .expect_err("overdraft");
        assert!(matches!(
            err,
            LedgerError::InsufficientBalance {
                required: 3,
                available: 2
            }
        ));
        assert_eq!(ledger.balance(1).await.expect("balance").amount, 2);
        assert_eq!(ledger.history(1, 10, 0).await.expect("history").len(), 1);
        assert!(!ledger.has_enough(1, 3).await.expect("check"));

        let logs = ledger.audit_logs(10, None).await.expect("audit");
        assert_eq!(logs[0].kind, "ledger.rejected");
        assert_eq!(logs[0].payload["correlation_id"], "req-1");
    }

    #[tokio::test]
    async fn zero_daily_plan_is_invalid_amount() {
        let mut config = GatewayConfig::default();
        config.plans[0].daily_credits = 0;
        let (_clock, ledger) = ledger_with(config);
        let err = ledger.grant_daily(1, 50).await.expect_err("nothing to grant");
        assert!(matches!(err, LedgerError::InvalidAmount { amount: 0 }));
    }

    #[tokio::test]
    async fn purchase_credits_amount_plus_bonus() {
        let mut config = GatewayConfig::default();
        config.packages.push(CreditPackage {
            id: 1,
            name: "Starter".to_string(),
            amount: 100,
            bonus_amount: 10,
            price: 499,
            active: true,
        });
        let (_clock, ledger) = ledger_with(config);
        let tx = ledger
            .purchase_package(1, 1, "pay-42")
            .await
            .expect("purchase");
        assert_eq!(tx.delta, 110);
        assert_eq!(tx.kind, TransactionKind::Purchase);
        assert_eq!(tx.correlation_id.as_deref(), Some("pay-42"));

        let err = ledger
            .purchase_package(1, 9, "pay-43")
            .await
            .expect_err("unknown package");
        assert!(matches!(err, LedgerError::PackageNotFound { id: 9 }));
    }

    #[tokio::test]
    async fn welcome_bonus_follows_subscription() {
        let (_clock, ledger) = ledger();
        let subscription = ledger
            .entitlements()
            .subscribe(1, "premium", BillingPeriod::Monthly, None)
            .await
            .expect("subscribe");
        let tx = ledger
            .grant_welcome_bonus(&subscription)
            .await
            .expect("bonus")
            .expect("premium has a bonus");
        assert_eq!(tx.delta, 50);
        assert_eq!(tx.kind, TransactionKind::Subscription);
        assert_eq!(
            tx.correlation_id,
            subscription.id.map(|id| format!("subscription:{id}"))
        );
    }

    #[tokio::test]
    async fn sweep_twice_equals_once() {
        let (clock, ledger) = ledger();
        ledger.grant_daily(1, 0).await.expect("daily");
        ledger.grant_daily(2, 0).await.expect("daily");
        ledger
            .spend(2, Spend::new(4, TransactionKind::Usage))
            .await
            .expect("spend");

        clock.advance(Duration::from_millis(3 * DAY_MS + 1));
        let now = clock.now_millis();
        let first = ledger.sweep_expired(now).await.expect("sweep");
        assert_eq!(first.users_scanned, 2);
        assert_eq!(first.credits_expired, 6);
        assert_eq!(first.grants_closed, 2);
        assert!(first.failures.is_empty());

        let second = ledger.sweep_expired(now).await.expect("sweep");
        assert_eq!(second, SweepReport::default());
        assert_eq!(ledger.balance(1).await.expect("balance").amount, 0);
        assert_eq!(ledger.balance(2).await.expect("balance").amount, 0);
    }
}
