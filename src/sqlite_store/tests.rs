use super::*;
use crate::types::HOUR_MS;

async fn open_store() -> (tempfile::TempDir, SqliteStore) {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStore::new(dir.path().join("ledger.sqlite"));
    store.init().await.expect("init");
    (dir, store)
}

fn usage(user_id: UserId, fingerprint: &str, cached_from: Option<i64>, at: u64) -> NewUsageRecord {
    NewUsageRecord {
        user_id,
        model: "gpt-3.5-turbo".to_string(),
        prompt_chars: 11,
        prompt_tokens: 3,
        completion_tokens: 7,
        credits_charged: if cached_from.is_some() { 0 } else { 1 },
        fingerprint: fingerprint.to_string(),
        transaction_id: None,
        cached_from,
        response_text: "hello there".to_string(),
        metadata: Metadata::new(),
        created_at_ms: at,
    }
}

#[tokio::test]
async fn sqlite_store_creates_balance_lazily() {
    let (_dir, store) = open_store().await;
    let balance = store.get_balance(42, 1_000).await.expect("balance");
    assert_eq!(balance, Balance::zero(42, 1_000));

    let again = store.get_balance(42, 2_000).await.expect("balance");
    assert_eq!(again.created_at_ms, 1_000);
}

#[tokio::test]
async fn sqlite_store_applies_deltas_and_keeps_history_newest_first() {
    let (_dir, store) = open_store().await;
    let mut metadata = Metadata::new();
    metadata.insert("plan".to_string(), serde_json::json!("free"));
    let grant = store
        .apply_delta(
            LedgerEntry::new(1, 5, TransactionKind::Daily, 100)
                .with_description("Daily credits")
                .with_expiry(Some(100 + 3 * 24 * HOUR_MS))
                .with_metadata(metadata.clone()),
        )
        .await
        .expect("grant");
    assert_eq!(grant.balance_after, 5);

    let spend = store
        .apply_delta(
            LedgerEntry::new(1, -2, TransactionKind::Usage, 200)
                .with_correlation_id(Some("usage:1".to_string())),
        )
        .await
        .expect("spend");
    assert_eq!(spend.balance_after, 3);

    let history = store.transactions(1, 10, 0).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, spend.id);
    assert_eq!(history[1].metadata, metadata);
    assert_eq!(history[1].kind, TransactionKind::Daily);

    let page = store.transactions(1, 1, 1).await.expect("page");
    assert_eq!(page[0].id, grant.id);

    let balance = store.get_balance(1, 300).await.expect("balance");
    assert_eq!(balance.amount, 3);
    assert_eq!(balance.lifetime_earned, 5);
    assert_eq!(balance.lifetime_spent, 2);
    assert_eq!(balance.last_daily_grant_at_ms, Some(100));
}

#[tokio::test]
async fn sqlite_store_rejects_overdraft_without_writing() {
    let (_dir, store) = open_store().await;
    store
        .apply_delta(LedgerEntry::new(1, 2, TransactionKind::Bonus, 0))
        .await
        .expect("grant");
    let err = store
        .apply_delta(LedgerEntry::new(1, -3, TransactionKind::Usage, 1))
        .await
        .expect_err("overdraft");
    assert!(matches!(
        err,
        LedgerError::InsufficientBalance {
            required: 3,
            available: 2
        }
    ));
    assert_eq!(store.transactions(1, 10, 0).await.expect("history").len(), 1);
    assert_eq!(store.get_balance(1, 2).await.expect("balance").amount, 2);
}

#[tokio::test]
async fn sqlite_store_daily_window_guard() {
    let (_dir, store) = open_store().await;
    let entry = |at_ms| {
        LedgerEntry::new(9, 5, TransactionKind::Daily, at_ms).with_daily_window(20 * HOUR_MS)
    };
    store.apply_delta(entry(0)).await.expect("claim");
    let err = store
        .apply_delta(entry(20 * HOUR_MS - 60_000))
        .await
        .expect_err("too early");
    assert!(matches!(
        err,
        LedgerError::AlreadyGranted {
            retry_after_ms: 60_000
        }
    ));
    store
        .apply_delta(entry(20 * HOUR_MS + 60_000))
        .await
        .expect("claim after window");
}

#[tokio::test]
async fn sqlite_store_busy_writer_maps_to_lock_timeout() {
    let (dir, store) = open_store().await;
    let store = store.with_lock_timeout(Duration::from_millis(50));

    let mut blocker =
        rusqlite::Connection::open(dir.path().join("ledger.sqlite")).expect("open blocker");
    let held = blocker
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .expect("hold write lock");

    let err = store
        .apply_delta(LedgerEntry::new(3, 1, TransactionKind::Bonus, 0))
        .await
        .expect_err("locked");
    assert!(matches!(err, LedgerError::LockTimeout { user_id: 3 }));
    assert!(err.is_transient());

    held.rollback().expect("release");
    store
        .apply_delta(LedgerEntry::new(3, 1, TransactionKind::Bonus, 0))
        .await
        .expect("grant after release");
}

#[tokio::test]
async fn sqlite_store_sweep_is_idempotent() {
    let (_dir, store) = open_store().await;
    store
        .apply_delta(LedgerEntry::new(1, 5, TransactionKind::Daily, 0).with_expiry(Some(1_000)))
        .await
        .expect("grant");
    store
        .apply_delta(LedgerEntry::new(1, 4, TransactionKind::Bonus, 0).with_expiry(Some(5_000)))
        .await
        .expect("grant");
    store
        .apply_delta(LedgerEntry::new(2, 3, TransactionKind::Purchase, 0))
        .await
        .expect("grant without expiry");

    assert_eq!(
        store.users_with_expired_grants(2_000).await.expect("scan"),
        vec![1]
    );
    let outcome = store.expire_grants(1, 2_000).await.expect("sweep");
    assert_eq!(outcome.grants_closed, 1);
    assert_eq!(outcome.debited, 5);
    let tx = outcome.transaction.expect("debit");
    assert_eq!(tx.kind, TransactionKind::Admin);
    assert_eq!(tx.balance_after, 4);

    let again = store.expire_grants(1, 2_000).await.expect("sweep");
    assert_eq!(again.grants_closed, 0);
    assert!(again.transaction.is_none());
    assert!(store.users_with_expired_grants(2_000).await.expect("scan").is_empty());

    let balance = store.get_balance(1, 2_000).await.expect("balance");
    assert_eq!(balance.amount, 4);
    assert_eq!(balance.lifetime_spent, 5);
}

#[tokio::test]
async fn sqlite_store_sweep_marks_grants_even_when_nothing_is_left() {
    let (_dir, store) = open_store().await;
    store
        .apply_delta(LedgerEntry::new(1, 5, TransactionKind::Daily, 0).with_expiry(Some(1_000)))
        .await
        .expect("grant");
    store
        .apply_delta(LedgerEntry::new(1, -5, TransactionKind::Usage, 10))
        .await
        .expect("spend");

    let outcome = store.expire_grants(1, 2_000).await.expect("sweep");
    assert_eq!(outcome.grants_closed, 1);
    assert_eq!(outcome.debited, 0);
    assert!(outcome.transaction.is_none());
    assert!(store.users_with_expired_grants(2_000).await.expect("scan").is_empty());
}

#[tokio::test]
async fn sqlite_store_cache_points_at_latest_origin_record() {
    let (_dir, store) = open_store().await;
    let first = store
        .insert_usage(usage(1, "fp-1", None, 100))
        .await
        .expect("insert");
    let hit = store
        .insert_usage(usage(2, "fp-1", Some(first.id), 200))
        .await
        .expect("insert hit");
    assert_eq!(hit.cached_from, Some(first.id));

    let cached = store.cached_usage("fp-1", None).await.expect("lookup");
    assert_eq!(cached.map(|r| r.id), Some(first.id));

    let fresh = store
        .insert_usage(usage(1, "fp-1", None, 300))
        .await
        .expect("insert");
    let cached = store.cached_usage("fp-1", None).await.expect("lookup");
    assert_eq!(cached.map(|r| r.id), Some(fresh.id));

    assert!(store.cached_usage("fp-1", Some(301)).await.expect("lookup").is_none());
    assert!(store.cached_usage("fp-2", None).await.expect("lookup").is_none());

    let stats = store.usage_statistics(1).await.expect("stats");
    assert_eq!(stats.get("gpt-3.5-turbo"), Some(&2));
    let history = store.usage_history(1, 10).await.expect("history");
    assert_eq!(history[0].id, fresh.id);
}

#[tokio::test]
async fn sqlite_store_subscriptions_keep_one_active() {
    let (_dir, store) = open_store().await;
    let new = |plan: &str, end_ms| NewSubscription {
        user_id: 7,
        plan_code: plan.to_string(),
        start_ms: 0,
        end_ms,
        auto_renew: true,
        payment_id: Some(format!("pay-{plan}")),
    };
    let first = store
        .create_subscription(new("premium", 1_000))
        .await
        .expect("subscribe");
    let second = store
        .create_subscription(new("pro", 2_000))
        .await
        .expect("subscribe");

    let active = store
        .active_subscription(7, 10)
        .await
        .expect("active")
        .expect("some");
    assert_eq!(active.id, second.id);

    let history = store.subscriptions(7).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].id, first.id);
    assert_eq!(history[1].status, SubscriptionStatus::Cancelled);

    let err = store
        .cancel_subscription(8, second.id.expect("id"))
        .await
        .expect_err("other user");
    assert!(matches!(err, LedgerError::SubscriptionNotFound { .. }));

    assert_eq!(store.expire_subscriptions(2_000).await.expect("expire"), 1);
    assert!(store.active_subscription(7, 10).await.expect("active").is_none());
}

#[tokio::test]
async fn sqlite_store_appends_audit_logs() {
    let (_dir, store) = open_store().await;
    store
        .append_audit_log(10, "ledger.rejected", serde_json::json!({"user_id": 1}))
        .await
        .expect("append");
    store
        .append_audit_log(20, "ledger.sweep", serde_json::json!({"users": 0}))
        .await
        .expect("append");

    let logs = store.list_audit_logs(10, None).await.expect("list");
    assert_eq!(logs.len(), 2);
    assert_eq!(logs[0].kind, "ledger.sweep");

    let recent = store.list_audit_logs(10, Some(15)).await.expect("list");
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].payload["users"], 0);
}
