use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng as _, SeedableRng as _};
use tokio::task::JoinSet;

use creditgate::{
    CreditLedger, GatewayConfig, Grant, LedgerError, LedgerTransaction, ManualClock, MemoryStore,
    Services, Spend, TransactionKind, UserId,
};

const START_MS: u64 = 1_700_000_000_000;
const USERS: UserId = 4;
const OPS_PER_USER: usize = 40;

#[derive(Clone, Copy, Debug)]
enum Op {
    Grant(i64),
    Spend(i64),
}

fn random_ops(seed: u64) -> Vec<(UserId, Op)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut ops = Vec::new();
    for user_id in 1..=USERS {
        for _ in 0..OPS_PER_USER {
            let amount = rng.gen_range(1..=15);
            let op = if rng.gen_bool(0.45) {
                Op::Grant(amount)
            } else {
                Op::Spend(amount)
            };
            ops.push((user_id, op));
        }
    }
    ops
}

async fn run_ops(ledger: Arc<CreditLedger>, ops: Vec<(UserId, Op)>) -> (usize, usize) {
    let mut tasks = JoinSet::new();
    for (user_id, op) in ops {
        let ledger = ledger.clone();
        tasks.spawn(async move {
            match op {
                Op::Grant(amount) => ledger
                    .grant(user_id, Grant::new(amount, TransactionKind::Bonus))
                    .await
                    .map(|_| true),
                Op::Spend(amount) => match ledger
                    .spend(user_id, Spend::new(amount, TransactionKind::Usage))
                    .await
                {
                    Ok(_) => Ok(true),
                    Err(LedgerError::InsufficientBalance { .. }) => Ok(false),
                    Err(err) => Err(err),
                },
            }
        });
    }

    let mut applied = 0;
    let mut rejected = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.expect("task panicked").expect("unexpected ledger error") {
            true => applied += 1,
            false => rejected += 1,
        }
    }
    (applied, rejected)
}

async fn assert_consistent(ledger: &CreditLedger) {
    for user_id in 1..=USERS {
        let balance = ledger.balance(user_id).await.expect("balance");
        let mut history: Vec<LedgerTransaction> = ledger
            .history(user_id, usize::MAX, 0)
            .await
            .expect("history");
        history.sort_by_key(|tx| tx.id);

        let mut running = 0i64;
        for tx in &history {
            running += tx.delta;
            assert!(running >= 0, "user {user_id} went negative at tx {}", tx.id);
            assert_eq!(
                tx.balance_after, running,
                "user {user_id} tx {} balance_after",
                tx.id
            );
        }
        assert_eq!(balance.amount, running, "user {user_id} final balance");

        let earned: i64 = history.iter().filter(|tx| tx.delta > 0).map(|tx| tx.delta).sum();
        let spent: i64 = history.iter().filter(|tx| tx.delta < 0).map(|tx| -tx.delta).sum();
        assert_eq!(balance.lifetime_earned, earned);
        assert_eq!(balance.lifetime_spent, spent);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn memory_store_keeps_balances_consistent_under_concurrency() {
    let services = Services::new(
        GatewayConfig::default(),
        Arc::new(MemoryStore::default()),
        Arc::new(ManualClock::new(START_MS)),
    )
    .expect("services");

    for seed in [7, 42, 1337] {
        let (applied, rejected) = run_ops(services.ledger.clone(), random_ops(seed)).await;
        assert!(applied > 0);
        assert_eq!(applied + rejected, USERS as usize * OPS_PER_USER);
    }
    assert_consistent(&services.ledger).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn rejected_spends_leave_no_trace() {
    let services = Services::new(
        GatewayConfig::default(),
        Arc::new(MemoryStore::default()),
        Arc::new(ManualClock::new(START_MS)),
    )
    .expect("services");
    let ledger = services.ledger.clone();

    ledger
        .grant(1, Grant::new(2, TransactionKind::Bonus))
        .await
        .expect("grant");
    let err = ledger
        .spend(1, Spend::new(3, TransactionKind::Usage))
        .await
        .expect_err("overdraft");
    assert!(
        matches!(
            err,
            LedgerError::InsufficientBalance {
                required: 3,
                available: 2
            }
        ),
        "{err:?}"
    );

    let balance = ledger.balance(1).await.expect("balance");
    assert_eq!(balance.amount, 2);
    assert_eq!(balance.lifetime_spent, 0);
    assert_eq!(ledger.history(1, 10, 0).await.expect("history").len(), 1);
}

#[cfg(feature = "store-sqlite")]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sqlite_store_keeps_balances_consistent_under_concurrency() {
    use creditgate::SqliteStore;

    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(SqliteStore::new(dir.path().join("ledger.sqlite")));
    store.init().await.expect("init");
    let services = Services::new(
        GatewayConfig::default(),
        store,
        Arc::new(ManualClock::new(START_MS)),
    )
    .expect("services");

    let (applied, rejected) = run_ops(services.ledger.clone(), random_ops(99)).await;
    assert_eq!(applied + rejected, USERS as usize * OPS_PER_USER);
    assert_consistent(&services.ledger).await;
}
