use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use creditgate::{
    ActionHandler, Coordinator, GatewayConfig, IdentityProvider, InboundAction, Invocation,
    InvocationRequest, LedgerError, ManualClock, MemoryStore, ModelInvoker, Notifier, Result,
    Services, TransactionKind, UserId, Worker,
};

const START_MS: u64 = 1_700_000_000_000;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn action(chat_id: i64, user_id: UserId, text: &str) -> InboundAction {
    InboundAction {
        chat_id,
        external_user_id: user_id,
        display_name: Some("tester".to_string()),
        locale: Some("en".to_string()),
        text: text.to_string(),
    }
}

struct StubIdentity {
    delay: Duration,
    fail: bool,
}

#[async_trait]
impl IdentityProvider for StubIdentity {
    async fn ensure_user(
        &self,
        external_id: UserId,
        _display_name: Option<&str>,
        _locale: Option<&str>,
    ) -> Result<UserId> {
        tokio::time::sleep(self.delay).await;
        if self.fail {
            return Err(LedgerError::Identity {
                message: "registry offline".to_string(),
            });
        }
        Ok(external_id)
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<(i64, String)>>,
    fail: bool,
}

impl RecordingNotifier {
    fn messages(&self) -> Vec<String> {
        lock(&self.sent).iter().map(|(_, text)| text.clone()).collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<()> {
        if self.fail {
            return Err(LedgerError::StoreUnavailable {
                message: "chat api down".to_string(),
            });
        }
        lock(&self.sent).push((chat_id, text.to_string()));
        Ok(())
    }
}

/// Replies after a delay and tracks how many replies are being produced at once.
#[derive(Default)]
struct SlowHandler {
    delay: Duration,
    active: AtomicUsize,
    peak: AtomicUsize,
}

#[async_trait]
impl ActionHandler for SlowHandler {
    async fn handle(&self, action: &InboundAction) -> String {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        format!("reply to {}", action.text)
    }
}

#[derive(Default)]
struct StubInvoker {
    calls: AtomicUsize,
    histories: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ModelInvoker for StubInvoker {
    async fn invoke(&self, request: InvocationRequest) -> Result<Invocation> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.histories).push(request.history.clone());
        Ok(Invocation {
            text: format!("stub answer to {}", request.prompt),
            prompt_tokens: 4,
            completion_tokens: 6,
        })
    }
}

fn coordinator(
    identity: StubIdentity,
    handler: Arc<SlowHandler>,
    notifier: Arc<RecordingNotifier>,
    identity_timeout: Duration,
) -> Coordinator {
    Coordinator::new(Arc::new(identity), handler, notifier, identity_timeout)
}

#[tokio::test]
async fn identity_failure_notice_follows_the_reply_when_identity_fails_first() {
    let notifier = Arc::new(RecordingNotifier::default());
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_millis(50),
        ..SlowHandler::default()
    });
    let coordinator = coordinator(
        StubIdentity {
            delay: Duration::ZERO,
            fail: true,
        },
        handler,
        notifier.clone(),
        Duration::from_secs(1),
    );

    let outcome = coordinator.process(action(10, 1, "hi")).await;
    assert!(outcome.reply_sent);
    assert!(outcome.identity.expect_err("identity failed").contains("registry offline"));

    let messages = notifier.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], "reply to hi");
    assert_eq!(
        messages[1],
        LedgerError::Identity {
            message: String::new()
        }
        .user_message()
    );
}

#[tokio::test]
async fn slow_identity_times_out_without_blocking_the_reply() {
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = coordinator(
        StubIdentity {
            delay: Duration::from_secs(5),
            fail: false,
        },
        Arc::new(SlowHandler::default()),
        notifier.clone(),
        Duration::from_millis(20),
    );

    let outcome = coordinator.process(action(11, 2, "ping")).await;
    assert!(outcome.reply_sent);
    assert!(outcome.identity.expect_err("timed out").contains("ensure_user"));
    assert!(outcome.elapsed < Duration::from_secs(5));

    let messages = notifier.messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], "reply to ping");
}

#[tokio::test]
async fn successful_identity_sends_only_the_reply() {
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = coordinator(
        StubIdentity {
            delay: Duration::from_millis(30),
            fail: false,
        },
        Arc::new(SlowHandler::default()),
        notifier.clone(),
        Duration::from_secs(1),
    );

    let outcome = coordinator.process(action(12, 7, "hello")).await;
    assert_eq!(outcome.identity, Ok(7));
    assert!(outcome.reply_sent);
    assert_eq!(notifier.messages(), vec!["reply to hello".to_string()]);
}

#[tokio::test]
async fn failed_delivery_is_reported_in_the_outcome() {
    let notifier = Arc::new(RecordingNotifier {
        fail: true,
        ..RecordingNotifier::default()
    });
    let coordinator = coordinator(
        StubIdentity {
            delay: Duration::ZERO,
            fail: false,
        },
        Arc::new(SlowHandler::default()),
        notifier,
        Duration::from_secs(1),
    );

    let outcome = coordinator.process(action(13, 3, "hello")).await;
    assert!(!outcome.reply_sent);
    assert_eq!(outcome.identity, Ok(3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_bounds_in_flight_actions() {
    let notifier = Arc::new(RecordingNotifier::default());
    let handler = Arc::new(SlowHandler {
        delay: Duration::from_millis(20),
        ..SlowHandler::default()
    });
    let coordinator = Arc::new(coordinator(
        StubIdentity {
            delay: Duration::ZERO,
            fail: false,
        },
        handler.clone(),
        notifier.clone(),
        Duration::from_secs(1),
    ));

    let (tx, rx) = mpsc::channel(64);
    for n in 0..20 {
        tx.send(action(n, n, &format!("message {n}")))
            .await
            .expect("queue");
    }
    drop(tx);

    let report = Worker::new(coordinator, 3).run(rx).await;
    assert_eq!(report.processed, 20);
    assert_eq!(report.replies_failed, 0);
    assert_eq!(report.identity_failed, 0);
    assert_eq!(report.aborted, 0);
    assert!(handler.peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(notifier.messages().len(), 20);
}

#[tokio::test]
async fn cancelled_worker_stops_taking_actions() {
    let coordinator = Arc::new(coordinator(
        StubIdentity {
            delay: Duration::ZERO,
            fail: false,
        },
        Arc::new(SlowHandler::default()),
        Arc::new(RecordingNotifier::default()),
        Duration::from_secs(1),
    ));
    let worker = Worker::new(coordinator, 2);
    worker.shutdown_token().cancel();

    let (tx, rx) = mpsc::channel(4);
    tx.send(action(1, 1, "never handled")).await.expect("queue");
    let report = tokio::time::timeout(Duration::from_secs(1), worker.run(rx))
        .await
        .expect("worker exits promptly");
    assert_eq!(report.processed, 0);
}

#[tokio::test]
async fn gateway_handler_serves_commands_and_metered_prompts() {
    let services = Services::new(
        GatewayConfig::default(),
        Arc::new(MemoryStore::default()),
        Arc::new(ManualClock::new(START_MS)),
    )
    .expect("services");
    let invoker = Arc::new(StubInvoker::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = services.coordinator(
        Arc::new(StubIdentity {
            delay: Duration::ZERO,
            fail: false,
        }),
        invoker.clone(),
        notifier.clone(),
    );

    for text in ["/start", "/daily", "hello", "hello", "/balance", "/models", "/frobnicate"] {
        let outcome = coordinator.process(action(100, 5, text)).await;
        assert!(outcome.reply_sent, "{text}");
    }
    // A user with no credits asking something nobody asked before.
    coordinator
        .process(action(101, 6, "an entirely new question"))
        .await;

    let messages = notifier.messages();
    assert_eq!(messages.len(), 8);
    assert!(messages[0].starts_with("Welcome!"), "{}", messages[0]);
    assert!(messages[1].contains("You received 5 credits"), "{}", messages[1]);
    assert!(messages[2].starts_with("stub answer to hello"), "{}", messages[2]);
    assert!(messages[2].contains("Model: gpt-3.5-turbo\nCost: 1 credits"));
    assert!(messages[3].ends_with("(from cache)"), "{}", messages[3]);
    assert!(messages[4].contains("Balance: 4 credits"), "{}", messages[4]);
    assert!(messages[5].contains("gpt-3.5-turbo"), "{}", messages[5]);
    assert!(!messages[5].contains("gpt-4o"), "{}", messages[5]);
    assert!(messages[6].starts_with("Unknown command /frobnicate"));
    assert!(messages[7].starts_with("Not enough credits"), "{}", messages[7]);

    assert_eq!(invoker.calls.load(Ordering::SeqCst), 1);
    assert_eq!(services.ledger.balance(5).await.expect("balance").amount, 4);
}

#[tokio::test]
async fn conversation_history_is_capped_by_the_plan_context_window() {
    let services = Services::new(
        GatewayConfig::default(),
        Arc::new(MemoryStore::default()),
        Arc::new(ManualClock::new(START_MS)),
    )
    .expect("services");
    services
        .ledger
        .grant(9, creditgate::Grant::new(10, TransactionKind::Admin))
        .await
        .expect("grant");
    let invoker = Arc::new(StubInvoker::default());
    let coordinator = services.coordinator(
        Arc::new(StubIdentity {
            delay: Duration::ZERO,
            fail: false,
        }),
        invoker.clone(),
        Arc::new(RecordingNotifier::default()),
    );

    for prompt in ["one", "two", "three", "four"] {
        coordinator.process(action(200, 9, prompt)).await;
    }

    let histories = lock(&invoker.histories).clone();
    assert_eq!(histories.len(), 4);
    assert!(histories[0].is_empty());
    assert_eq!(histories[1], vec!["one", "stub answer to one"]);
    // The free plan keeps five messages.
    assert_eq!(
        histories[3],
        vec![
            "stub answer to one",
            "two",
            "stub answer to two",
            "three",
            "stub answer to three",
        ]
    );
}
