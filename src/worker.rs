use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::pipeline::{ActionOutcome, Coordinator, InboundAction};

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WorkerReport {
    pub processed: u64,
    pub replies_failed: u64,
    pub identity_failed: u64,
    pub aborted: u64,
}

impl WorkerReport {
    fn record(&mut self, outcome: &ActionOutcome) {
        self.processed += 1;
        if !outcome.reply_sent {
            self.replies_failed += 1;
        }
        if outcome.identity.is_err() {
            self.identity_failed += 1;
        }
    }
}

/// Pulls actions from a queue and runs each through the coordinator, at most `max_in_flight`
/// at a time.
pub struct Worker {
    coordinator: Arc<Coordinator>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(coordinator: Arc<Coordinator>, max_in_flight: usize) -> Self {
        Self {
            coordinator,
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            shutdown: CancellationToken::new(),
        }
    }

    /// Cancelling the token stops intake; actions already started run to completion.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Runs until the channel closes or shutdown is requested, then drains in-flight actions.
    pub async fn run(self, mut actions: mpsc::Receiver<InboundAction>) -> WorkerReport {
        let mut report = WorkerReport::default();
        let mut tasks: JoinSet<ActionOutcome> = JoinSet::new();

        loop {
            let permit = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                permit = self.permits.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let action = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                action = actions.recv() => match action {
                    Some(action) => action,
                    None => break,
                },
            };

            debug!(chat_id = action.chat_id, "action accepted");
            let coordinator = self.coordinator.clone();
            tasks.spawn(async move {
                let _permit = permit;
                coordinator.process(action).await
            });

            while let Some(joined) = tasks.try_join_next() {
                collect(&mut report, joined);
            }
        }

        while let Some(joined) = tasks.join_next().await {
            collect(&mut report, joined);
        }
        info!(
            processed = report.processed,
            replies_failed = report.replies_failed,
            identity_failed = report.identity_failed,
            aborted = report.aborted,
            "worker stopped"
        );
        report
    }
}

fn collect(
    report: &mut WorkerReport,
    joined: Result<ActionOutcome, tokio::task::JoinError>,
) {
    match joined {
        Ok(outcome) => report.record(&outcome),
        Err(err) => {
            error!(error = %err, "action task aborted");
            report.aborted += 1;
        }
    }
}
