//! Per-action fan-out: identity registration and action handling run side by side and are
//! joined before the action counts as processed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{Instrument as _, debug, error, info_span, warn};

use crate::error::{LedgerError, Result};
use crate::types::UserId;

/// One inbound message or command from a chat surface.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundAction {
    pub chat_id: i64,
    pub external_user_id: UserId,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    pub text: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Registers the user if needed and returns the ledger user id.
    async fn ensure_user(
        &self,
        external_id: UserId,
        display_name: Option<&str>,
        locale: Option<&str>,
    ) -> Result<UserId>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, chat_id: i64, text: &str) -> Result<()>;
}

#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Produces the reply for an action. Failures are already rendered into the reply text.
    async fn handle(&self, action: &InboundAction) -> String;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActionOutcome {
    pub reply_sent: bool,
    pub identity: std::result::Result<UserId, String>,
    pub elapsed: Duration,
}

pub struct Coordinator {
    identity: Arc<dyn IdentityProvider>,
    handler: Arc<dyn ActionHandler>,
    notifier: Arc<dyn Notifier>,
    identity_timeout: Duration,
}

impl Coordinator {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        handler: Arc<dyn ActionHandler>,
        notifier: Arc<dyn Notifier>,
        identity_timeout: Duration,
    ) -> Self {
        Self {
            identity,
            handler,
            notifier,
            identity_timeout,
        }
    }

    pub async fn process(&self, action: InboundAction) -> ActionOutcome {
        let started = Instant::now();
        let span = info_span!(
            "action",
            chat_id = action.chat_id,
            external_user_id = action.external_user_id
        );
        let action = Arc::new(action);

        let mut identity_task = {
            let provider = self.identity.clone();
            let action = action.clone();
            let timeout = self.identity_timeout;
            tokio::spawn(
                async move {
                    let ensure = provider.ensure_user(
                        action.external_user_id,
                        action.display_name.as_deref(),
                        action.locale.as_deref(),
                    );
                    match tokio::time::timeout(timeout, ensure).await {
                        Ok(Ok(user_id)) => Ok(user_id),
                        Ok(Err(err)) => Err(err.to_string()),
                        Err(_) => Err(LedgerError::Timeout {
                            operation: "ensure_user",
                        }
                        .to_string()),
                    }
                }
                .instrument(span.clone()),
            )
        };

        let mut handling_task = {
            let handler = self.handler.clone();
            let notifier = self.notifier.clone();
            let action = action.clone();
            tokio::spawn(
                async move {
                    let reply = handler.handle(&action).await;
                    match notifier.notify(action.chat_id, &reply).await {
                        Ok(()) => true,
                        Err(err) => {
                            warn!(error = %err, "failed to send reply");
                            false
                        }
                    }
                }
                .instrument(span.clone()),
            )
        };

        let (identity, reply_sent) = tokio::select! {
            identity = &mut identity_task => {
                let identity = identity_result(identity);
                if let Err(message) = &identity {
                    debug!(parent: &span, error = %message, "identity failed before handling finished");
                }
                let reply_sent = handling_result(handling_task.await);
                (identity, reply_sent)
            }
            handled = &mut handling_task => {
                let reply_sent = handling_result(handled);
                let identity = identity_result(identity_task.await);
                (identity, reply_sent)
            }
        };

        if let Err(message) = &identity {
            warn!(parent: &span, error = %message, "identity registration failed");
            let notice = LedgerError::Identity {
                message: message.clone(),
            }
            .user_message();
            if let Err(err) = self.notifier.notify(action.chat_id, &notice).await {
                warn!(parent: &span, error = %err, "failed to send identity notice");
            }
        }

        ActionOutcome {
            reply_sent,
            identity,
            elapsed: started.elapsed(),
        }
    }
}

fn identity_result(
    joined: std::result::Result<std::result::Result<UserId, String>, tokio::task::JoinError>,
) -> std::result::Result<UserId, String> {
    match joined {
        Ok(identity) => identity,
        Err(err) => {
            error!(error = %err, "identity task aborted");
            Err(format!("identity task aborted: {err}"))
        }
    }
}

fn handling_result(joined: std::result::Result<bool, tokio::task::JoinError>) -> bool {
    match joined {
        Ok(sent) => sent,
        Err(err) => {
            error!(error = %err, "handling task aborted");
            false
        }
    }
}
