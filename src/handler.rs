use std::collections::{HashMap, VecDeque};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::metering::{Meter, MeterDecision, UsageReport};
use crate::pipeline::{ActionHandler, InboundAction};
use crate::plans::Plan;
use crate::types::{DAY_MS, Metadata, UserId};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub history: Vec<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub text: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

/// Calls a third-party model. Invoked at most once per charged request; never retried here.
#[async_trait]
pub trait ModelInvoker: Send + Sync {
    async fn invoke(&self, request: InvocationRequest) -> Result<Invocation>;
}

const HELP_TEXT: &str = "Available commands:\n\
/start - get started\n\
/daily - claim your daily credits\n\
/balance - your balance and plan\n\
/models - models available on your plan\n\
/plans - subscription plans\n\
/help - this message\n\n\
Send any other text to ask a model.";

const TRUNCATED_NOTICE: &str = "...\n\n(The answer was too long and has been shortened.)";

#[derive(Clone, Debug)]
pub struct HandlerOptions {
    pub preferred_models: Vec<String>,
    pub max_reply_chars: usize,
    pub invoke_timeout: Option<Duration>,
}

/// Chat-facing command set and metered generation on top of [`Meter`].
pub struct GatewayHandler {
    meter: Arc<Meter>,
    invoker: Arc<dyn ModelInvoker>,
    clock: Arc<dyn Clock>,
    options: HandlerOptions,
    /// Recent prompts and answers per user, oldest first.
    conversations: Mutex<HashMap<UserId, VecDeque<String>>>,
}

impl GatewayHandler {
    pub fn new(
        meter: Arc<Meter>,
        invoker: Arc<dyn ModelInvoker>,
        clock: Arc<dyn Clock>,
        options: HandlerOptions,
    ) -> Self {
        Self {
            meter,
            invoker,
            clock,
            options,
            conversations: Mutex::new(HashMap::new()),
        }
    }

    async fn dispatch(&self, user_id: UserId, text: &str) -> Result<String> {
        let trimmed = text.trim();
        let Some(command) = trimmed.strip_prefix('/') else {
            return self.generate(user_id, trimmed).await;
        };
        let name = command
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .split('@')
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();

        match name.as_str() {
            "start" => self.start(user_id).await,
            "help" => Ok(HELP_TEXT.to_string()),
            "balance" | "profile" => self.profile(user_id).await,
            "daily" => self.daily(user_id).await,
            "models" => self.models(user_id).await,
            "plans" | "subscribe" => Ok(self.plans()),
            _ => Ok(format!("Unknown command /{name}. See /help.")),
        }
    }

    async fn start(&self, user_id: UserId) -> Result<String> {
        let ledger = self.meter.ledger();
        let balance = ledger.balance(user_id).await?;
        let plan = ledger.entitlements().resolve_plan(user_id).await?;
        Ok(format!(
            "Welcome! You are on the {} plan with {} credits.\n\n{HELP_TEXT}",
            plan.name, balance.amount
        ))
    }

    async fn profile(&self, user_id: UserId) -> Result<String> {
        let ledger = self.meter.ledger();
        let balance = ledger.balance(user_id).await?;
        let subscription = ledger.entitlements().active_subscription(user_id).await?;
        let plan = ledger.entitlements().catalog().get(&subscription.plan_code)?;

        let mut text = format!("Plan: {}", plan.name);
        if subscription.id.is_some() {
            let days_left = subscription
                .end_ms
                .saturating_sub(self.clock.now_millis())
                / DAY_MS;
            let _ = write!(text, " ({days_left} days left)");
        }
        let _ = write!(
            text,
            "\nBalance: {} credits\nEarned: {}\nSpent: {}",
            balance.amount, balance.lifetime_earned, balance.lifetime_spent
        );
        Ok(text)
    }

    async fn daily(&self, user_id: UserId) -> Result<String> {
        let ledger = self.meter.ledger();
        let tx = ledger.grant_daily(user_id, 0).await?;
        let expiry_days = tx
            .metadata
            .get("expiry_days")
            .and_then(|value| value.as_u64())
            .unwrap_or_default();
        Ok(format!(
            "You received {} credits. Balance: {} credits.\nThese credits expire in {expiry_days} days.",
            tx.delta, tx.balance_after
        ))
    }

    async fn models(&self, user_id: UserId) -> Result<String> {
        let ledger = self.meter.ledger();
        let entitlements = ledger.entitlements();
        let plan = entitlements.resolve_plan(user_id).await?;
        let mut text = format!("Models on the {} plan:", plan.name);
        for model in &plan.allowed_models {
            let Some(pricing) = self.meter.costs().model_pricing(model) else {
                continue;
            };
            let cost = entitlements.discounted_cost(&plan, pricing.credits);
            let _ = write!(text, "\n- {model} ({}, {cost} credits)", pricing.tier);
        }
        Ok(text)
    }

    fn plans(&self) -> String {
        let catalog = self.meter.ledger().entitlements().catalog();
        let mut parts = Vec::new();
        for plan in catalog.plans() {
            let mut part = format!("{}\n", plan.name);
            if plan.price_monthly == 0 && plan.price_yearly == 0 {
                part.push_str("- Price: free\n");
            } else {
                let _ = writeln!(
                    part,
                    "- Price: {} per month or {} per year",
                    format_price(plan.price_monthly),
                    format_price(plan.price_yearly)
                );
            }
            let _ = writeln!(part, "- Daily credits: {}", plan.daily_credits);
            if plan.max_request_size == 0 {
                part.push_str("- Request length: unlimited\n");
            } else {
                let _ = writeln!(part, "- Request length: {} characters", plan.max_request_size);
            }
            if plan.discount_percent > 0 {
                let _ = writeln!(part, "- Discount on requests: {}%", plan.discount_percent);
            }
            if plan.welcome_bonus > 0 {
                let _ = writeln!(part, "- Welcome bonus: {} credits", plan.welcome_bonus);
            }
            if plan.context_window > 0 {
                let _ = writeln!(part, "- Conversation memory: {} messages", plan.context_window);
            }
            if plan.priority {
                part.push_str("- Priority processing\n");
            }
            parts.push(part);
        }
        parts.join("\n")
    }

    async fn generate(&self, user_id: UserId, prompt: &str) -> Result<String> {
        if prompt.is_empty() {
            return Ok(HELP_TEXT.to_string());
        }
        let entitlements = self.meter.ledger().entitlements();
        let plan = entitlements.resolve_plan(user_id).await?;
        let model = self.select_model(&plan)?;
        let context_window = entitlements.context_window(&plan);
        let prompt_chars = u64::try_from(prompt.chars().count()).unwrap_or(u64::MAX);
        let estimated_tokens = u32::try_from(prompt_chars.div_ceil(4)).unwrap_or(u32::MAX);

        let decision = self
            .meter
            .meter(user_id, &model, prompt, estimated_tokens)
            .await?;

        let (text, report) = match &decision {
            MeterDecision::Cached { response, .. } => (
                response.clone(),
                UsageReport {
                    prompt_tokens: estimated_tokens,
                    completion_tokens: 0,
                    response_text: response.clone(),
                    prompt_chars,
                    metadata: Metadata::new(),
                },
            ),
            MeterDecision::Charge { .. } => {
                let history = self.recent_history(user_id, context_window).await;
                let invocation = self.invoke(&model, prompt, history).await?;
                let report = UsageReport {
                    prompt_tokens: invocation.prompt_tokens,
                    completion_tokens: invocation.completion_tokens,
                    response_text: invocation.text.clone(),
                    prompt_chars,
                    metadata: Metadata::new(),
                };
                (invocation.text, report)
            }
        };

        let record = self
            .meter
            .record_usage(user_id, &model, &decision, report)
            .await?;
        debug!(user_id, usage_id = record.id, "generation served");
        if record.cached_from.is_none() {
            self.remember(user_id, context_window, prompt, &text).await;
        }

        let mut reply = truncate_reply(&text, self.options.max_reply_chars);
        let _ = write!(
            reply,
            "\n\n---\nModel: {model}\nCost: {} credits",
            record.credits_charged
        );
        if record.cached_from.is_some() {
            reply.push_str(" (from cache)");
        }
        Ok(reply)
    }

    fn select_model(&self, plan: &Plan) -> Result<String> {
        self.options
            .preferred_models
            .iter()
            .find(|model| plan.allows_model(model))
            .or_else(|| plan.allowed_models.iter().next())
            .cloned()
            .ok_or_else(|| LedgerError::ModelNotAllowed {
                model: self
                    .options
                    .preferred_models
                    .first()
                    .cloned()
                    .unwrap_or_default(),
                plan: plan.code.clone(),
            })
    }

    async fn recent_history(&self, user_id: UserId, context_window: usize) -> Vec<String> {
        let conversations = self.conversations.lock().await;
        let Some(messages) = conversations.get(&user_id) else {
            return Vec::new();
        };
        let skip = messages.len().saturating_sub(context_window);
        messages.iter().skip(skip).cloned().collect()
    }

    async fn remember(&self, user_id: UserId, context_window: usize, prompt: &str, answer: &str) {
        let mut conversations = self.conversations.lock().await;
        if context_window == 0 {
            conversations.remove(&user_id);
            return;
        }
        let messages = conversations.entry(user_id).or_default();
        messages.push_back(prompt.to_string());
        messages.push_back(answer.to_string());
        while messages.len() > context_window {
            messages.pop_front();
        }
    }

    async fn invoke(&self, model: &str, prompt: &str, history: Vec<String>) -> Result<Invocation> {
        let request = InvocationRequest {
            model: model.to_string(),
            prompt: prompt.to_string(),
            history,
            max_tokens: None,
            temperature: None,
        };
        match self.options.invoke_timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.invoker.invoke(request))
                .await
                .map_err(|_| LedgerError::Timeout {
                    operation: "model_invoke",
                })?,
            None => self.invoker.invoke(request).await,
        }
    }
}

#[async_trait]
impl ActionHandler for GatewayHandler {
    async fn handle(&self, action: &InboundAction) -> String {
        match self.dispatch(action.external_user_id, &action.text).await {
            Ok(reply) => reply,
            Err(err) => {
                if err.is_transient() {
                    warn!(user_id = action.external_user_id, error = %err, "action failed");
                } else {
                    debug!(user_id = action.external_user_id, error = %err, "action rejected");
                }
                err.user_message()
            }
        }
    }
}

fn truncate_reply(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}{TRUNCATED_NOTICE}", &text[..cut]),
        None => text.to_string(),
    }
}

fn format_price(minor_units: i64) -> String {
    format!("{}.{:02}", minor_units / 100, (minor_units % 100).abs())
}
