use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::error::{LedgerError, Result};
use crate::plans::{Plan, PlanCatalog};
use crate::store::SubscriptionStore;
use crate::subscription::{BillingPeriod, NewSubscription, Subscription};
use crate::types::UserId;

/// Resolves which plan governs a user and derives plan-dependent numbers.
pub struct EntitlementResolver {
    catalog: Arc<PlanCatalog>,
    subscriptions: Arc<dyn SubscriptionStore>,
    clock: Arc<dyn Clock>,
}

impl EntitlementResolver {
    pub fn new(
        catalog: Arc<PlanCatalog>,
        subscriptions: Arc<dyn SubscriptionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            catalog,
            subscriptions,
            clock,
        }
    }

    pub fn catalog(&self) -> &PlanCatalog {
        &self.catalog
    }

    pub async fn active_subscription(&self, user_id: UserId) -> Result<Subscription> {
        let now_ms = self.clock.now_millis();
        match self.subscriptions.active_subscription(user_id, now_ms).await? {
            Some(subscription) => Ok(subscription),
            None => Ok(Subscription::synthesized(
                user_id,
                self.catalog.default_code(),
                now_ms,
            )),
        }
    }

    pub async fn resolve_plan(&self, user_id: UserId) -> Result<Plan> {
        let subscription = self.active_subscription(user_id).await?;
        let plan = self.catalog.get(&subscription.plan_code)?;
        debug!(user_id, plan = %plan.code, "resolved plan");
        Ok(plan.clone())
    }

    pub fn has_model_access(&self, plan: &Plan, model: &str) -> bool {
        plan.allows_model(model)
    }

    /// Applies the plan discount. Never returns less than one credit.
    pub fn discounted_cost(&self, plan: &Plan, base_cost: i64) -> i64 {
        let discount = base_cost.saturating_mul(i64::from(plan.discount_percent)) / 100;
        base_cost.saturating_sub(discount).max(1)
    }

    /// Number of earlier conversation messages a model call may carry.
    pub fn context_window(&self, plan: &Plan) -> usize {
        usize::try_from(plan.context_window).unwrap_or(usize::MAX)
    }

    pub fn credit_lifetime_days(&self, plan: &Plan) -> u32 {
        plan.credit_lifetime_days
    }

    pub fn check_request_size(&self, plan: &Plan, prompt: &str) -> Result<()> {
        if plan.max_request_size == 0 {
            return Ok(());
        }
        let actual = u64::try_from(prompt.chars().count()).unwrap_or(u64::MAX);
        if actual > plan.max_request_size {
            return Err(LedgerError::RequestTooLarge {
                limit: plan.max_request_size,
                actual,
            });
        }
        Ok(())
    }

    pub fn daily_credits(&self, plan: &Plan, loyalty_bonus_percent: u32) -> i64 {
        let bonus = plan
            .daily_credits
            .saturating_mul(i64::from(loyalty_bonus_percent))
            / 100;
        plan.daily_credits.saturating_add(bonus)
    }

    /// Starts a paid subscription, superseding whatever the user had before.
    pub async fn subscribe(
        &self,
        user_id: UserId,
        plan_code: &str,
        period: BillingPeriod,
        payment_id: Option<String>,
    ) -> Result<Subscription> {
        let plan = self.catalog.get(plan_code)?;
        let now_ms = self.clock.now_millis();
        let subscription = self
            .subscriptions
            .create_subscription(NewSubscription {
                user_id,
                plan_code: plan.code.clone(),
                start_ms: now_ms,
                end_ms: now_ms.saturating_add(period.duration_ms()),
                auto_renew: false,
                payment_id,
            })
            .await?;
        info!(
            user_id,
            plan = %plan.code,
            subscription_id = ?subscription.id,
            end_ms = subscription.end_ms,
            "subscription started"
        );
        Ok(subscription)
    }

    pub async fn cancel(&self, user_id: UserId, subscription_id: i64) -> Result<Subscription> {
        let subscription = self
            .subscriptions
            .cancel_subscription(user_id, subscription_id)
            .await?;
        info!(user_id, subscription_id, "subscription cancelled");
        Ok(subscription)
    }

    /// Marks subscriptions whose window has ended as expired.
    pub async fn expire_subscriptions(&self) -> Result<u64> {
        let now_ms = self.clock.now_millis();
        let expired = self.subscriptions.expire_subscriptions(now_ms).await?;
        if expired > 0 {
            info!(expired, "subscriptions expired");
        }
        Ok(expired)
    }

    pub async fn history(&self, user_id: UserId) -> Result<Vec<Subscription>> {
        self.subscriptions.subscriptions(user_id).await
    }
}
