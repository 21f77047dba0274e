use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{ConfigError, GatewayConfig};
use crate::entitlement::EntitlementResolver;
use crate::handler::{GatewayHandler, HandlerOptions, ModelInvoker};
use crate::ledger::CreditLedger;
use crate::metering::Meter;
use crate::pipeline::{Coordinator, IdentityProvider, Notifier};
use crate::store::{BalanceStore, SubscriptionStore, UsageStore};

/// The ledger services wired over one store.
#[derive(Clone)]
pub struct Services {
    pub config: GatewayConfig,
    pub entitlements: Arc<EntitlementResolver>,
    pub ledger: Arc<CreditLedger>,
    pub meter: Arc<Meter>,
    pub clock: Arc<dyn Clock>,
}

impl Services {
    pub fn new<S>(config: GatewayConfig, store: Arc<S>, clock: Arc<dyn Clock>) -> Result<Self, ConfigError>
    where
        S: BalanceStore + UsageStore + SubscriptionStore + 'static,
    {
        config.validate()?;
        let catalog = Arc::new(config.plan_catalog()?);
        let costs = Arc::new(config.cost_table()?);

        let entitlements = Arc::new(EntitlementResolver::new(
            catalog,
            store.clone(),
            clock.clone(),
        ));
        let ledger = Arc::new(CreditLedger::new(
            store.clone(),
            entitlements.clone(),
            clock.clone(),
            config.ledger.clone(),
        ));
        let meter = Arc::new(Meter::new(
            ledger.clone(),
            store,
            costs,
            clock.clone(),
            config.cache.clone(),
        ));

        Ok(Self {
            config,
            entitlements,
            ledger,
            meter,
            clock,
        })
    }

    pub fn handler(&self, invoker: Arc<dyn ModelInvoker>) -> GatewayHandler {
        let pipeline = &self.config.pipeline;
        GatewayHandler::new(
            self.meter.clone(),
            invoker,
            self.clock.clone(),
            HandlerOptions {
                preferred_models: pipeline.preferred_models.clone(),
                max_reply_chars: pipeline.max_reply_chars,
                invoke_timeout: pipeline.invoke_timeout(),
            },
        )
    }

    pub fn coordinator(
        &self,
        identity: Arc<dyn IdentityProvider>,
        invoker: Arc<dyn ModelInvoker>,
        notifier: Arc<dyn Notifier>,
    ) -> Coordinator {
        Coordinator::new(
            identity,
            Arc::new(self.handler(invoker)),
            notifier,
            self.config.pipeline.identity_timeout(),
        )
    }
}
