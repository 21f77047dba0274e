mod error;

pub mod cache;
pub mod clock;
pub mod config;
pub mod costing;
pub mod entitlement;
pub mod handler;
pub mod ledger;
pub mod memory_store;
pub mod metering;
pub mod observability;
pub mod pipeline;
pub mod plans;
pub mod services;
#[cfg(feature = "store-sqlite")]
pub mod sqlite_store;
pub mod store;
pub mod subscription;
pub mod telemetry;
pub mod types;
pub mod worker;

pub use error::{LedgerError, Result};

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{CacheConfig, CacheScope, ConfigError, GatewayConfig, LedgerConfig, PipelineConfig};
pub use costing::{ModelCostConfig, ModelCostTable, ModelTier, TierCosts};
pub use entitlement::EntitlementResolver;
pub use handler::{GatewayHandler, HandlerOptions, Invocation, InvocationRequest, ModelInvoker};
pub use ledger::{CreditLedger, Grant, Spend, SweepFailure, SweepReport};
pub use memory_store::MemoryStore;
pub use metering::{Meter, MeterDecision, UsageReport, fingerprint};
pub use observability::MeterStatsSnapshot;
pub use pipeline::{
    ActionHandler, ActionOutcome, Coordinator, IdentityProvider, InboundAction, Notifier,
};
pub use plans::{CreditPackage, Plan, PlanCatalog};
pub use services::Services;
#[cfg(feature = "store-sqlite")]
pub use sqlite_store::{SqliteStore, SqliteStoreError};
pub use store::{BalanceStore, SubscriptionStore, UsageStore};
pub use subscription::{BillingPeriod, Subscription, SubscriptionStatus};
pub use types::{
    AuditLogRecord, Balance, ExpiryOutcome, LedgerEntry, LedgerTransaction, Metadata,
    NewUsageRecord, TransactionKind, UsageRecord, UserId,
};
pub use worker::{Worker, WorkerReport};
