use std::collections::BTreeSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::costing::{CostTableError, ModelCostConfig, ModelCostTable};
use crate::plans::{CreditPackage, Plan, PlanCatalog};
use crate::types::HOUR_MS;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config file failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse toml config failed: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("parse json config failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<CostTableError> for ConfigError {
    fn from(err: CostTableError) -> Self {
        Self::Invalid(err.to_string())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub costs: ModelCostConfig,
    #[serde(default = "default_plan_code")]
    pub default_plan: String,
    #[serde(default = "default_plans")]
    pub plans: Vec<Plan>,
    #[serde(default)]
    pub packages: Vec<CreditPackage>,
}

fn default_plan_code() -> String {
    "free".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            cache: CacheConfig::default(),
            pipeline: PipelineConfig::default(),
            costs: ModelCostConfig::default(),
            default_plan: default_plan_code(),
            plans: default_plans(),
            packages: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LedgerConfig {
    #[serde(default = "default_daily_grant_window_hours")]
    pub daily_grant_window_hours: u64,
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_daily_grant_window_hours() -> u64 {
    20
}

fn default_lock_timeout_ms() -> u64 {
    5_000
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            daily_grant_window_hours: default_daily_grant_window_hours(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl LedgerConfig {
    pub fn daily_grant_window_ms(&self) -> u64 {
        self.daily_grant_window_hours.saturating_mul(HOUR_MS)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

/// Whether cached responses are shared between users.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheScope {
    #[default]
    Global,
    PerUser,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: CacheScope,
    /// Lifetime of entries in the in-process cache. `None` keeps them until evicted.
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,
    #[serde(default = "default_lookup_timeout_ms")]
    pub lookup_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_max_entries() -> usize {
    1024
}

fn default_lookup_timeout_ms() -> u64 {
    1_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scope: CacheScope::Global,
            ttl_seconds: None,
            max_entries: default_max_entries(),
            lookup_timeout_ms: default_lookup_timeout_ms(),
        }
    }
}

impl CacheConfig {
    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    #[serde(default = "default_identity_timeout_ms")]
    pub identity_timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Models tried in order for free-text requests; the first one the plan allows wins.
    #[serde(default = "default_preferred_models")]
    pub preferred_models: Vec<String>,
    #[serde(default = "default_max_reply_chars")]
    pub max_reply_chars: usize,
    #[serde(default)]
    pub invoke_timeout_ms: Option<u64>,
}

fn default_identity_timeout_ms() -> u64 {
    2_000
}

fn default_max_in_flight() -> usize {
    32
}

fn default_preferred_models() -> Vec<String> {
    vec![
        "gpt-4o".to_string(),
        "claude-3-sonnet-20240229".to_string(),
        "gpt-3.5-turbo".to_string(),
    ]
}

fn default_max_reply_chars() -> usize {
    4_000
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            identity_timeout_ms: default_identity_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            preferred_models: default_preferred_models(),
            max_reply_chars: default_max_reply_chars(),
            invoke_timeout_ms: None,
        }
    }
}

impl PipelineConfig {
    pub fn identity_timeout(&self) -> Duration {
        Duration::from_millis(self.identity_timeout_ms)
    }

    pub fn invoke_timeout(&self) -> Option<Duration> {
        self.invoke_timeout_ms.map(Duration::from_millis)
    }
}

fn default_plans() -> Vec<Plan> {
    let models = |names: &[&str]| -> BTreeSet<String> {
        names.iter().map(|name| (*name).to_string()).collect()
    };
    vec![
        Plan {
            code: "free".to_string(),
            name: "Free".to_string(),
            price_monthly: 0,
            price_yearly: 0,
            daily_credits: 5,
            max_request_size: 500,
            context_window: 5,
            credit_lifetime_days: 3,
            discount_percent: 0,
            welcome_bonus: 0,
            allowed_models: models(&["gpt-3.5-turbo", "claude-3-haiku-20240307"]),
            priority: false,
        },
        Plan {
            code: "premium".to_string(),
            name: "Premium".to_string(),
            price_monthly: 999,
            price_yearly: 9_999,
            daily_credits: 30,
            max_request_size: 4_000,
            context_window: 20,
            credit_lifetime_days: 7,
            discount_percent: 10,
            welcome_bonus: 50,
            allowed_models: models(&[
                "gpt-3.5-turbo",
                "claude-3-haiku-20240307",
                "claude-3-sonnet-20240229",
                "gemini-1.0-pro",
                "gemini-1.5-pro",
                "grok-1",
            ]),
            priority: false,
        },
        Plan {
            code: "pro".to_string(),
            name: "Pro".to_string(),
            price_monthly: 2_499,
            price_yearly: 24_999,
            daily_credits: 100,
            max_request_size: 0,
            context_window: 50,
            credit_lifetime_days: 30,
            discount_percent: 25,
            welcome_bonus: 200,
            allowed_models: models(&[
                "gpt-3.5-turbo",
                "gpt-4o",
                "gpt-4-turbo",
                "claude-3-haiku-20240307",
                "claude-3-sonnet-20240229",
                "claude-3-opus-20240229",
                "gemini-1.0-pro",
                "gemini-1.5-pro",
                "grok-1",
                "grok-2",
            ]),
            priority: true,
        },
    ]
}

impl GatewayConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads `.json` files as JSON and everything else as TOML.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Self::from_json_str(&raw)
        } else {
            Self::from_toml_str(&raw)
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ledger.daily_grant_window_hours == 0 {
            return Err(ConfigError::Invalid(
                "ledger.daily_grant_window_hours must be positive".to_string(),
            ));
        }
        if self.pipeline.max_in_flight == 0 {
            return Err(ConfigError::Invalid(
                "pipeline.max_in_flight must be positive".to_string(),
            ));
        }
        if self.cache.max_entries == 0 {
            return Err(ConfigError::Invalid(
                "cache.max_entries must be positive".to_string(),
            ));
        }

        self.plan_catalog()?;
        let costs = self.cost_table()?;
        for plan in &self.plans {
            if let Some(model) = plan.allowed_models.iter().find(|m| !costs.contains(m)) {
                return Err(ConfigError::Invalid(format!(
                    "plan {} allows model {model} which has no price",
                    plan.code
                )));
            }
        }
        Ok(())
    }

    pub fn plan_catalog(&self) -> Result<PlanCatalog, ConfigError> {
        PlanCatalog::new(
            self.plans.clone(),
            self.default_plan.clone(),
            self.packages.clone(),
        )
        .map_err(|err| ConfigError::Invalid(err.to_string()))
    }

    pub fn cost_table(&self) -> Result<ModelCostTable, ConfigError> {
        Ok(ModelCostTable::from_config(&self.costs)?)
    }
}
