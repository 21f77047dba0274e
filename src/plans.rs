use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};

fn default_credit_lifetime_days() -> u32 {
    3
}

/// A subscription tier. Reference data, validated when the catalog is built.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Plan {
    pub code: String,
    pub name: String,
    /// Minor currency units.
    #[serde(default)]
    pub price_monthly: i64,
    #[serde(default)]
    pub price_yearly: i64,
    pub daily_credits: i64,
    /// Characters; 0 means unlimited.
    #[serde(default)]
    pub max_request_size: u64,
    /// Messages of history kept for a conversation.
    #[serde(default)]
    pub context_window: u32,
    #[serde(default = "default_credit_lifetime_days")]
    pub credit_lifetime_days: u32,
    #[serde(default)]
    pub discount_percent: u8,
    #[serde(default)]
    pub welcome_bonus: i64,
    #[serde(default)]
    pub allowed_models: BTreeSet<String>,
    #[serde(default)]
    pub priority: bool,
}

impl Plan {
    pub fn allows_model(&self, model: &str) -> bool {
        self.allowed_models.contains(model)
    }
}

/// A one-off bundle of credits that can be bought outside of a subscription.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreditPackage {
    pub id: i64,
    pub name: String,
    pub amount: i64,
    #[serde(default)]
    pub bonus_amount: i64,
    pub price: i64,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl CreditPackage {
    pub fn total_credits(&self) -> i64 {
        self.amount.saturating_add(self.bonus_amount)
    }
}

#[derive(Clone, Debug)]
pub struct PlanCatalog {
    plans: BTreeMap<String, Plan>,
    order: Vec<String>,
    default_code: String,
    packages: BTreeMap<i64, CreditPackage>,
}

impl PlanCatalog {
    pub fn new(
        plans: Vec<Plan>,
        default_code: impl Into<String>,
        packages: Vec<CreditPackage>,
    ) -> Result<Self> {
        let default_code = default_code.into();
        let mut by_code = BTreeMap::new();
        let mut order = Vec::with_capacity(plans.len());
        for plan in plans {
            validate_plan(&plan)?;
            if by_code.contains_key(&plan.code) {
                return Err(configuration(format!("duplicate plan code: {}", plan.code)));
            }
            order.push(plan.code.clone());
            by_code.insert(plan.code.clone(), plan);
        }
        if !by_code.contains_key(&default_code) {
            return Err(configuration(format!(
                "default plan {default_code} is not defined"
            )));
        }

        let mut by_id = BTreeMap::new();
        for package in packages {
            if package.amount <= 0 || package.bonus_amount < 0 {
                return Err(configuration(format!(
                    "credit package {} must grant a positive amount",
                    package.id
                )));
            }
            if by_id.insert(package.id, package).is_some() {
                return Err(configuration("duplicate credit package id".to_string()));
            }
        }

        Ok(Self {
            plans: by_code,
            order,
            default_code,
            packages: by_id,
        })
    }

    pub fn get(&self, code: &str) -> Result<&Plan> {
        self.plans.get(code).ok_or_else(|| LedgerError::PlanNotFound {
            code: code.to_string(),
        })
    }

    pub fn default_plan(&self) -> &Plan {
        // Presence is checked in `new`.
        &self.plans[&self.default_code]
    }

    pub fn default_code(&self) -> &str {
        &self.default_code
    }

    /// Plans in declaration order.
    pub fn plans(&self) -> impl Iterator<Item = &Plan> {
        self.order.iter().filter_map(|code| self.plans.get(code))
    }

    pub fn package(&self, id: i64) -> Result<&CreditPackage> {
        self.packages
            .get(&id)
            .filter(|package| package.active)
            .ok_or(LedgerError::PackageNotFound { id })
    }

    pub fn packages(&self) -> impl Iterator<Item = &CreditPackage> {
        self.packages.values().filter(|package| package.active)
    }
}

fn validate_plan(plan: &Plan) -> Result<()> {
    if plan.code.trim().is_empty() {
        return Err(configuration("plan code must not be empty".to_string()));
    }
    if plan.discount_percent > 100 {
        return Err(configuration(format!(
            "plan {}: discount_percent must be within 0..=100, got {}",
            plan.code, plan.discount_percent
        )));
    }
    if plan.daily_credits < 0 || plan.welcome_bonus < 0 {
        return Err(configuration(format!(
            "plan {}: credit amounts must not be negative",
            plan.code
        )));
    }
    if plan.price_monthly < 0 || plan.price_yearly < 0 {
        return Err(configuration(format!(
            "plan {}: prices must not be negative",
            plan.code
        )));
    }
    Ok(())
}

fn configuration(message: String) -> LedgerError {
    LedgerError::Configuration { message }
}
