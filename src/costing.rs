use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Base,
    Premium,
    Pro,
}

impl fmt::Display for ModelTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Base => "base",
            Self::Premium => "premium",
            Self::Pro => "pro",
        })
    }
}

/// Credits charged per request for each model tier.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierCosts {
    #[serde(default = "default_base_cost")]
    pub base: i64,
    #[serde(default = "default_premium_cost")]
    pub premium: i64,
    #[serde(default = "default_pro_cost")]
    pub pro: i64,
}

fn default_base_cost() -> i64 {
    1
}

fn default_premium_cost() -> i64 {
    3
}

fn default_pro_cost() -> i64 {
    5
}

impl Default for TierCosts {
    fn default() -> Self {
        Self {
            base: default_base_cost(),
            premium: default_premium_cost(),
            pro: default_pro_cost(),
        }
    }
}

impl TierCosts {
    pub fn cost(&self, tier: ModelTier) -> i64 {
        match tier {
            ModelTier::Base => self.base,
            ModelTier::Premium => self.premium,
            ModelTier::Pro => self.pro,
        }
    }
}

/// Serialized form of the cost table: an explicit model to tier mapping.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelCostConfig {
    #[serde(default)]
    pub tiers: TierCosts,
    #[serde(default)]
    pub models: BTreeMap<String, ModelTier>,
}

impl Default for ModelCostConfig {
    fn default() -> Self {
        let models = [
            ("gpt-3.5-turbo", ModelTier::Base),
            ("gpt-4o", ModelTier::Pro),
            ("gpt-4-turbo", ModelTier::Pro),
            ("claude-3-haiku-20240307", ModelTier::Base),
            ("claude-3-sonnet-20240229", ModelTier::Premium),
            ("claude-3-opus-20240229", ModelTier::Pro),
            ("grok-1", ModelTier::Base),
            ("grok-2", ModelTier::Pro),
            ("gemini-1.0-pro", ModelTier::Base),
            ("gemini-1.5-pro", ModelTier::Premium),
        ]
        .into_iter()
        .map(|(model, tier)| (model.to_string(), tier))
        .collect();
        Self {
            tiers: TierCosts::default(),
            models,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelPricing {
    pub tier: ModelTier,
    pub credits: i64,
}

#[derive(Clone, Debug, Default)]
pub struct ModelCostTable {
    models: HashMap<String, ModelPricing>,
}

#[derive(Debug, Error)]
pub enum CostTableError {
    #[error("invalid cost for tier {tier}: expected a positive number of credits, got {cost}")]
    NonPositiveCost { tier: ModelTier, cost: i64 },
    #[error("invalid cost table entry: empty model name")]
    EmptyModelName,
}

impl ModelCostTable {
    pub fn from_config(config: &ModelCostConfig) -> Result<Self, CostTableError> {
        for tier in [ModelTier::Base, ModelTier::Premium, ModelTier::Pro] {
            let cost = config.tiers.cost(tier);
            if cost <= 0 {
                return Err(CostTableError::NonPositiveCost { tier, cost });
            }
        }

        let mut models = HashMap::new();
        for (model, tier) in &config.models {
            let model = model.trim();
            if model.is_empty() {
                return Err(CostTableError::EmptyModelName);
            }
            models.insert(
                model.to_string(),
                ModelPricing {
                    tier: *tier,
                    credits: config.tiers.cost(*tier),
                },
            );
        }
        Ok(Self { models })
    }

    pub fn model_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// Undiscounted credits for one request to `model`.
    pub fn base_cost(&self, model: &str) -> Option<i64> {
        self.model_pricing(model).map(|pricing| pricing.credits)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.models.contains_key(model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_explicit_model_table() {
        let raw = r#"
            [tiers]
            base = 2
            pro = 10

            [models]
            "gpt-4o" = "pro"
            "gpt-4o-mini" = "base"
        "#;
        let config: ModelCostConfig = toml::from_str(raw).expect("config");
        let table = ModelCostTable::from_config(&config).expect("table");

        assert_eq!(table.base_cost("gpt-4o"), Some(10));
        assert_eq!(table.base_cost("gpt-4o-mini"), Some(2));
        assert_eq!(config.tiers.premium, 3);
        assert!(table.base_cost("gpt-4").is_none());
    }

    #[test]
    fn similar_model_names_do_not_share_prices() {
        let table = ModelCostTable::from_config(&ModelCostConfig::default()).expect("table");
        assert_eq!(table.base_cost("gpt-4o"), Some(5));
        assert_eq!(table.base_cost("gpt-3.5-turbo"), Some(1));
        assert!(table.base_cost("gpt-4o-2024-05-13").is_none());
    }

    #[test]
    fn rejects_non_positive_tier_cost() {
        let mut config = ModelCostConfig::default();
        config.tiers.premium = 0;
        let err = ModelCostTable::from_config(&config).expect_err("zero cost");
        assert!(matches!(
            err,
            CostTableError::NonPositiveCost {
                tier: ModelTier::Premium,
                cost: 0
            }
        ));
    }
}
