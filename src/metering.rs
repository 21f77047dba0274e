use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sha2::Digest as _;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, error, info};

use crate::cache::ResponseCache;
use crate::clock::Clock;
use crate::config::{CacheConfig, CacheScope};
use crate::costing::ModelCostTable;
use crate::error::{LedgerError, Result};
use crate::ledger::{CreditLedger, Spend};
use crate::observability::{MeterStats, MeterStatsSnapshot};
use crate::store::UsageStore;
use crate::types::{Metadata, NewUsageRecord, TransactionKind, UsageRecord, UserId};

/// Outcome of metering one request, decided before the model is invoked.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MeterDecision {
    /// An identical request was answered before; reuse its response for free.
    Cached {
        response: String,
        source_usage_id: i64,
        fingerprint: String,
    },
    /// Invoke the model; `cost` credits are debited when usage is recorded.
    Charge {
        cost: i64,
        fingerprint: String,
        plan: String,
    },
}

impl MeterDecision {
    pub fn fingerprint(&self) -> &str {
        match self {
            Self::Cached { fingerprint, .. } | Self::Charge { fingerprint, .. } => fingerprint,
        }
    }

    pub fn cost(&self) -> i64 {
        match self {
            Self::Cached { .. } => 0,
            Self::Charge { cost, .. } => *cost,
        }
    }

    pub fn is_cached(&self) -> bool {
        matches!(self, Self::Cached { .. })
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UsageReport {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub response_text: String,
    pub prompt_chars: u64,
    pub metadata: Metadata,
}

/// Content address of a request: sha256 over prompt and model, plus the user for per-user scope.
pub fn fingerprint(scope: CacheScope, user_id: UserId, model: &str, prompt: &str) -> String {
    let mut hasher = sha2::Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(model.as_bytes());
    if scope == CacheScope::PerUser {
        hasher.update(b"\x1fuser:");
        hasher.update(user_id.to_string().as_bytes());
    }
    hex_lower(&hasher.finalize())
}

fn hex_lower(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len().saturating_mul(2));
    for byte in bytes {
        out.push(char::from(HEX[usize::from(byte >> 4)]));
        out.push(char::from(HEX[usize::from(byte & 0x0f)]));
    }
    out
}

pub struct Meter {
    ledger: Arc<CreditLedger>,
    usage: Arc<dyn UsageStore>,
    costs: Arc<ModelCostTable>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    hot: Mutex<ResponseCache>,
    /// One lock per fingerprint being charged, so identical requests debit once.
    charging: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    stats: MeterStats,
}

impl Meter {
    pub fn new(
        ledger: Arc<CreditLedger>,
        usage: Arc<dyn UsageStore>,
        costs: Arc<ModelCostTable>,
        clock: Arc<dyn Clock>,
        config: CacheConfig,
    ) -> Self {
        let hot = ResponseCache::new(config.ttl_seconds, config.max_entries);
        Self {
            ledger,
            usage,
            costs,
            clock,
            config,
            hot: Mutex::new(hot),
            charging: Mutex::new(HashMap::new()),
            stats: MeterStats::default(),
        }
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn costs(&self) -> &ModelCostTable {
        &self.costs
    }

    pub fn stats(&self) -> MeterStatsSnapshot {
        self.stats.snapshot()
    }

    /// Decides how a request is served: from cache, or charged at the plan's price.
    ///
    /// Nothing is written; the balance check is advisory and repeated atomically by the spend in
    /// [`Meter::record_usage`].
    pub async fn meter(
        &self,
        user_id: UserId,
        model: &str,
        prompt: &str,
        prompt_tokens: u32,
    ) -> Result<MeterDecision> {
        self.stats.record_request();
        let fingerprint = fingerprint(self.config.scope, user_id, model, prompt);

        if self.config.enabled {
            if let Some(record) = self.lookup(&fingerprint).await? {
                self.stats.record_cache_hit();
                debug!(user_id, model, source_usage_id = record.id, "serving cached response");
                return Ok(MeterDecision::Cached {
                    response: record.response_text,
                    source_usage_id: record.id,
                    fingerprint,
                });
            }
        }

        let entitlements = self.ledger.entitlements();
        let plan = entitlements.resolve_plan(user_id).await?;
        if let Err(err) = entitlements.check_request_size(&plan, prompt) {
            self.stats.record_request_too_large();
            return Err(err);
        }
        if !entitlements.has_model_access(&plan, model) {
            self.stats.record_model_denied();
            return Err(LedgerError::ModelNotAllowed {
                model: model.to_string(),
                plan: plan.code.clone(),
            });
        }
        let base_cost = self
            .costs
            .base_cost(model)
            .ok_or_else(|| LedgerError::Configuration {
                message: format!("model {model} has no price"),
            })?;
        let cost = entitlements.discounted_cost(&plan, base_cost);

        let available = self.ledger.balance(user_id).await?.amount;
        if available < cost {
            self.stats.record_insufficient_balance();
            return Err(LedgerError::InsufficientBalance {
                required: cost,
                available,
            });
        }

        debug!(user_id, model, cost, prompt_tokens, plan = %plan.code, "request metered");
        Ok(MeterDecision::Charge {
            cost,
            fingerprint,
            plan: plan.code,
        })
    }

    /// Persists usage for a metered request. Charged requests debit the ledger first; a failed
    /// debit records nothing.
    ///
    /// A charge whose fingerprint was answered in the meantime is recorded as a cache hit instead,
    /// so identical requests metered concurrently are debited once.
    pub async fn record_usage(
        &self,
        user_id: UserId,
        model: &str,
        decision: &MeterDecision,
        report: UsageReport,
    ) -> Result<UsageRecord> {
        let _charging = match decision {
            MeterDecision::Charge { fingerprint, .. } if self.config.enabled => {
                Some(self.charge_guard(fingerprint).await)
            }
            _ => None,
        };
        let now_ms = self.clock.now_millis();
        let mut metadata = report.metadata;

        let (transaction_id, cached_from, credits_charged) = match decision {
            MeterDecision::Cached {
                source_usage_id, ..
            } => (None, Some(*source_usage_id), 0),
            MeterDecision::Charge {
                cost,
                fingerprint,
                plan,
            } => {
                let superseded = if self.config.enabled {
                    self.lookup(fingerprint).await?
                } else {
                    None
                };
                match superseded {
                    Some(source) => {
                        self.stats.record_cache_hit();
                        debug!(user_id, model, source_usage_id = source.id, "charge answered by cache");
                        (None, Some(source.id), 0)
                    }
                    None => {
                        let mut spend_metadata = Metadata::new();
                        spend_metadata.insert("model".to_string(), serde_json::json!(model));
                        spend_metadata.insert("plan".to_string(), serde_json::json!(plan));
                        spend_metadata.insert(
                            "prompt_tokens".to_string(),
                            serde_json::json!(report.prompt_tokens),
                        );
                        spend_metadata.insert(
                            "completion_tokens".to_string(),
                            serde_json::json!(report.completion_tokens),
                        );
                        let spend = Spend::new(*cost, TransactionKind::Usage)
                            .description(format!("Request to {model}"))
                            .metadata(spend_metadata)
                            .correlation_id(format!("fingerprint:{fingerprint}"));
                        let tx = self.ledger.spend(user_id, spend).await?;
                        self.stats.record_charge(*cost);
                        (Some(tx.id), None, *cost)
                    }
                }
            }
        };
        if let Some(source_usage_id) = cached_from {
            metadata.insert("cached".to_string(), serde_json::json!(true));
            metadata.insert("cached_id".to_string(), serde_json::json!(source_usage_id));
        }

        let record = NewUsageRecord {
            user_id,
            model: model.to_string(),
            prompt_chars: report.prompt_chars,
            prompt_tokens: report.prompt_tokens,
            completion_tokens: report.completion_tokens,
            credits_charged,
            fingerprint: decision.fingerprint().to_string(),
            transaction_id,
            cached_from,
            response_text: report.response_text,
            metadata,
            created_at_ms: now_ms,
        };
        let record = match self.usage.insert_usage(record).await {
            Ok(record) => record,
            Err(err) => {
                error!(
                    user_id,
                    model,
                    transaction_id = ?transaction_id,
                    error = %err,
                    "usage record lost after charge"
                );
                return Err(err);
            }
        };

        if self.config.enabled && record.cached_from.is_none() {
            self.hot
                .lock()
                .await
                .insert(record.fingerprint.clone(), record.clone(), now_ms);
        }
        info!(
            user_id,
            model,
            usage_id = record.id,
            credits_charged,
            cached = cached_from.is_some(),
            "usage recorded"
        );
        Ok(record)
    }

    pub async fn usage_statistics(&self, user_id: UserId) -> Result<BTreeMap<String, u64>> {
        self.usage.usage_statistics(user_id).await
    }

    pub async fn usage_history(&self, user_id: UserId, limit: usize) -> Result<Vec<UsageRecord>> {
        self.usage.usage_history(user_id, limit).await
    }

    async fn charge_guard(&self, fingerprint: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut charging = self.charging.lock().await;
            charging.retain(|_, slot| Arc::strong_count(slot) > 1);
            charging.entry(fingerprint.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    async fn lookup(&self, fingerprint: &str) -> Result<Option<UsageRecord>> {
        let now_ms = self.clock.now_millis();
        let lookup = async {
            if let Some(record) = self.hot.lock().await.get(fingerprint, now_ms) {
                return Ok(Some(record));
            }
            let not_before = self
                .config
                .ttl_seconds
                .map(|ttl| now_ms.saturating_sub(ttl.saturating_mul(1_000)));
            let found = self.usage.cached_usage(fingerprint, not_before).await?;
            if let Some(record) = &found {
                self.hot
                    .lock()
                    .await
                    .insert(fingerprint.to_string(), record.clone(), now_ms);
            }
            Ok::<_, LedgerError>(found)
        };
        tokio::time::timeout(self.config.lookup_timeout(), lookup)
            .await
            .map_err(|_| LedgerError::Timeout {
                operation: "cache_lookup",
            })?
    }
}
