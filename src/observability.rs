use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeterStatsSnapshot {
    pub requests: u64,
    pub cache_hits: u64,
    pub charges: u64,
    pub credits_charged: u64,
    pub insufficient_balance: u64,
    pub model_denied: u64,
    pub request_too_large: u64,
}

/// Counters shared by concurrent metering calls.
#[derive(Debug, Default)]
pub struct MeterStats {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    charges: AtomicU64,
    credits_charged: AtomicU64,
    insufficient_balance: AtomicU64,
    model_denied: AtomicU64,
    request_too_large: AtomicU64,
}

impl MeterStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_charge(&self, credits: i64) {
        self.charges.fetch_add(1, Ordering::Relaxed);
        self.credits_charged
            .fetch_add(u64::try_from(credits).unwrap_or(0), Ordering::Relaxed);
    }

    pub fn record_insufficient_balance(&self) {
        self.insufficient_balance.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_model_denied(&self) {
        self.model_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_too_large(&self) {
        self.request_too_large.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MeterStatsSnapshot {
        MeterStatsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            charges: self.charges.load(Ordering::Relaxed),
            credits_charged: self.credits_charged.load(Ordering::Relaxed),
            insufficient_balance: self.insufficient_balance.load(Ordering::Relaxed),
            model_denied: self.model_denied.load(Ordering::Relaxed),
            request_too_large: self.request_too_large.load(Ordering::Relaxed),
        }
    }
}
