use std::collections::{HashMap, VecDeque};

use crate::types::UsageRecord;

#[derive(Clone, Debug)]
struct CacheEntry {
    record: UsageRecord,
    expires_at_ms: Option<u64>,
}

/// Bounded in-process cache of usage records keyed by request fingerprint.
///
/// Sits in front of the usage store so repeated prompts do not hit the database. Entries are
/// evicted in insertion order once `max_entries` is exceeded.
#[derive(Debug)]
pub struct ResponseCache {
    ttl_ms: Option<u64>,
    max_entries: usize,
    entries: HashMap<String, CacheEntry>,
    order: VecDeque<String>,
}

impl ResponseCache {
    pub fn new(ttl_seconds: Option<u64>, max_entries: usize) -> Self {
        Self {
            ttl_ms: ttl_seconds.map(|ttl| ttl.saturating_mul(1_000)),
            max_entries,
            entries: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    pub fn ttl_ms(&self) -> Option<u64> {
        self.ttl_ms
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&mut self, key: &str, now_ms: u64) -> Option<UsageRecord> {
        let expires_at_ms = self.entries.get(key)?.expires_at_ms;
        if expires_at_ms.is_some_and(|at| now_ms >= at) {
            self.remove(key);
            return None;
        }
        Some(self.entries.get(key)?.record.clone())
    }

    pub fn insert(&mut self, key: String, record: UsageRecord, now_ms: u64) {
        if self.max_entries == 0 || self.ttl_ms == Some(0) {
            return;
        }

        let entry = CacheEntry {
            record,
            expires_at_ms: self.ttl_ms.map(|ttl| now_ms.saturating_add(ttl)),
        };
        if self.entries.insert(key.clone(), entry).is_some() {
            self.order.retain(|candidate| candidate != &key);
        }
        self.order.push_back(key);

        while self.entries.len() > self.max_entries {
            let Some(candidate) = self.order.pop_front() else {
                break;
            };
            self.entries.remove(&candidate);
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let existed = self.entries.remove(key).is_some();
        if existed {
            self.order.retain(|candidate| candidate != key);
        }
        existed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}
