//! Point-in-time read cache.
//!
//! Entries remember the validity period of the value they hold, so one cached
//! read answers every request whose timestamp falls into that period. The
//! cache is only mutated from inside the commit critical section; readers
//! see it as a snapshot guarded by the branch lock.

use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

use crate::types::{GetResult, Period, QualifiedKey, Timestamp};

pub trait ValueCache: Send + Sync {
    /// A cached result whose period contains `timestamp`, if any.
    fn get(&self, branch: &str, timestamp: Timestamp, key: &QualifiedKey) -> Option<GetResult<Value>>;

    fn cache(&self, branch: &str, key: &QualifiedKey, result: &GetResult<Value>);

    /// Record the values of a commit at `timestamp`, closing the open periods
    /// of the previous values.
    fn write_through(
        &self,
        branch: &str,
        timestamp: Timestamp,
        values: &BTreeMap<QualifiedKey, Option<Value>>,
    );

    /// Forget everything that may not hold once history after `timestamp` is
    /// discarded.
    fn rollback_to_timestamp(&self, timestamp: Timestamp);

    fn clear(&self);

    fn stats(&self) -> CacheStats;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub keys: usize,
}

#[derive(Debug, Clone)]
struct CachedValue {
    period: Period,
    value: Option<Value>,
    hit: bool,
}

type CacheKey = (String, QualifiedKey);

/// LRU-bounded [`ValueCache`]. Capacity counts distinct `(branch, key)`
/// pairs, each of which may hold several periods.
pub struct LruValueCache {
    entries: Mutex<LruCache<CacheKey, Vec<CachedValue>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl LruValueCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// `None` when `capacity` is zero.
    pub fn with_capacity(capacity: usize) -> Option<Self> {
        NonZeroUsize::new(capacity).map(Self::new)
    }
}

impl ValueCache for LruValueCache {
    fn get(&self, branch: &str, timestamp: Timestamp, key: &QualifiedKey) -> Option<GetResult<Value>> {
        let mut entries = self.entries.lock();
        let found = entries
            .get(&(branch.to_string(), key.clone()))
            .and_then(|periods| periods.iter().find(|c| c.period.contains(timestamp)))
            .map(|c| {
                if c.hit {
                    GetResult::hit(c.value.clone(), c.period)
                } else {
                    GetResult::miss(c.period)
                }
            });
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    fn cache(&self, branch: &str, key: &QualifiedKey, result: &GetResult<Value>) {
        let mut entries = self.entries.lock();
        let cache_key = (branch.to_string(), key.clone());
        let cached = CachedValue {
            period: result.period(),
            value: result.value().cloned(),
            hit: result.is_hit(),
        };
        match entries.get_mut(&cache_key) {
            Some(periods) => {
                let period = result.period();
                periods.retain(|c| c.period.upper() <= period.lower() || c.period.lower() >= period.upper());
                periods.push(cached);
            }
            None => {
                entries.put(cache_key, vec![cached]);
            }
        }
    }

    fn write_through(
        &self,
        branch: &str,
        timestamp: Timestamp,
        values: &BTreeMap<QualifiedKey, Option<Value>>,
    ) {
        let mut entries = self.entries.lock();
        for (key, value) in values {
            let cache_key = (branch.to_string(), key.clone());
            let fresh = CachedValue {
                period: Period::starting_at(timestamp),
                value: value.clone(),
                hit: true,
            };
            match entries.get_mut(&cache_key) {
                Some(periods) => {
                    periods.retain(|c| c.period.lower() < timestamp);
                    for c in periods.iter_mut() {
                        if c.period.upper() > timestamp {
                            c.period = c.period.with_upper(timestamp);
                        }
                    }
                    periods.push(fresh);
                }
                None => {
                    entries.put(cache_key, vec![fresh]);
                }
            }
        }
    }

    fn rollback_to_timestamp(&self, timestamp: Timestamp) {
        let mut entries = self.entries.lock();
        let mut emptied = Vec::new();
        for (key, periods) in entries.iter_mut() {
            periods.retain(|c| {
                c.period.lower() <= timestamp
                    && (c.period.is_open_ended() || c.period.upper() <= timestamp)
            });
            if periods.is_empty() {
                emptied.push(key.clone());
            }
        }
        for key in emptied {
            entries.pop(&key);
        }
    }

    fn clear(&self) {
        self.entries.lock().clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            keys: self.entries.lock().len(),
        }
    }
}
