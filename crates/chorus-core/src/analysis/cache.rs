//! Bounded TTL cache for scene analyses.
//!
//! Keyed by normalized message text. Entries expire strictly by TTL and are
//! replaced whole; the only other removal is evicting the oldest entry when
//! the cache is full. Safe for concurrent readers (`DashMap`).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

use chorus_types::analysis::AnalysisResult;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: AnalysisResult,
    stored_at: Instant,
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    /// Younger than the refresh threshold.
    Fresh(AnalysisResult),
    /// Still valid, but old enough that a background refresh is due.
    Stale(AnalysisResult),
    Miss,
}

/// Concurrent analysis cache shared by clones of the analyzer.
#[derive(Debug, Clone)]
pub struct AnalysisCache {
    entries: Arc<DashMap<String, CacheEntry>>,
    refreshing: Arc<DashMap<String, ()>>,
    ttl: Duration,
    refresh_after: Duration,
    capacity: usize,
}

/// Normalize message text into a cache key: trimmed, lowercased, with
/// whitespace runs collapsed to one space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

impl AnalysisCache {
    pub fn new(ttl: Duration, refresh_after: Duration, capacity: usize) -> Self {
        Self {
            entries: Arc::new(DashMap::new()),
            refreshing: Arc::new(DashMap::new()),
            ttl,
            refresh_after: refresh_after.min(ttl),
            capacity: capacity.max(1),
        }
    }

    /// Look up `key`, dropping the entry if its TTL has passed.
    pub fn get(&self, key: &str) -> CacheLookup {
        let age = match self.entries.get(key) {
            Some(entry) => {
                let age = entry.stored_at.elapsed();
                if age < self.ttl {
                    let result = entry.result.clone();
                    return if age >= self.refresh_after {
                        CacheLookup::Stale(result)
                    } else {
                        CacheLookup::Fresh(result)
                    };
                }
                age
            }
            None => return CacheLookup::Miss,
        };
        // Guard released above; removing while holding it would deadlock.
        self.entries
            .remove_if(key, |_, entry| entry.stored_at.elapsed() >= self.ttl);
        tracing::trace!(key, age_secs = age.as_secs(), "analysis cache entry expired");
        CacheLookup::Miss
    }

    /// Store `result` under `key`, replacing any previous entry whole.
    pub fn insert(&self, key: String, result: AnalysisResult) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(
            key,
            CacheEntry {
                result,
                stored_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().stored_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Claim the refresh slot for `key`. Returns false if one is in flight.
    pub fn try_begin_refresh(&self, key: &str) -> bool {
        use dashmap::mapref::entry::Entry;
        match self.refreshing.entry(key.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(());
                true
            }
        }
    }

    pub fn finish_refresh(&self, key: &str) {
        self.refreshing.remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
