//! Adaptive key/value cache with per-entry TTL, tag-based group
//! invalidation, and LRU eviction when at capacity.
//!
//! Backed by a sharded map so mutating operations contend per shard instead
//! of on one global lock. A background sweep reclaims expired entries even
//! without access pressure; the engine owns that task and aborts it on
//! shutdown. Global hit/miss accounting feeds the optimization engine's
//! caching recommendations.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{PerfError, Result};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    tags: HashSet<String>,
    created_at: Instant,
    /// Always >= created_at; a zero TTL expires the entry immediately.
    expires_at: Instant,
    hit_count: u64,
    last_accessed: Instant,
}

/// Aggregate hit-rate accounting exposed to callers and to the optimizer.
#[derive(Debug, Clone, Serialize)]
pub struct CachePerformanceReport {
    pub hits: u64,
    pub misses: u64,
    pub hit_ratio: f64,
    pub entries: usize,
    pub evictions: u64,
    pub invalidations: u64,
}

pub struct AdaptiveCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

impl<V: Clone + Send + Sync + 'static> AdaptiveCache<V> {
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            max_entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// Insert or replace an entry, then trim back to capacity by evicting
    /// least-recently-used entries (ties broken by earliest creation). An
    /// impossible eviction rolls the insert back and is logged, never
    /// surfaced.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration, tags: &[&str]) {
        let key = key.into();
        let now = Instant::now();
        let entry = CacheEntry {
            value,
            tags: tags.iter().map(|t| t.to_string()).collect(),
            created_at: now,
            expires_at: now + ttl,
            hit_count: 0,
            last_accessed: now,
        };
        self.entries.insert(key.clone(), entry);

        // Trim after inserting: concurrent first-time inserts may transiently
        // exceed the bound, but every call trims until it holds again.
        while self.entries.len() > self.max_entries {
            if let Err(err) = self.evict_lru() {
                warn!("cache insert for '{}' rolled back: {}", key, err);
                self.entries.remove(&key);
                break;
            }
        }
    }

    /// Fetch a live entry, bumping its hit count and recency. Expired entries
    /// count as misses and are removed on the spot.
    pub fn get(&self, key: &str) -> Option<V> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if Instant::now() >= entry.expires_at {
                drop(entry);
                self.entries.remove(key);
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
            entry.hit_count += 1;
            entry.last_accessed = Instant::now();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn remove(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry carrying `tag`. Returns how many were dropped.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.tags.contains(tag));
        let removed = before.saturating_sub(self.entries.len());
        self.invalidations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    /// Sweep entries past their expiry. Returns how many were reclaimed.
    pub fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| now < entry.expires_at);
        let removed = before.saturating_sub(self.entries.len());
        self.evictions.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    fn evict_lru(&self) -> Result<()> {
        if self.max_entries == 0 {
            return Err(PerfError::CapacityExceeded(
                "cache capacity is zero".to_string(),
            ));
        }

        let mut victim: Option<(String, Instant, Instant)> = None;
        for entry in self.entries.iter() {
            let candidate = (
                entry.key().clone(),
                entry.last_accessed,
                entry.created_at,
            );
            victim = match victim {
                None => Some(candidate),
                Some(current) => {
                    if (candidate.1, candidate.2) < (current.1, current.2) {
                        Some(candidate)
                    } else {
                        Some(current)
                    }
                }
            };
        }

        match victim {
            Some((key, _, _)) => {
                self.entries.remove(&key);
                self.evictions.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            None => Err(PerfError::CapacityExceeded(
                "no evictable entries".to_string(),
            )),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn performance_report(&self) -> CachePerformanceReport {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CachePerformanceReport {
            hits,
            misses,
            hit_ratio: if total > 0 {
                hits as f64 / total as f64
            } else {
                0.0
            },
            entries: self.entries.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
        }
    }

    /// Spawn the periodic expired-entry sweep. The returned handle is owned
    /// by the engine lifecycle and aborted on shutdown.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = cache.evict_expired();
                if removed > 0 {
                    debug!("cache sweep reclaimed {} expired entries", removed);
                }
            }
        })
    }
}

/// External credential/secret lookup, consumed behind a narrow trait.
/// The engine wraps it with caching but never implements authentication.
pub trait SecretProvider: Send + Sync {
    fn fetch(&self, name: &str) -> Result<String>;
}

/// Caching wrapper for secret lookups. Entries carry the `secrets` tag so a
/// credential rotation can drop them all at once.
pub struct SecretCache<P> {
    provider: P,
    cache: AdaptiveCache<String>,
    ttl: Duration,
}

impl<P: SecretProvider> SecretCache<P> {
    pub fn new(provider: P, max_entries: usize, ttl: Duration) -> Self {
        Self {
            provider,
            cache: AdaptiveCache::new(max_entries),
            ttl,
        }
    }

    pub fn get(&self, name: &str) -> Result<String> {
        if let Some(value) = self.cache.get(name) {
            return Ok(value);
        }
        let value = self.provider.fetch(name)?;
        self.cache.set(name, value.clone(), self.ttl, &["secrets"]);
        Ok(value)
    }

    pub fn invalidate_all(&self) -> usize {
        self.cache.invalidate_by_tag("secrets")
    }

    pub fn report(&self) -> CachePerformanceReport {
        self.cache.performance_report()
    }
}
