//! Tether store – advisory resource cache
//!
//! Values are serialized on the way in; the serialized size (plus a fixed
//! per-entry overhead) is the admission cost counted against the byte
//! budget. Eviction is best-effort: readers must treat a miss as normal.

#![forbid(unsafe_code)]

use std::marker::PhantomData;
use std::sync::Arc;

use metrics::{counter, gauge};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tether_core::{CacheConfig, ResourceKey};
use tracing::{debug, info, warn};

/// Bookkeeping cost charged per entry on top of the payload.
pub const ENTRY_OVERHEAD: u64 = 24;

#[derive(Clone)]
struct Entry {
    bytes: Arc<[u8]>,
    cost: u32,
}

/// Cost-bounded, TTL'd store keyed by (kind, namespace, name).
///
/// Cheap to clone; clones share storage.
#[derive(Clone)]
pub struct ResourceCache {
    entries: Cache<ResourceKey, Entry>,
    max_item_size: u64,
    /// Byte budget in force; admission settles evictions before returning.
    bounded: bool,
}

impl ResourceCache {
    pub fn new(cfg: &CacheConfig) -> Self {
        let mut builder = Cache::builder()
            .initial_capacity(cfg.num_items.min(usize::MAX as u64) as usize)
            .weigher(|_k: &ResourceKey, e: &Entry| e.cost)
            .eviction_policy(EvictionPolicy::lru());
        if cfg.max_size > 0 {
            builder = builder.max_capacity(cfg.max_size);
        }
        if !cfg.ttl.is_zero() {
            builder = builder.time_to_live(cfg.ttl);
        }
        info!(
            items = cfg.num_items,
            max_bytes = cfg.max_size,
            max_item_bytes = cfg.max_item_size,
            ttl_secs = cfg.ttl.as_secs(),
            "resource cache ready"
        );
        Self { entries: builder.build(), max_item_size: cfg.max_item_size, bounded: cfg.max_size > 0 }
    }

    /// Store `value`. Returns false when it is too costly to admit.
    pub fn set<T: Serialize>(&self, kind: &str, namespace: &str, name: &str, value: &T) -> bool {
        let key = ResourceKey::new(kind, namespace, name);
        let bytes = match serde_json::to_vec(value) {
            Ok(b) => b,
            Err(e) => {
                warn!(key = %key, error = %e, "cache value not serializable; dropped");
                return false;
            }
        };
        let cost = bytes.len() as u64 + ENTRY_OVERHEAD;
        if self.max_item_size > 0 && cost > self.max_item_size {
            warn!(key = %key, cost, max = self.max_item_size, "cache admission refused: item too large");
            counter!("tether_cache_refused_total", 1, "kind" => kind.to_string());
            return false;
        }
        let Ok(cost) = u32::try_from(cost) else {
            warn!(key = %key, cost, "cache admission refused: cost overflows weigher");
            counter!("tether_cache_refused_total", 1, "kind" => kind.to_string());
            return false;
        };
        debug!(key = %key, cost, "cache set");
        self.entries.insert(key, Entry { bytes: bytes.into(), cost });
        if self.bounded {
            self.entries.run_pending_tasks();
        }
        counter!("tether_cache_admitted_total", 1, "kind" => kind.to_string());
        true
    }

    pub fn get<T: DeserializeOwned>(&self, kind: &str, namespace: &str, name: &str) -> Option<T> {
        let key = ResourceKey::new(kind, namespace, name);
        let Some(entry) = self.entries.get(&key) else {
            counter!("tether_cache_misses_total", 1, "kind" => kind.to_string());
            return None;
        };
        counter!("tether_cache_hits_total", 1, "kind" => kind.to_string());
        match serde_json::from_slice(&entry.bytes) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = %key, error = %e, "cached value has a different shape");
                None
            }
        }
    }

    pub fn delete(&self, kind: &str, namespace: &str, name: &str) {
        self.entries.invalidate(&ResourceKey::new(kind, namespace, name));
    }

    /// Typed view scoped to one kind.
    pub fn kind<T>(&self, kind: impl Into<String>) -> KindCache<T> {
        KindCache { cache: self.clone(), kind: kind.into(), _value: PhantomData }
    }

    /// Apply pending evictions and expirations now.
    pub fn sync(&self) {
        self.entries.run_pending_tasks();
        gauge!("tether_cache_bytes", self.entries.weighted_size() as f64);
        gauge!("tether_cache_entries", self.entries.entry_count() as f64);
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats { entries: self.entries.entry_count(), bytes: self.entries.weighted_size() }
    }
}

/// Usage; exact after a bounded `set` or [`ResourceCache::sync`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: u64,
    pub bytes: u64,
}

/// [`ResourceCache`] bound to one kind and value type.
#[derive(Clone)]
pub struct KindCache<T> {
    cache: ResourceCache,
    kind: String,
    _value: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> KindCache<T> {
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn set(&self, namespace: &str, name: &str, value: &T) -> bool {
        self.cache.set(&self.kind, namespace, name, value)
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<T> {
        self.cache.get(&self.kind, namespace, name)
    }

    pub fn delete(&self, namespace: &str, name: &str) {
        self.cache.delete(&self.kind, namespace, name)
    }
}
