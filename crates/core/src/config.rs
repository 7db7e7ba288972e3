//! Runtime knobs, read from `TETHER_*` environment variables with defaults.

use std::str::FromStr;
use std::time::Duration;

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

/// Connection and fan-out settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchConfig {
    /// Capacity of each subscriber queue and of the connection's outbound queue.
    pub queue_capacity: usize,
    /// How long a single push into a subscriber queue may block before the
    /// subscriber is considered unresponsive and dropped.
    pub delivery_timeout: Duration,
    /// Fixed pause after an in-stream ERROR before a full resync.
    pub error_backoff: Duration,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Consecutive failed attempts to open a watch before giving up.
    pub connect_attempts: u32,
    /// Server-side watch timeout; the server closes the stream after it.
    pub server_timeout_secs: u32,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            delivery_timeout: Duration::from_millis(1000),
            error_backoff: Duration::from_millis(1000),
            backoff_base: Duration::from_millis(200),
            backoff_max: Duration::from_secs(30),
            connect_attempts: 5,
            server_timeout_secs: 290,
        }
    }
}

impl WatchConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            queue_capacity: env_or("TETHER_QUEUE_CAP", d.queue_capacity).max(1),
            delivery_timeout: Duration::from_millis(env_or("TETHER_DELIVERY_TIMEOUT_MS", 1000u64)),
            error_backoff: Duration::from_millis(env_or("TETHER_ERROR_BACKOFF_MS", 1000u64)),
            backoff_base: Duration::from_millis(env_or("TETHER_BACKOFF_BASE_MS", 200u64)),
            backoff_max: Duration::from_secs(env_or("TETHER_BACKOFF_MAX_SECS", 30u64)),
            connect_attempts: env_or("TETHER_CONNECT_ATTEMPTS", d.connect_attempts).max(1),
            server_timeout_secs: env_or("TETHER_WATCH_TIMEOUT_SECS", d.server_timeout_secs),
        }
    }
}

/// Resource cache sizing. Zero disables the respective bound.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheConfig {
    /// Expected number of entries; sizes the initial table.
    pub num_items: u64,
    /// Total admission cost budget in bytes.
    pub max_size: u64,
    /// Largest single admission cost accepted.
    pub max_item_size: u64,
    pub ttl: Duration,
}

impl CacheConfig {
    pub fn new(num_items: u64, max_size: u64, max_item_size: u64, ttl: Duration) -> Self {
        Self { num_items, max_size, max_item_size, ttl }
    }

    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            num_items: env_or("TETHER_CACHE_ITEMS", d.num_items),
            max_size: env_or("TETHER_CACHE_MAX_BYTES", d.max_size),
            max_item_size: env_or("TETHER_CACHE_MAX_ITEM_BYTES", d.max_item_size),
            ttl: Duration::from_secs(env_or("TETHER_CACHE_TTL_SECS", d.ttl.as_secs())),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            num_items: 10_000,
            max_size: 64 * 1024 * 1024,
            max_item_size: 1024 * 1024,
            ttl: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterConfig {
    /// Pause before re-subscribing after the adapter's stream closed.
    pub retry_interval: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self { retry_interval: Duration::from_millis(5000) }
    }
}

impl AdapterConfig {
    pub fn from_env() -> Self {
        Self { retry_interval: Duration::from_millis(env_or("TETHER_ADAPTER_RETRY_MS", 5000u64)) }
    }
}
