//! Tether public façade (in-process).
//!
//! Bundles a watch source, the shared-watch [`Multiplexer`] and the
//! [`ResourceCache`] behind one handle that frontends (the CLI) depend on.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tether_core::{AdapterConfig, CacheConfig, Filter, ResourceKey, ResourceRecord, WatchConfig, WatchError, WatchTarget};
use tether_kubehub::{WatchItem, WatchSource};
use tether_notify::{HandlerStats, Multiplexer, Subscription};
use tether_store::ResourceCache;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod adapter;

pub use adapter::CacheAdapter;

/// API errors suitable for transport over RPC later.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum MirrorError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    /// The API server could not be reached and the cache had nothing either.
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type MirrorResult<T> = Result<T, MirrorError>;

impl From<WatchError> for MirrorError {
    fn from(e: WatchError) -> Self {
        match e {
            WatchError::UnsupportedFilter(_) | WatchError::InvalidTarget(_) => MirrorError::Validation(e.to_string()),
            WatchError::Upstream(_) => MirrorError::Unavailable(e.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Origin {
    /// Read from the API server.
    Remote,
    /// API server unreachable; served from the cache and possibly stale.
    Cache,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Read {
    pub record: ResourceRecord,
    pub origin: Origin,
}

/// Cancellation handle for a background task.
pub struct CancelHandle {
    token: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the task to finish.
    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.task.await;
    }
}

#[derive(Clone)]
pub struct Mirror {
    source: Arc<dyn WatchSource>,
    mux: Multiplexer,
    cache: ResourceCache,
    watch_cfg: WatchConfig,
    adapter_cfg: AdapterConfig,
}

impl Mirror {
    pub fn new(source: Arc<dyn WatchSource>, watch_cfg: WatchConfig, cache_cfg: CacheConfig, adapter_cfg: AdapterConfig) -> Self {
        let mux = Multiplexer::new(source.clone(), watch_cfg.clone());
        let cache = ResourceCache::new(&cache_cfg);
        Self { source, mux, cache, watch_cfg, adapter_cfg }
    }

    /// Configuration from `TETHER_*` environment variables.
    pub fn from_env(source: Arc<dyn WatchSource>) -> Self {
        Self::new(source, WatchConfig::from_env(), CacheConfig::from_env(), AdapterConfig::from_env())
    }

    pub fn subscribe(&self, target: WatchTarget, filter: Filter) -> MirrorResult<Subscription> {
        info!(target = %target, "api: subscribe");
        Ok(self.mux.subscribe(target, filter)?)
    }

    /// Dedicated watch with a server-side label selector; not shared.
    pub fn watch_direct(&self, target: WatchTarget, filter: &Filter, token: CancellationToken) -> MirrorResult<mpsc::Receiver<WatchItem>> {
        Ok(tether_kubehub::watch(self.source.clone(), target, filter, self.watch_cfg.clone(), token)?)
    }

    /// Start a cache adapter for `target` in the background.
    pub fn mirror(&self, target: WatchTarget, token: CancellationToken) -> MirrorResult<CancelHandle> {
        if target.gvk.trim().is_empty() {
            return Err(MirrorError::Validation("empty gvk".into()));
        }
        info!(target = %target, "api: mirror start");
        let adapter = CacheAdapter::new(self.mux.clone(), self.cache.clone(), target, self.adapter_cfg.clone());
        let task = tokio::spawn(adapter.run(token.clone()));
        Ok(CancelHandle { token, task })
    }

    /// Authoritative read; falls back to the cache when the API server fails.
    pub async fn get(&self, kind: &str, namespace: Option<&str>, name: &str) -> MirrorResult<Read> {
        let t0 = Instant::now();
        let key = ResourceKey::new(kind, namespace.unwrap_or(""), name);
        match self.source.get(&key).await {
            Ok(Some(record)) => {
                info!(key = %key, took_ms = %t0.elapsed().as_millis(), "api: get ok");
                Ok(Read { record, origin: Origin::Remote })
            }
            Ok(None) => Err(MirrorError::NotFound(key.to_string())),
            Err(e) => {
                let cause = format!("{:#}", e);
                match self.cache.get::<ResourceRecord>(&key.kind, &key.namespace, &key.name) {
                    Some(record) => {
                        warn!(key = %key, error = %cause, "api: get failed; serving cached copy");
                        Ok(Read { record, origin: Origin::Cache })
                    }
                    None => Err(MirrorError::Unavailable(cause)),
                }
            }
        }
    }

    pub fn cache(&self) -> &ResourceCache {
        &self.cache
    }

    pub fn stats(&self, target: &WatchTarget) -> Option<HandlerStats> {
        self.mux.stats(target)
    }
}
