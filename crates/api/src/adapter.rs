//! Keeps a [`ResourceCache`] in step with one shared watch.

use std::time::Instant;

use metrics::counter;
use tether_core::{AdapterConfig, ChangeEvent, EventType, Filter, ResourceRecord, WatchTarget};
use tether_notify::Multiplexer;
use tether_store::ResourceCache;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Apply one event to the cache. Returns false for events that do not touch it.
pub fn apply(cache: &ResourceCache, kind: &str, ev: &ChangeEvent) -> bool {
    let rec: &ResourceRecord = &ev.object;
    match ev.event_type {
        EventType::Added => {
            cache.set(kind, &rec.namespace, &rec.name, rec);
        }
        EventType::Modified => {
            cache.delete(kind, &rec.namespace, &rec.name);
            cache.set(kind, &rec.namespace, &rec.name, rec);
        }
        EventType::Deleted => cache.delete(kind, &rec.namespace, &rec.name),
        EventType::Bookmark | EventType::Error => return false,
    }
    true
}

pub struct CacheAdapter {
    mux: Multiplexer,
    cache: ResourceCache,
    target: WatchTarget,
    cfg: AdapterConfig,
}

impl CacheAdapter {
    pub fn new(mux: Multiplexer, cache: ResourceCache, target: WatchTarget, cfg: AdapterConfig) -> Self {
        Self { mux, cache, target, cfg }
    }

    /// Mirror events until `token` is cancelled, re-subscribing (and so
    /// taking a fresh full state) whenever the stream closes underneath us.
    pub async fn run(self, token: CancellationToken) {
        let kind = self.target.gvk.clone();
        info!(target = %self.target, "cache adapter started");
        loop {
            let mut sub = match self.mux.subscribe_with(self.target.clone(), Filter::new(), Some(&token)) {
                Ok(s) => s,
                Err(e) => {
                    error!(target = %self.target, error = %e, "cache adapter cannot subscribe");
                    return;
                }
            };
            let t0 = Instant::now();
            let mut applied = 0u64;
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!(target = %self.target, applied, "cache adapter stopped");
                        return;
                    }
                    ev = sub.recv() => match ev {
                        Some(ev) => {
                            if ev.event_type == EventType::Error {
                                warn!(target = %self.target, message = ?ev.message, "upstream failed under cache adapter");
                            }
                            if apply(&self.cache, &kind, &ev) {
                                applied += 1;
                            }
                        }
                        None => break,
                    }
                }
            }
            warn!(
                target = %self.target,
                applied,
                ran_ms = %t0.elapsed().as_millis(),
                retry_ms = %self.cfg.retry_interval.as_millis(),
                "cache adapter stream closed; resubscribing"
            );
            counter!("tether_adapter_resubscribes_total", 1, "gvk" => kind.clone());
            drop(sub);
            tokio::select! {
                _ = token.cancelled() => {
                    debug!(target = %self.target, "cache adapter cancelled while waiting to resubscribe");
                    return;
                }
                _ = tokio::time::sleep(self.cfg.retry_interval) => {}
            }
        }
    }
}
