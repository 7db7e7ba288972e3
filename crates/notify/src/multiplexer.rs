use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, gauge, histogram};
use tether_core::{ChangeEvent, EventType, Filter, WatchConfig, WatchError, WatchTarget};
use tether_kubehub::{conn, WatchItem, WatchSource};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::generation::{Delivery, Generation, Subscriber};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Point-in-time view of one shared handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerStats {
    pub generations: usize,
    pub subscribers: usize,
    /// Resources tracked by the newest generation.
    pub resources: usize,
}

struct Registry {
    source: Arc<dyn WatchSource>,
    cfg: WatchConfig,
    handlers: Mutex<HashMap<WatchTarget, Arc<Handler>>>,
    next_id: AtomicU64,
}

impl Registry {
    /// Drop `handler` from the map unless a newer one already took its place.
    fn forget(&self, handler: &Arc<Handler>) {
        let mut handlers = lock(&self.handlers);
        if handlers.get(&handler.target).is_some_and(|h| Arc::ptr_eq(h, handler)) {
            handlers.remove(&handler.target);
        }
    }
}

struct Chain {
    head: Generation,
    stopped: bool,
    sessions: u64,
}

/// Shared state for one target: the generation chain plus the connection
/// feeding it.
struct Handler {
    target: WatchTarget,
    chain: Mutex<Chain>,
    /// Cancels the upstream connection and the relay task.
    stop: CancellationToken,
    /// Subscriber tokens for the relay task to watch.
    reaper: mpsc::UnboundedSender<(u64, CancellationToken)>,
}

impl Handler {
    fn start(registry: &Arc<Registry>, target: WatchTarget) -> Arc<Handler> {
        let stop = CancellationToken::new();
        let (reaper_tx, reaper_rx) = mpsc::unbounded_channel();
        let handler = Arc::new(Handler {
            target: target.clone(),
            chain: Mutex::new(Chain { head: Generation::first(1), stopped: false, sessions: 0 }),
            stop: stop.clone(),
            reaper: reaper_tx,
        });
        let upstream = conn::spawn(registry.source.clone(), target.clone(), None, registry.cfg.clone(), stop.child_token());
        tokio::spawn(relay(handler.clone(), Arc::downgrade(registry), upstream, reaper_rx, registry.cfg.delivery_timeout));
        counter!("tether_mux_handlers_started_total", 1, "gvk" => target.gvk.clone());
        info!(target = %target, "shared watch started");
        handler
    }

    fn begin_session(&self, resumed: bool) {
        let mut chain = lock(&self.chain);
        chain.sessions += 1;
        if chain.sessions > 1 {
            let id = chain.head.id() + 1;
            chain.head.advance(id, resumed);
            debug!(target = %self.target, generation = id, resumed, depth = chain.head.depth(), "new generation");
        }
    }

    fn plan(&self, event: &ChangeEvent) -> Vec<Delivery> {
        let mut plan = Vec::new();
        let mut chain = lock(&self.chain);
        if chain.stopped {
            return plan;
        }
        if let Some(drain) = chain.head.dispatch(event, &mut plan) {
            if drain.retired > 0 {
                counter!("tether_mux_drains_total", 1, "gvk" => self.target.gvk.clone());
                debug!(
                    target = %self.target,
                    retired = drain.retired,
                    absorbed = drain.absorbed,
                    deletes = drain.synthesized_deletes,
                    pruned = drain.pruned,
                    "ancestors drained"
                );
            }
        }
        plan
    }

    /// Detach subscribers. The last one out shuts the handler down.
    fn remove(self: &Arc<Self>, ids: &[u64], registry: &Weak<Registry>, reason: &str) {
        let mut detached = Vec::new();
        let (remaining, emptied) = {
            let mut chain = lock(&self.chain);
            for id in ids {
                if let Some(sub) = chain.head.detach(*id) {
                    detached.push((*id, sub));
                }
            }
            let remaining = chain.head.subscriber_count();
            let emptied = !detached.is_empty() && !chain.stopped && remaining == 0;
            if emptied {
                chain.stopped = true;
            }
            (remaining, emptied)
        };
        if detached.is_empty() {
            return;
        }
        for (id, _) in detached.iter() {
            debug!(target = %self.target, subscriber = id, reason, remaining, "subscriber detached");
        }
        gauge!("tether_mux_subscribers", remaining as f64, "gvk" => self.target.gvk.clone());
        drop(detached);
        if emptied {
            info!(target = %self.target, "last subscriber gone; stopping shared watch");
            self.stop.cancel();
            if let Some(reg) = registry.upgrade() {
                reg.forget(self);
            }
        }
    }

    /// Close every queue and retire the handler.
    fn shutdown(self: &Arc<Self>, registry: &Weak<Registry>, reason: &str) {
        let subs = {
            let mut chain = lock(&self.chain);
            chain.stopped = true;
            chain.head.drain_subscribers()
        };
        gauge!("tether_mux_subscribers", 0.0, "gvk" => self.target.gvk.clone());
        info!(target = %self.target, closed = subs.len(), reason, "shared watch stopped");
        drop(subs);
        self.stop.cancel();
        if let Some(reg) = registry.upgrade() {
            reg.forget(self);
        }
    }

    fn stats(&self) -> HandlerStats {
        let chain = lock(&self.chain);
        HandlerStats {
            generations: chain.head.depth(),
            subscribers: chain.head.subscriber_count(),
            resources: chain.head.resources(),
        }
    }
}

/// Send each planned event with a bounded wait. Returns the subscribers
/// that timed out or went away.
async fn deliver(plan: Vec<Delivery>, timeout: Duration, target: &WatchTarget) -> Vec<u64> {
    let mut failed: Vec<u64> = Vec::new();
    for d in plan {
        if failed.contains(&d.subscriber) {
            continue;
        }
        match d.tx.send_timeout(d.event, timeout).await {
            Ok(()) => {}
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(target = %target, subscriber = d.subscriber, timeout_ms = %timeout.as_millis(), "subscriber too slow; evicting");
                counter!("tether_mux_slow_evictions_total", 1, "gvk" => target.gvk.clone());
                failed.push(d.subscriber);
            }
            Err(SendTimeoutError::Closed(_)) => failed.push(d.subscriber),
        }
    }
    failed
}

/// One task per handler: applies upstream items to the chain, delivers the
/// resulting events and detaches subscribers whose tokens fire.
async fn relay(
    handler: Arc<Handler>,
    registry: Weak<Registry>,
    mut upstream: mpsc::Receiver<WatchItem>,
    mut reaper: mpsc::UnboundedReceiver<(u64, CancellationToken)>,
    timeout: Duration,
) {
    let gvk = handler.target.gvk.clone();
    let mut cancelled = FuturesUnordered::new();
    loop {
        tokio::select! {
            _ = handler.stop.cancelled() => break,
            Some((id, token)) = reaper.recv() => {
                cancelled.push(async move {
                    token.cancelled_owned().await;
                    id
                });
            }
            Some(id) = cancelled.next(), if !cancelled.is_empty() => {
                handler.remove(&[id], &registry, "cancelled");
            }
            item = upstream.recv() => match item {
                Some(WatchItem::Opened { resumed }) => handler.begin_session(resumed),
                Some(WatchItem::Event(ev)) => {
                    let terminal = ev.event_type == EventType::Error;
                    let t0 = Instant::now();
                    let plan = handler.plan(&ev);
                    let planned = plan.len();
                    let failed = deliver(plan, timeout, &handler.target).await;
                    histogram!("tether_mux_fanout_ms", t0.elapsed().as_secs_f64() * 1000.0, "gvk" => gvk.clone());
                    trace!(target = %handler.target, event = %ev.event_type, rv = %ev.resource_version, planned, "relayed");
                    if !failed.is_empty() {
                        handler.remove(&failed, &registry, "delivery failed");
                    }
                    if terminal {
                        handler.shutdown(&registry, "upstream failed");
                        break;
                    }
                }
                None => {
                    handler.shutdown(&registry, "upstream ended");
                    break;
                }
            }
        }
    }
}

/// Shares one upstream watch per target among any number of subscribers.
///
/// Handlers are created on first subscribe and torn down when their last
/// subscriber leaves. Must be used from within a Tokio runtime.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Registry>,
}

impl Multiplexer {
    pub fn new(source: Arc<dyn WatchSource>, cfg: WatchConfig) -> Self {
        Self {
            inner: Arc::new(Registry {
                source,
                cfg,
                handlers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn subscribe(&self, target: WatchTarget, filter: Filter) -> Result<Subscription, WatchError> {
        self.subscribe_with(target, filter, None)
    }

    /// Subscribe; cancelling `parent` (if given) unsubscribes.
    pub fn subscribe_with(
        &self,
        target: WatchTarget,
        filter: Filter,
        parent: Option<&CancellationToken>,
    ) -> Result<Subscription, WatchError> {
        if target.gvk.trim().is_empty() {
            return Err(WatchError::InvalidTarget("empty gvk".into()));
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.map(|p| p.child_token()).unwrap_or_default();
        let capacity = self.inner.cfg.queue_capacity.max(1);

        let mut handlers = lock(&self.inner.handlers);
        loop {
            let handler = handlers
                .entry(target.clone())
                .or_insert_with(|| Handler::start(&self.inner, target.clone()))
                .clone();
            let mut chain = lock(&handler.chain);
            if chain.stopped {
                // Shutting down; replace it.
                drop(chain);
                handlers.remove(&target);
                continue;
            }
            let primed: Vec<_> = chain.head.snapshot().into_iter().filter(|r| filter.matches(r)).collect();
            let (tx, rx) = mpsc::channel(capacity + primed.len());
            for rec in primed.iter() {
                let rv = rec.resource_version.clone();
                let _ = tx.try_send(ChangeEvent::from_shared(EventType::Added, rec.clone(), rv));
            }
            let joined = chain.head.oldest_mut();
            joined.attach(id, Subscriber { filter, tx });
            let generation = joined.id();
            let count = chain.head.subscriber_count();
            drop(chain);
            if handler.reaper.send((id, token.clone())).is_err() {
                debug!(target = %target, subscriber = id, "relay task gone; parent token not watched");
            }
            gauge!("tether_mux_subscribers", count as f64, "gvk" => target.gvk.clone());
            debug!(target = %target, subscriber = id, generation, primed = primed.len(), "subscriber attached");
            let handle = Unsubscribe {
                id,
                handler: Arc::downgrade(&handler),
                registry: Arc::downgrade(&self.inner),
                token,
            };
            return Ok(Subscription { target, rx, handle });
        }
    }

    /// Stats for the handler serving `target`, if one is running.
    pub fn stats(&self, target: &WatchTarget) -> Option<HandlerStats> {
        let handler = lock(&self.inner.handlers).get(target).cloned();
        handler.map(|h| h.stats())
    }

    /// Targets with a running handler.
    pub fn targets(&self) -> Vec<WatchTarget> {
        lock(&self.inner.handlers).keys().cloned().collect()
    }
}

/// Detaches one subscriber. Cloneable, idempotent.
#[derive(Clone)]
pub struct Unsubscribe {
    id: u64,
    handler: Weak<Handler>,
    registry: Weak<Registry>,
    token: CancellationToken,
}

impl Unsubscribe {
    pub fn unsubscribe(&self) {
        self.token.cancel();
        if let Some(handler) = self.handler.upgrade() {
            handler.remove(&[self.id], &self.registry, "unsubscribed");
        }
    }
}

/// A subscriber's end of a shared watch. Dropping it unsubscribes.
pub struct Subscription {
    target: WatchTarget,
    rx: mpsc::Receiver<ChangeEvent>,
    handle: Unsubscribe,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn target(&self) -> &WatchTarget {
        &self.target
    }

    /// Next event, or `None` once the stream is closed.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }

    pub fn handle(&self) -> Unsubscribe {
        self.handle.clone()
    }

    pub fn unsubscribe(&self) {
        self.handle.unsubscribe();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.unsubscribe();
    }
}
