//! Generation chain for one shared watch.
//!
//! Each upstream session gets its own [`Generation`]. When a session is
//! replaced, the previous generation becomes the new one's ancestor and
//! keeps serving its subscribers: events are relayed newest to oldest and
//! every generation filters them through its own [`Ledger`], so nobody sees
//! a version twice. A bookmark on the newest session proves it has caught
//! up; at that point the ancestors are folded into it. Subscribers arriving
//! mid-reconnect join the oldest generation and are folded in the same way.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tether_core::{ChangeEvent, EventType, Filter, ResourceRecord};
use tokio::sync::mpsc;

use crate::ledger::{key_of, Ledger, LedgerKey};

pub struct Subscriber {
    pub filter: Filter,
    pub tx: mpsc::Sender<ChangeEvent>,
}

/// One pending send, computed under the chain lock and performed outside it.
pub struct Delivery {
    pub subscriber: u64,
    pub tx: mpsc::Sender<ChangeEvent>,
    pub event: ChangeEvent,
}

#[derive(Debug, Clone, Copy)]
enum Relayed {
    Fresh(EventType),
    /// An ADDED from a newer session that the receiving generation may have
    /// seen already; resolved against its own ledger.
    Replay,
}

/// What a bookmark did to the chain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Drain {
    pub retired: usize,
    pub absorbed: usize,
    pub synthesized_deletes: usize,
    pub pruned: usize,
}

#[derive(Default)]
pub struct Generation {
    id: u64,
    /// Session continued from a bookmark rather than replaying all state.
    resumed: bool,
    subscribers: FxHashMap<u64, Subscriber>,
    ledger: Ledger,
    ancestor: Option<Box<Generation>>,
}

impl Generation {
    pub fn first(id: u64) -> Self {
        Self { id, ..Default::default() }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Start a new session in front of the current one.
    pub fn advance(&mut self, id: u64, resumed: bool) {
        let prev = std::mem::take(self);
        *self = Generation { id, resumed, ancestor: Some(Box::new(prev)), ..Default::default() };
    }

    pub fn depth(&self) -> usize {
        1 + self.ancestor.as_ref().map_or(0, |a| a.depth())
    }

    /// Subscribers across the whole chain.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len() + self.ancestor.as_ref().map_or(0, |a| a.subscriber_count())
    }

    /// Resources tracked by the newest generation.
    pub fn resources(&self) -> usize {
        self.ledger.len()
    }

    pub fn attach(&mut self, id: u64, sub: Subscriber) {
        self.subscribers.insert(id, sub);
    }

    /// Remove a subscriber wherever it lives in the chain.
    pub fn detach(&mut self, id: u64) -> Option<Subscriber> {
        match self.subscribers.remove(&id) {
            Some(sub) => Some(sub),
            None => self.ancestor.as_mut().and_then(|a| a.detach(id)),
        }
    }

    /// Take every subscriber out of the chain. Dropping them closes their queues.
    pub fn drain_subscribers(&mut self) -> Vec<Subscriber> {
        let mut out: Vec<Subscriber> = self.subscribers.drain().map(|(_, s)| s).collect();
        if let Some(a) = self.ancestor.as_mut() {
            out.extend(a.drain_subscribers());
        }
        out
    }

    /// The generation a subscriber joining now belongs to. Every event is
    /// relayed down to the oldest one, so its ledger matches [`snapshot`]
    /// and a replayed version is never delivered twice.
    ///
    /// [`snapshot`]: Generation::snapshot
    pub fn oldest_mut(&mut self) -> &mut Generation {
        match self.ancestor {
            Some(ref mut a) => a.oldest_mut(),
            None => self,
        }
    }

    /// Current live state, as seen by the oldest generation.
    pub fn snapshot(&self) -> Vec<Arc<ResourceRecord>> {
        let mut cur = self;
        while let Some(a) = cur.ancestor.as_deref() {
            cur = a;
        }
        cur.ledger.iter().filter(|(_, e)| e.is_live()).map(|(_, e)| Arc::clone(&e.object)).collect()
    }

    /// Route one upstream event through the chain, appending the resulting
    /// sends to `plan`. Bookmarks also fold the ancestors into this generation.
    pub fn dispatch(&mut self, event: &ChangeEvent, plan: &mut Vec<Delivery>) -> Option<Drain> {
        match event.event_type {
            EventType::Bookmark => Some(self.checkpoint(event, plan)),
            EventType::Error => {
                self.broadcast(event, plan);
                None
            }
            t => {
                self.relay(Relayed::Fresh(t), event, plan);
                None
            }
        }
    }

    fn relay(&mut self, how: Relayed, event: &ChangeEvent, plan: &mut Vec<Delivery>) {
        if let Some(ancestor) = self.ancestor.as_deref_mut() {
            let down = match how {
                // generation > 1 means the object was edited after creation, so an
                // older session has likely seen it before.
                Relayed::Fresh(EventType::Added) if event.object.generation > 1 => Relayed::Replay,
                other => other,
            };
            ancestor.relay(down, event, plan);
        }
        self.process(how, event, plan);
    }

    fn process(&mut self, how: Relayed, event: &ChangeEvent, plan: &mut Vec<Delivery>) {
        let event_type = match how {
            Relayed::Fresh(t) => t,
            Relayed::Replay => self.ledger.resolve_replay(&key_of(&event.object)),
        };
        if !self.ledger.admit(event_type, &event.object, &event.resource_version) {
            return;
        }
        let out = if event_type == event.event_type { event.clone() } else { event.retyped(event_type) };
        for (id, sub) in self.subscribers.iter() {
            if sub.filter.matches(&out.object) {
                plan.push(Delivery { subscriber: *id, tx: sub.tx.clone(), event: out.clone() });
            }
        }
    }

    fn broadcast(&self, event: &ChangeEvent, plan: &mut Vec<Delivery>) {
        for (id, sub) in self.subscribers.iter() {
            plan.push(Delivery { subscriber: *id, tx: sub.tx.clone(), event: event.clone() });
        }
        if let Some(a) = self.ancestor.as_deref() {
            a.broadcast(event, plan);
        }
    }

    /// Oldest first.
    fn take_ancestors(&mut self) -> Vec<Generation> {
        let mut out = Vec::new();
        let mut next = self.ancestor.take();
        while let Some(mut g) = next {
            next = g.ancestor.take();
            out.push(*g);
        }
        out.reverse();
        out
    }

    fn checkpoint(&mut self, bookmark: &ChangeEvent, plan: &mut Vec<Delivery>) -> Drain {
        let ancestors = self.take_ancestors();
        let mut drain = Drain { retired: ancestors.len(), ..Default::default() };

        if !ancestors.is_empty() {
            if self.resumed {
                // Incremental session: what the ancestors knew is still true
                // unless this session said otherwise.
                for g in ancestors.iter().rev() {
                    self.ledger.carry_over(&g.ledger);
                }
            } else {
                // Full replay finished: anything known before but not replayed is gone.
                let mut known: FxHashMap<LedgerKey, Arc<ResourceRecord>> = FxHashMap::default();
                for g in ancestors.iter() {
                    for (key, entry) in g.ledger.iter() {
                        if entry.is_live() {
                            known.insert(key.clone(), Arc::clone(&entry.object));
                        } else {
                            known.remove(key);
                        }
                    }
                    drain.synthesized_deletes += self.ghosts(&known, &g.subscribers, bookmark, plan);
                }
                drain.synthesized_deletes += self.ghosts(&known, &self.subscribers, bookmark, plan);
            }
            for g in ancestors {
                drain.absorbed += g.subscribers.len();
                self.subscribers.extend(g.subscribers);
            }
        }

        drain.pruned = self.ledger.prune_deleted();
        for (id, sub) in self.subscribers.iter() {
            if sub.filter.wants_bookmarks {
                plan.push(Delivery { subscriber: *id, tx: sub.tx.clone(), event: bookmark.clone() });
            }
        }
        drain
    }

    fn ghosts(
        &self,
        known: &FxHashMap<LedgerKey, Arc<ResourceRecord>>,
        subscribers: &FxHashMap<u64, Subscriber>,
        bookmark: &ChangeEvent,
        plan: &mut Vec<Delivery>,
    ) -> usize {
        let mut n = 0;
        for (key, object) in known.iter() {
            if self.ledger.contains(key) {
                continue;
            }
            for (id, sub) in subscribers.iter() {
                if sub.filter.matches(object) {
                    let event = ChangeEvent::from_shared(EventType::Deleted, Arc::clone(object), bookmark.resource_version.clone());
                    plan.push(Delivery { subscriber: *id, tx: sub.tx.clone(), event });
                    n += 1;
                }
            }
        }
        n
    }
}
