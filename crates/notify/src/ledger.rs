//! Per-generation record of the last event delivered for each resource.

use std::sync::Arc;

use rustc_hash::FxHashMap;
use tether_core::{EventType, ResourceRecord};

/// `(namespace, name)`; the kind is fixed per handler.
pub type LedgerKey = (String, String);

pub fn key_of(rec: &ResourceRecord) -> LedgerKey {
    (rec.namespace.clone(), rec.name.clone())
}

/// True if `candidate` is a later version than `last`.
///
/// Resource versions are opaque, but every API server in practice issues
/// decimal counters; those are compared numerically. Anything else only
/// distinguishes "same" from "different".
pub fn supersedes(candidate: &str, last: &str) -> bool {
    match (candidate.parse::<u64>(), last.parse::<u64>()) {
        (Ok(c), Ok(l)) => c > l,
        _ => candidate != last,
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub resource_version: String,
    pub event_type: EventType,
    pub object: Arc<ResourceRecord>,
}

impl Entry {
    pub fn is_live(&self) -> bool {
        self.event_type != EventType::Deleted
    }
}

#[derive(Debug, Default)]
pub struct Ledger {
    entries: FxHashMap<LedgerKey, Entry>,
}

impl Ledger {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, key: &LedgerKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn get(&self, key: &LedgerKey) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&LedgerKey, &Entry)> {
        self.entries.iter()
    }

    /// Record a delivery. Returns false (and records nothing) when the
    /// version was already forwarded or is older than the last one.
    pub fn admit(&mut self, event_type: EventType, object: &Arc<ResourceRecord>, resource_version: &str) -> bool {
        let key = key_of(object);
        if let Some(last) = self.entries.get(&key) {
            if !supersedes(resource_version, &last.resource_version) {
                return false;
            }
        }
        self.entries.insert(
            key,
            Entry { resource_version: resource_version.to_string(), event_type, object: Arc::clone(object) },
        );
        true
    }

    /// Resolve a replayed ADDED: MODIFIED if the resource is already known and live.
    pub fn resolve_replay(&self, key: &LedgerKey) -> EventType {
        match self.entries.get(key) {
            Some(e) if e.is_live() => EventType::Modified,
            _ => EventType::Added,
        }
    }

    /// Forget deleted resources; live entries stay for future dedup.
    pub fn prune_deleted(&mut self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.is_live());
        before - self.entries.len()
    }

    /// Copy in entries for resources this ledger has not seen.
    pub fn carry_over(&mut self, older: &Ledger) {
        for (k, e) in older.entries.iter() {
            self.entries.entry(k.clone()).or_insert_with(|| e.clone());
        }
    }
}
