//! Tether core types: resource records, change events and watch targets.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub mod config;
pub mod error;
pub mod filter;

pub use config::{AdapterConfig, CacheConfig, WatchConfig};
pub use error::WatchError;
pub use filter::Filter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
    /// Checkpoint: every change up to the carried resourceVersion has been sent.
    Bookmark,
    Error,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Added => "ADDED",
            EventType::Modified => "MODIFIED",
            EventType::Deleted => "DELETED",
            EventType::Bookmark => "BOOKMARK",
            EventType::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Identity of one resource instance. Stable across its lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub kind: String,
    /// Empty for cluster-scoped resources.
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind: kind.into(), namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}:{}", self.kind, self.name)
        } else {
            write!(f, "{}:{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// A resource as observed on the wire, shaped for filtering and caching.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ResourceRecord {
    pub namespace: String,
    pub name: String,
    pub uid: Option<String>,
    /// Opaque version token assigned by the API server.
    pub resource_version: String,
    /// `metadata.generation`; bumped on spec changes. Zero when absent.
    pub generation: i64,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Full object (managed fields stripped).
    pub raw: serde_json::Value,
}

impl ResourceRecord {
    /// Shape a record from a raw Kubernetes object.
    pub fn from_raw(raw: serde_json::Value) -> Self {
        let meta = raw.get("metadata");
        let text = |field: &str| {
            meta.and_then(|m| m.get(field)).and_then(|v| v.as_str()).unwrap_or("").to_string()
        };
        let pairs = |field: &str| -> BTreeMap<String, String> {
            meta.and_then(|m| m.get(field))
                .and_then(|m| m.as_object())
                .map(|obj| {
                    obj.iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                        .collect()
                })
                .unwrap_or_default()
        };
        let uid = meta.and_then(|m| m.get("uid")).and_then(|v| v.as_str()).map(|s| s.to_string());
        let generation = meta.and_then(|m| m.get("generation")).and_then(|v| v.as_i64()).unwrap_or(0);
        Self {
            namespace: text("namespace"),
            name: text("name"),
            uid,
            resource_version: text("resourceVersion"),
            generation,
            labels: pairs("labels"),
            annotations: pairs("annotations"),
            raw,
        }
    }

    pub fn key(&self, kind: &str) -> ResourceKey {
        ResourceKey::new(kind, self.namespace.clone(), self.name.clone())
    }
}

/// One change observed on a watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event_type: EventType,
    pub object: Arc<ResourceRecord>,
    pub resource_version: String,
    /// Server-provided detail for `Error` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ChangeEvent {
    pub fn new(event_type: EventType, object: ResourceRecord) -> Self {
        let resource_version = object.resource_version.clone();
        Self { event_type, object: Arc::new(object), resource_version, message: None }
    }

    /// Build an event around an already shared record.
    pub fn from_shared(event_type: EventType, object: Arc<ResourceRecord>, resource_version: impl Into<String>) -> Self {
        Self { event_type, object, resource_version: resource_version.into(), message: None }
    }

    pub fn bookmark(resource_version: impl Into<String>) -> Self {
        let resource_version = resource_version.into();
        let object = ResourceRecord { resource_version: resource_version.clone(), ..Default::default() };
        Self { event_type: EventType::Bookmark, object: Arc::new(object), resource_version, message: None }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            event_type: EventType::Error,
            object: Arc::new(ResourceRecord::default()),
            resource_version: String::new(),
            message: Some(message.into()),
        }
    }

    /// Same payload, different type. The object is shared, not copied.
    pub fn retyped(&self, event_type: EventType) -> Self {
        Self { event_type, ..self.clone() }
    }
}

/// One upstream watch scope: a GVK key (`v1/ConfigMap`, `apps/v1/Deployment`)
/// plus an optional namespace (`None` watches all namespaces).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct WatchTarget {
    pub gvk: String,
    pub namespace: Option<String>,
}

impl WatchTarget {
    pub fn new(gvk: impl Into<String>, namespace: Option<&str>) -> Self {
        Self { gvk: gvk.into(), namespace: namespace.map(|s| s.to_string()) }
    }
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.gvk, self.namespace.as_deref().unwrap_or("(all)"))
    }
}

pub mod prelude {
    pub use super::{ChangeEvent, EventType, Filter, ResourceKey, ResourceRecord, WatchError, WatchTarget};
}
