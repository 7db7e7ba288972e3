//! The seam between the watch machinery and a remote API server.

use anyhow::Result;
use futures::stream::BoxStream;
use tether_core::{ChangeEvent, ResourceKey, ResourceRecord, WatchTarget};

/// Change events as they arrive from one watch request.
pub type EventStream = BoxStream<'static, Result<ChangeEvent>>;

/// Options for one watch request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchRequest {
    /// Server-side label selector (`app=web,tier`).
    pub label_selector: Option<String>,
    pub allow_bookmarks: bool,
    /// Resume point. `None` asks the server to replay current state as ADDED.
    pub resource_version: Option<String>,
    pub timeout_secs: Option<u32>,
}

impl WatchRequest {
    pub fn new(label_selector: Option<String>, resource_version: Option<String>) -> Self {
        Self { label_selector, allow_bookmarks: true, resource_version, timeout_secs: None }
    }
}

/// A remote API exposing list/watch semantics.
#[async_trait::async_trait]
pub trait WatchSource: Send + Sync {
    /// Open one watch stream for `target`.
    async fn open(&self, target: &WatchTarget, request: &WatchRequest) -> Result<EventStream>;

    /// Authoritative single-object read. `Ok(None)` when the object does not exist.
    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceRecord>>;
}
