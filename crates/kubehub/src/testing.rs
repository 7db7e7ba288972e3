//! In-memory `WatchSource` for tests: each `open` consumes the next scripted
//! session (or failure), and events are pushed by the test as it goes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Result};
use futures::StreamExt;
use tether_core::{ChangeEvent, EventType, ResourceKey, ResourceRecord, WatchTarget};
use tokio::sync::mpsc;

use crate::source::{EventStream, WatchRequest, WatchSource};

type Feed = mpsc::UnboundedReceiver<Result<ChangeEvent>>;

enum Script {
    Session(Feed),
    Fail(String),
}

/// Build a record with the metadata the watch layer cares about.
pub fn record(namespace: &str, name: &str, resource_version: u64, generation: i64) -> ResourceRecord {
    let raw = serde_json::json!({
        "metadata": {
            "name": name,
            "namespace": namespace,
            "resourceVersion": resource_version.to_string(),
            "generation": generation,
        }
    });
    ResourceRecord::from_raw(raw)
}

/// Handle for feeding one upstream session. Dropping it ends the stream.
pub struct Session {
    tx: mpsc::UnboundedSender<Result<ChangeEvent>>,
}

impl Session {
    pub fn send(&self, ev: ChangeEvent) {
        let _ = self.tx.send(Ok(ev));
    }

    pub fn added(&self, rec: &ResourceRecord) {
        self.send(ChangeEvent::new(EventType::Added, rec.clone()));
    }

    pub fn modified(&self, rec: &ResourceRecord) {
        self.send(ChangeEvent::new(EventType::Modified, rec.clone()));
    }

    pub fn deleted(&self, rec: &ResourceRecord) {
        self.send(ChangeEvent::new(EventType::Deleted, rec.clone()));
    }

    pub fn bookmark(&self, resource_version: u64) {
        self.send(ChangeEvent::bookmark(resource_version.to_string()));
    }

    /// In-stream ERROR event (e.g. "too old resource version").
    pub fn error(&self, message: &str) {
        self.send(ChangeEvent::error(message));
    }

    /// Transport-level failure on the stream.
    pub fn fail(&self, message: &str) {
        let _ = self.tx.send(Err(anyhow!(message.to_string())));
    }

    /// True once the consumer dropped the stream.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn close(self) {}
}

pub struct ScriptedSource {
    scripts_tx: mpsc::UnboundedSender<Script>,
    scripts_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Script>>,
    requests: Mutex<Vec<(WatchTarget, WatchRequest)>>,
    objects: Mutex<HashMap<ResourceKey, ResourceRecord>>,
    unavailable: AtomicBool,
}

impl Default for ScriptedSource {
    fn default() -> Self {
        let (scripts_tx, scripts_rx) = mpsc::unbounded_channel();
        Self {
            scripts_tx,
            scripts_rx: tokio::sync::Mutex::new(scripts_rx),
            requests: Mutex::new(Vec::new()),
            objects: Mutex::new(HashMap::new()),
            unavailable: AtomicBool::new(false),
        }
    }
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the next successful `open`. Opens with nothing queued wait.
    pub fn session(&self) -> Session {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.scripts_tx.send(Script::Session(rx));
        Session { tx }
    }

    /// Queue a failed `open`.
    pub fn fail_next(&self, reason: &str) {
        let _ = self.scripts_tx.send(Script::Fail(reason.to_string()));
    }

    /// Requests seen so far, in order.
    pub fn requests(&self) -> Vec<WatchRequest> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner).iter().map(|(_, r)| r.clone()).collect()
    }

    pub fn put(&self, kind: &str, rec: ResourceRecord) {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner).insert(rec.key(kind), rec);
    }

    /// Make `get` fail as if the API server were down.
    pub fn set_unavailable(&self, down: bool) {
        self.unavailable.store(down, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl WatchSource for ScriptedSource {
    async fn open(&self, target: &WatchTarget, request: &WatchRequest) -> Result<EventStream> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((target.clone(), request.clone()));
        let mut scripts = self.scripts_rx.lock().await;
        match scripts.recv().await {
            Some(Script::Session(feed)) => {
                Ok(futures::stream::unfold(feed, |mut feed| async move { feed.recv().await.map(|item| (item, feed)) })
                    .boxed())
            }
            Some(Script::Fail(reason)) => Err(anyhow!(reason)),
            None => Err(anyhow!("no scripted session")),
        }
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceRecord>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        Ok(self.objects.lock().unwrap_or_else(PoisonError::into_inner).get(key).cloned())
    }
}
