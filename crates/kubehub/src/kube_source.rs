//! `WatchSource` backed by a live API server through kube-rs.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, WatchEvent, WatchParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tether_core::{ChangeEvent, EventType, ResourceKey, ResourceRecord, WatchTarget};
use tracing::{debug, info};

use crate::source::{EventStream, WatchRequest, WatchSource};

/// Parse `v1/Kind` or `group/v1/Kind`.
pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

fn record_from_meta(meta: &ObjectMeta, raw: serde_json::Value) -> ResourceRecord {
    ResourceRecord {
        namespace: meta.namespace.clone().unwrap_or_default(),
        name: meta.name.clone().unwrap_or_default(),
        uid: meta.uid.clone(),
        resource_version: meta.resource_version.clone().unwrap_or_default(),
        generation: meta.generation.unwrap_or(0),
        labels: meta.labels.clone().unwrap_or_default(),
        annotations: meta.annotations.clone().unwrap_or_default(),
        raw,
    }
}

fn record_from(obj: &DynamicObject) -> Result<ResourceRecord> {
    let mut raw = serde_json::to_value(obj).context("serializing DynamicObject")?;
    strip_managed_fields(&mut raw);
    Ok(record_from_meta(&obj.metadata, raw))
}

fn change_from(ev: WatchEvent<DynamicObject>) -> Result<ChangeEvent> {
    Ok(match ev {
        WatchEvent::Added(o) => ChangeEvent::new(EventType::Added, record_from(&o)?),
        WatchEvent::Modified(o) => ChangeEvent::new(EventType::Modified, record_from(&o)?),
        WatchEvent::Deleted(o) => ChangeEvent::new(EventType::Deleted, record_from(&o)?),
        WatchEvent::Bookmark(b) => ChangeEvent::bookmark(b.metadata.resource_version),
        WatchEvent::Error(e) => ChangeEvent::error(format!("{} ({}): {}", e.reason, e.code, e.message)),
    })
}

/// Watches and reads arbitrary kinds (incl. CRDs) as `DynamicObject`s.
pub struct KubeSource {
    client: Client,
    resolved: Mutex<HashMap<String, (ApiResource, bool)>>,
}

impl KubeSource {
    pub fn new(client: Client) -> Self {
        Self { client, resolved: Mutex::new(HashMap::new()) }
    }

    /// Connect using the ambient kubeconfig or in-cluster config.
    pub async fn try_default() -> Result<Self> {
        let client = Client::try_default().await.context("building kube client")?;
        Ok(Self::new(client))
    }

    /// Resolve a GVK key to its `ApiResource` and scope. Discovery runs once per key.
    async fn resolve(&self, gvk_key: &str) -> Result<(ApiResource, bool)> {
        if let Some(hit) = self.resolved.lock().unwrap_or_else(PoisonError::into_inner).get(gvk_key).cloned() {
            return Ok(hit);
        }
        let gvk = parse_gvk_key(gvk_key)?;
        let discovery = Discovery::new(self.client.clone()).run().await.context("running API discovery")?;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    debug!(gvk = %gvk_key, plural = %ar.plural, namespaced, "resolved api resource");
                    let found = (ar.clone(), namespaced);
                    self.resolved
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .insert(gvk_key.to_string(), found.clone());
                    return Ok(found);
                }
            }
        }
        Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
    }

    fn api(&self, ar: &ApiResource, namespaced: bool, namespace: Option<&str>) -> Api<DynamicObject> {
        match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, ar),
            _ => Api::all_with(self.client.clone(), ar),
        }
    }
}

fn watch_params(request: &WatchRequest) -> WatchParams {
    let mut wp = WatchParams::default();
    if !request.allow_bookmarks {
        wp = wp.disable_bookmarks();
    }
    if let Some(selector) = request.label_selector.as_deref() {
        wp = wp.labels(selector);
    }
    if let Some(secs) = request.timeout_secs {
        wp = wp.timeout(secs);
    }
    wp
}

#[async_trait::async_trait]
impl WatchSource for KubeSource {
    async fn open(&self, target: &WatchTarget, request: &WatchRequest) -> Result<EventStream> {
        let (ar, namespaced) = self.resolve(&target.gvk).await?;
        let api = self.api(&ar, namespaced, target.namespace.as_deref());
        let wp = watch_params(request);
        // "0" lets the server start from any state and replay it as ADDED.
        let version = request.resource_version.as_deref().unwrap_or("0");
        let stream = api
            .watch(&wp, version)
            .await
            .with_context(|| format!("watching {} from rv {}", target, version))?;
        info!(target = %target, rv = %version, "watch request accepted");
        Ok(stream.map(|item| item.map_err(anyhow::Error::from).and_then(change_from)).boxed())
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<ResourceRecord>> {
        let (ar, namespaced) = self.resolve(&key.kind).await?;
        if namespaced && key.namespace.is_empty() {
            return Err(anyhow!("namespace required for namespaced kind {}", key.kind));
        }
        let ns = (!key.namespace.is_empty()).then_some(key.namespace.as_str());
        let api = self.api(&ar, namespaced, ns);
        match api.get_opt(&key.name).await.with_context(|| format!("getting {}", key))? {
            Some(obj) => Ok(Some(record_from(&obj)?)),
            None => Ok(None),
        }
    }
}
