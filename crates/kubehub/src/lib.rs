//! Tether kubehub – watch sources and the per-target connection state machine

#![forbid(unsafe_code)]

use std::sync::Arc;

use tether_core::{Filter, WatchConfig, WatchError, WatchTarget};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod backoff;
pub mod conn;
pub mod kube_source;
pub mod source;
pub mod testing;

pub use conn::WatchItem;
pub use kube_source::KubeSource;
pub use source::{EventStream, WatchRequest, WatchSource};

/// Start a dedicated (unshared) watch whose label selector is sent to the server.
///
/// Fails synchronously when the filter cannot be expressed on the wire.
pub fn watch(
    source: Arc<dyn WatchSource>,
    target: WatchTarget,
    filter: &Filter,
    cfg: WatchConfig,
    token: CancellationToken,
) -> Result<mpsc::Receiver<WatchItem>, WatchError> {
    if target.gvk.trim().is_empty() {
        return Err(WatchError::InvalidTarget("empty gvk".into()));
    }
    let selector = filter.label_selector()?;
    info!(target = %target, selector = ?selector, "direct watch requested");
    Ok(conn::spawn(source, target, selector, cfg, token))
}
