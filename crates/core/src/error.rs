//! Error taxonomy surfaced to callers of the watch layer.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum WatchError {
    /// The filter cannot be expressed on the wire (annotations have no server-side selector).
    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// The upstream watch failed for good; carries the server's message.
    #[error("upstream: {0}")]
    Upstream(String),
}
