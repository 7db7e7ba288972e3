//! Subscriber-side label/annotation filters.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::{ResourceRecord, WatchError};

/// Selector value matching any value of a present key.
pub const WILDCARD: &str = "*";

type Selectors = SmallVec<[(String, String); 4]>;

/// Label and annotation requirements plus delivery preferences.
///
/// Every selector must hold for a record to match. A value of `*` only
/// requires the key to be present. An empty filter matches everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Filter {
    pub labels: Selectors,
    pub annotations: Selectors,
    pub wants_bookmarks: bool,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    pub fn annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.push((key.into(), value.into()));
        self
    }

    pub fn bookmarks(mut self, on: bool) -> Self {
        self.wants_bookmarks = on;
        self
    }

    pub fn matches(&self, record: &ResourceRecord) -> bool {
        satisfied(&self.labels, &record.labels) && satisfied(&self.annotations, &record.annotations)
    }

    /// Render the label part as a Kubernetes label selector.
    ///
    /// Annotations cannot be selected server-side, so a filter carrying any is
    /// rejected rather than silently widened.
    pub fn label_selector(&self) -> Result<Option<String>, WatchError> {
        if !self.annotations.is_empty() {
            let keys: Vec<&str> = self.annotations.iter().map(|(k, _)| k.as_str()).collect();
            return Err(WatchError::UnsupportedFilter(format!(
                "annotation selectors are not supported by the watch protocol: {}",
                keys.join(",")
            )));
        }
        if self.labels.is_empty() {
            return Ok(None);
        }
        let parts: Vec<String> = self
            .labels
            .iter()
            .map(|(k, v)| if v == WILDCARD { k.clone() } else { format!("{}={}", k, v) })
            .collect();
        Ok(Some(parts.join(",")))
    }
}

fn satisfied(selectors: &Selectors, present: &std::collections::BTreeMap<String, String>) -> bool {
    selectors.iter().all(|(k, want)| match present.get(k) {
        Some(_) if want == WILDCARD => true,
        Some(have) => have == want,
        None => false,
    })
}

/// Parse `key=value` (or a bare `key`, meaning any value) from the command line.
pub fn parse_pair(s: &str) -> Result<(String, String), WatchError> {
    let (k, v) = match s.split_once('=') {
        Some((k, v)) => (k.trim(), v.trim()),
        None => (s.trim(), WILDCARD),
    };
    if k.is_empty() {
        return Err(WatchError::UnsupportedFilter(format!("empty key in selector {:?}", s)));
    }
    Ok((k.to_string(), v.to_string()))
}
