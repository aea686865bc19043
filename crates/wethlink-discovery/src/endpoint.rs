//! Endpoints and the operator-visible endpoint list

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::reconcile::Reconciliation;

/// Placeholder entry meaning "no device selected"
pub const NO_DEVICE: &str = "No device";

/// A transport address candidate, e.g. `/dev/ttyUSB0`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Endpoint(pub String);

impl Endpoint {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the "no device" placeholder
    pub fn is_sentinel(&self) -> bool {
        self.0 == NO_DEVICE
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Endpoint {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Endpoint {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Selectable endpoints in stable display order.
///
/// The sentinel is implicit: it is always shown first and is never stored,
/// added or removed.
#[derive(Debug, Clone, Default)]
pub struct EndpointList {
    entries: Vec<Endpoint>,
}

impl EndpointList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Known endpoints, without the sentinel
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.entries
    }

    pub fn contains(&self, endpoint: &Endpoint) -> bool {
        self.entries.contains(endpoint)
    }

    /// Append if absent. Returns true when the list changed.
    pub fn insert(&mut self, endpoint: Endpoint) -> bool {
        if endpoint.is_sentinel() || self.contains(&endpoint) {
            return false;
        }
        self.entries.push(endpoint);
        true
    }

    pub fn remove(&mut self, endpoint: &Endpoint) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e != endpoint);
        self.entries.len() != before
    }

    /// Apply a reconciliation: removals first, then additions in order
    pub fn apply(&mut self, changes: &Reconciliation) {
        for endpoint in &changes.to_remove {
            self.remove(endpoint);
        }
        for endpoint in &changes.to_add {
            self.insert(endpoint.clone());
        }
    }

    /// Entries as shown to the operator, sentinel first
    pub fn display_names(&self) -> Vec<String> {
        std::iter::once(NO_DEVICE.to_string())
            .chain(self.entries.iter().map(|e| e.0.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinel_always_first() {
        let mut list = EndpointList::new();
        assert_eq!(list.display_names(), vec![NO_DEVICE.to_string()]);

        list.insert("/dev/ttyUSB1".into());
        list.insert("/dev/ttyUSB0".into());
        assert_eq!(
            list.display_names(),
            vec![NO_DEVICE, "/dev/ttyUSB1", "/dev/ttyUSB0"]
        );
    }

    #[test]
    fn test_sentinel_never_stored() {
        let mut list = EndpointList::new();
        assert!(!list.insert(NO_DEVICE.into()));
        assert!(list.is_empty());

        let changes = Reconciliation {
            to_add: vec![NO_DEVICE.into(), "/dev/ttyACM0".into()],
            to_remove: vec![NO_DEVICE.into()],
        };
        list.apply(&changes);
        assert_eq!(list.display_names(), vec![NO_DEVICE, "/dev/ttyACM0"]);
    }

    #[test]
    fn test_insert_is_idempotent() {
        let mut list = EndpointList::new();
        assert!(list.insert("/dev/ttyUSB0".into()));
        assert!(!list.insert("/dev/ttyUSB0".into()));
        assert_eq!(list.len(), 1);
        assert!(list.remove(&"/dev/ttyUSB0".into()));
        assert!(!list.remove(&"/dev/ttyUSB0".into()));
    }
}
