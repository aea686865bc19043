//! Reconciliation of known endpoints against live ones

use serde::Serialize;

use crate::endpoint::Endpoint;

/// Changes to bring the known list in line with what is live
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub to_add: Vec<Endpoint>,
    pub to_remove: Vec<Endpoint>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

/// Compare `known` with `live`.
///
/// Live endpoints that are not known and are not the connected endpoint are
/// added; known endpoints that are no longer live are removed. Order follows
/// the input lists. The sentinel is never part of either set.
pub fn reconcile(known: &[Endpoint], live: &[Endpoint], connected: Option<&Endpoint>) -> Reconciliation {
    let mut to_add: Vec<Endpoint> = Vec::new();
    for endpoint in live {
        if endpoint.is_sentinel()
            || known.contains(endpoint)
            || connected == Some(endpoint)
            || to_add.contains(endpoint)
        {
            continue;
        }
        to_add.push(endpoint.clone());
    }

    let to_remove = known
        .iter()
        .filter(|e| !e.is_sentinel() && !live.contains(e))
        .cloned()
        .collect();

    Reconciliation { to_add, to_remove }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn eps(names: &[&str]) -> Vec<Endpoint> {
        names.iter().map(|n| Endpoint::from(*n)).collect()
    }

    #[test]
    fn test_add_and_remove() {
        let known = eps(&["P1", "P2"]);
        let live = eps(&["P2", "P3"]);
        let changes = reconcile(&known, &live, None);
        assert_eq!(changes.to_add, eps(&["P3"]));
        assert_eq!(changes.to_remove, eps(&["P1"]));
    }

    #[test]
    fn test_connected_endpoint_not_added() {
        let connected = Endpoint::from("P3");
        let changes = reconcile(&eps(&["P1"]), &eps(&["P1", "P3"]), Some(&connected));
        assert!(changes.is_empty());
    }

    #[test]
    fn test_connected_endpoint_removed_when_gone() {
        let connected = Endpoint::from("P1");
        let changes = reconcile(&eps(&["P1", "P2"]), &eps(&["P2"]), Some(&connected));
        assert_eq!(changes.to_remove, eps(&["P1"]));
    }

    #[test]
    fn test_no_change_and_duplicates() {
        let known = eps(&["P1", "P2"]);
        assert!(reconcile(&known, &eps(&["P2", "P1"]), None).is_empty());

        let changes = reconcile(&[], &eps(&["P4", "P4", "P5"]), None);
        assert_eq!(changes.to_add, eps(&["P4", "P5"]));
    }

    #[test]
    fn test_sentinel_ignored() {
        let changes = reconcile(&eps(&["No device"]), &eps(&["No device"]), None);
        assert!(changes.is_empty());
        let changes = reconcile(&[], &eps(&["No device"]), None);
        assert!(changes.is_empty());
    }
}
