//! Discovery service
//!
//! Keeps the selectable endpoint list current and notices when the selected
//! endpoint disappears. A vanished selection is the usual way a link goes
//! away (cable pulled), so it is reported as an implicit disconnect rather
//! than an error.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::endpoint::{Endpoint, EndpointList};
use crate::enumerate::EndpointEnumerator;
use crate::reconcile::{reconcile, Reconciliation};

/// Discovery event for real-time updates
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// New endpoint became available
    EndpointAdded(Endpoint),
    /// Endpoint no longer enumerates
    EndpointRemoved(Endpoint),
    /// The selected endpoint vanished
    SelectionLost(Endpoint),
    /// Pulse completed
    ScanCompleted { added: usize, removed: usize, total: usize },
}

/// What one discovery pulse changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscoveryOutcome {
    pub to_add: Vec<Endpoint>,
    pub to_remove: Vec<Endpoint>,
    /// Set when the selected endpoint was among the removals
    pub selection_lost: Option<Endpoint>,
}

impl DiscoveryOutcome {
    pub fn is_empty(&self) -> bool {
        self.to_add.is_empty() && self.to_remove.is_empty()
    }
}

#[derive(Debug, Default)]
struct DiscoveryState {
    list: EndpointList,
    selection: Option<Endpoint>,
}

/// Discovery service
pub struct DiscoveryService {
    enumerator: Box<dyn EndpointEnumerator>,
    state: Mutex<DiscoveryState>,
    event_tx: broadcast::Sender<DiscoveryEvent>,
}

impl DiscoveryService {
    pub fn new(enumerator: Box<dyn EndpointEnumerator>) -> Self {
        let (event_tx, _) = broadcast::channel(100);
        Self {
            enumerator,
            state: Mutex::new(DiscoveryState::default()),
            event_tx,
        }
    }

    /// Subscribe to discovery events
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.event_tx.subscribe()
    }

    /// Enumerate, reconcile against the known list and apply the changes.
    ///
    /// An enumeration failure is logged and treated as "nothing changed".
    pub fn pulse(&self) -> DiscoveryOutcome {
        let live = match self.enumerator.enumerate() {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "Endpoint enumeration failed");
                return DiscoveryOutcome::default();
            }
        };

        let (changes, selection_lost, total) = {
            let mut state = self.state.lock();
            let changes = reconcile(state.list.endpoints(), &live, state.selection.as_ref());
            state.list.apply(&changes);

            let lost = state
                .selection
                .as_ref()
                .is_some_and(|selected| changes.to_remove.contains(selected));
            let selection_lost = if lost { state.selection.take() } else { None };
            (changes, selection_lost, state.list.len())
        };

        self.announce(&changes, selection_lost.as_ref(), total);

        DiscoveryOutcome {
            to_add: changes.to_add,
            to_remove: changes.to_remove,
            selection_lost,
        }
    }

    fn announce(&self, changes: &Reconciliation, lost: Option<&Endpoint>, total: usize) {
        for endpoint in &changes.to_add {
            info!(endpoint = %endpoint, "Endpoint added");
            let _ = self.event_tx.send(DiscoveryEvent::EndpointAdded(endpoint.clone()));
        }
        for endpoint in &changes.to_remove {
            info!(endpoint = %endpoint, "Endpoint removed");
            let _ = self.event_tx.send(DiscoveryEvent::EndpointRemoved(endpoint.clone()));
        }
        if let Some(endpoint) = lost {
            warn!(endpoint = %endpoint, "Selected endpoint disappeared");
            let _ = self.event_tx.send(DiscoveryEvent::SelectionLost(endpoint.clone()));
        }

        debug!(
            added = changes.to_add.len(),
            removed = changes.to_remove.len(),
            total = total,
            "Discovery pulse completed"
        );
        let _ = self.event_tx.send(DiscoveryEvent::ScanCompleted {
            added: changes.to_add.len(),
            removed: changes.to_remove.len(),
            total,
        });
    }

    /// Change the selection. `None` or the sentinel clears it.
    ///
    /// A selected endpoint is always part of the list. Returns the previous
    /// selection.
    pub fn select(&self, endpoint: Option<Endpoint>) -> Option<Endpoint> {
        let endpoint = endpoint.filter(|e| !e.is_sentinel());
        let mut state = self.state.lock();
        if let Some(endpoint) = &endpoint {
            state.list.insert(endpoint.clone());
        }
        debug!(selection = ?endpoint, "Selection changed");
        std::mem::replace(&mut state.selection, endpoint)
    }

    pub fn selection(&self) -> Option<Endpoint> {
        self.state.lock().selection.clone()
    }

    /// Known endpoints without the sentinel
    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.state.lock().list.endpoints().to_vec()
    }

    /// Entries as shown to the operator, sentinel first
    pub fn display_names(&self) -> Vec<String> {
        self.state.lock().list.display_names()
    }
}
