//! Wethlink Discovery - Transport endpoint discovery for the transceiver link
//!
//! This crate provides:
//! - Serial endpoint enumeration behind a small trait
//! - Pure reconciliation of known against live endpoints
//! - The operator-visible endpoint list with its "No device" placeholder
//! - A discovery service that tracks the selection and broadcasts changes

pub mod endpoint;
pub mod enumerate;
pub mod reconcile;
pub mod service;

pub use endpoint::{Endpoint, EndpointList, NO_DEVICE};
pub use enumerate::{describe_serial_ports, EndpointEnumerator, SerialEnumerator, SerialEnumeratorConfig};
pub use reconcile::{reconcile, Reconciliation};
pub use service::{DiscoveryEvent, DiscoveryOutcome, DiscoveryService};
