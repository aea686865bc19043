//! Wethlink Context - Device context lifecycle and attribute store backends
//!
//! This crate owns the single live connection to the transceiver. All reads
//! and writes funnel through [`ContextManager`], which contains low-level
//! failures and tears the context down only when an independent liveness
//! probe confirms the link is gone.

pub mod iio_cli;
pub mod manager;
pub mod sim;

pub use iio_cli::{IioCliConfig, IioCliStore};
pub use manager::{ContextInfo, ContextManager, LinkStatus, ProbeTarget, WriteOutcome};
pub use sim::{SimCounters, SimStore};
