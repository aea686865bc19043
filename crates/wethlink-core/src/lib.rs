//! Wethlink Core - Attribute store contract, register maps and diagnostics
//!
//! This crate provides the foundational types for the Wethlink system:
//! - The attribute store contract implemented by hardware backends
//! - Closed connect-failure kinds for operator notification
//! - Per-device register maps and the register dump text format
//! - Transport URI composition for serial endpoints
//! - The diagnostic sink contract and its sinks

pub mod diag;
pub mod dump;
pub mod register;
pub mod rf;
pub mod store;
pub mod uri;

pub use diag::{DiagnosticSink, FanoutSink, FileSink, LogEntry, LogKind, MemorySink, TracingSink};
pub use dump::{DumpError, RegisterDump};
pub use register::RegisterMap;
pub use store::{
    AttributeStore, ChannelHandle, ConnectError, ConnectErrorKind, ContextHandle, DeviceHandle,
    StoreError,
};
pub use uri::{port_path, TransportConfig, TransportUri};
