//! Attribute store contract
//!
//! The attribute store is the hardware-abstraction layer underneath the
//! context manager: a tree of devices, channels and string attributes plus a
//! raw register interface per device. Every call may fail once the link is
//! gone, so every method returns a `Result`.
//!
//! Devices and channels are resolved by name on every access. Handles borrow
//! from their context and cannot outlive it, so nothing survives a teardown.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single call against an open context
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("device '{0}' not found")]
    DeviceNotFound(String),
    #[error("channel '{channel}' not found on device '{device}'")]
    ChannelNotFound { device: String, channel: String },
    #[error("attribute '{0}' not found")]
    AttributeNotFound(String),
    #[error("value '{value}' rejected for attribute '{attr}'")]
    Rejected { attr: String, value: String },
    #[error("register 0x{0:02x} is not accessible")]
    BadRegister(u32),
    #[error("link error: {0}")]
    Link(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Closed set of reasons a context could not be created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectErrorKind {
    /// A context is already open on this endpoint
    AlreadyConnected,
    /// The endpoint does not exist (unplugged, wrong name)
    DeviceNotFound,
    /// The endpoint exists but does not speak the attribute protocol
    NotSupported,
    /// The endpoint is held by another process
    Busy,
    /// The process may not open the endpoint
    PermissionDenied,
    /// Anything else
    Unknown,
}

impl ConnectErrorKind {
    /// Classify an OS-level failure by its kind
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::DeviceNotFound,
            io::ErrorKind::PermissionDenied => Self::PermissionDenied,
            io::ErrorKind::ResourceBusy => Self::Busy,
            io::ErrorKind::AlreadyExists => Self::AlreadyConnected,
            io::ErrorKind::TimedOut | io::ErrorKind::InvalidData => Self::NotSupported,
            _ => Self::Unknown,
        }
    }

    /// Short title shown to the operator
    pub fn title(&self) -> &'static str {
        match self {
            Self::AlreadyConnected => "Already connected",
            Self::DeviceNotFound => "Device not found",
            Self::NotSupported => "Not an IIO device",
            Self::Busy => "Device busy",
            Self::PermissionDenied => "Permission denied",
            Self::Unknown => "Connection failed",
        }
    }

    /// Whether the failure means the endpoint itself has gone away
    pub fn endpoint_gone(&self) -> bool {
        matches!(self, Self::DeviceNotFound)
    }
}

impl fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.title())
    }
}

/// A categorized connect failure
#[derive(Error, Debug, Clone)]
#[error("{kind}: cannot create context on {uri}: {detail}")]
pub struct ConnectError {
    pub kind: ConnectErrorKind,
    pub uri: String,
    pub detail: String,
}

impl ConnectError {
    pub fn new(kind: ConnectErrorKind, uri: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind,
            uri: uri.into(),
            detail: detail.into(),
        }
    }
}

/// Opens contexts on transport URIs
pub trait AttributeStore: Send + Sync {
    /// Open a new context. Reachability beyond what the open performs is not checked.
    fn open(&self, uri: &str) -> Result<Box<dyn ContextHandle>, ConnectError>;
}

/// A live connection to one transceiver
pub trait ContextHandle: Send {
    /// Firmware/context description string
    fn description(&self) -> Result<String, StoreError>;

    /// Context-level attributes (hardware model, serial numbers, ...)
    fn context_attrs(&self) -> Result<Vec<(String, String)>, StoreError>;

    /// Resolve a device by name
    fn device<'a>(&'a self, name: &str) -> Result<Box<dyn DeviceHandle + 'a>, StoreError>;
}

/// A named device inside a context
pub trait DeviceHandle {
    fn name(&self) -> &str;

    fn read_attr(&self, attr: &str) -> Result<String, StoreError>;

    fn write_attr(&self, attr: &str, value: &str) -> Result<(), StoreError>;

    /// Resolve a channel by name
    fn channel<'a>(&'a self, name: &str) -> Result<Box<dyn ChannelHandle + 'a>, StoreError>;

    fn reg_read(&self, addr: u32) -> Result<u32, StoreError>;

    fn reg_write(&self, addr: u32, value: u32) -> Result<(), StoreError>;
}

/// A named channel on a device
pub trait ChannelHandle {
    fn read_attr(&self, attr: &str) -> Result<String, StoreError>;

    fn write_attr(&self, attr: &str, value: &str) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_io() {
        let err = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(ConnectErrorKind::from_io(&err), ConnectErrorKind::DeviceNotFound);

        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(ConnectErrorKind::from_io(&err), ConnectErrorKind::PermissionDenied);

        let err = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(ConnectErrorKind::from_io(&err), ConnectErrorKind::NotSupported);

        let err = io::Error::from(io::ErrorKind::ResourceBusy);
        assert_eq!(ConnectErrorKind::from_io(&err), ConnectErrorKind::Busy);

        // Classified by kind, never by message text
        let err = io::Error::new(io::ErrorKind::Other, "Device or resource busy (os error 16)");
        assert_eq!(ConnectErrorKind::from_io(&err), ConnectErrorKind::Unknown);
    }

    #[test]
    fn test_connect_error_display() {
        let err = ConnectError::new(
            ConnectErrorKind::Busy,
            "serial:/dev/ttyUSB0,115200,8n2n",
            "port locked",
        );
        assert_eq!(
            err.to_string(),
            "Device busy: cannot create context on serial:/dev/ttyUSB0,115200,8n2n: port locked"
        );
        assert!(!err.kind.endpoint_gone());
    }
}
