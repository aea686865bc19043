//! Endpoint enumeration

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serialport::SerialPortType;
use tracing::trace;

use crate::endpoint::Endpoint;

/// Source of currently reachable endpoints
pub trait EndpointEnumerator: Send + Sync {
    fn enumerate(&self) -> Result<Vec<Endpoint>>;
}

impl<F> EndpointEnumerator for F
where
    F: Fn() -> Result<Vec<Endpoint>> + Send + Sync,
{
    fn enumerate(&self) -> Result<Vec<Endpoint>> {
        self()
    }
}

/// Serial enumeration options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialEnumeratorConfig {
    /// Only report USB serial adapters
    #[serde(default)]
    pub usb_only: bool,
    /// Port names never reported (e.g. a console UART)
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// Enumerates serial ports through the OS
#[derive(Debug, Clone, Default)]
pub struct SerialEnumerator {
    config: SerialEnumeratorConfig,
}

impl SerialEnumerator {
    pub fn new(config: SerialEnumeratorConfig) -> Self {
        Self { config }
    }
}

impl EndpointEnumerator for SerialEnumerator {
    fn enumerate(&self) -> Result<Vec<Endpoint>> {
        let ports = serialport::available_ports()?;
        trace!(count = ports.len(), "Enumerated serial ports");

        let mut endpoints: Vec<Endpoint> = ports
            .into_iter()
            .filter(|p| !self.config.usb_only || matches!(p.port_type, SerialPortType::UsbPort(_)))
            .filter(|p| !self.config.exclude.contains(&p.port_name))
            .map(|p| Endpoint(p.port_name))
            .collect();
        endpoints.sort();
        endpoints.dedup();
        Ok(endpoints)
    }
}

/// Human-readable description of each serial port, for `--list-ports`
pub fn describe_serial_ports() -> Result<Vec<(String, String)>> {
    let ports = serialport::available_ports()?;
    Ok(ports
        .into_iter()
        .map(|p| {
            let kind = match p.port_type {
                SerialPortType::UsbPort(usb) => format!(
                    "USB {:04x}:{:04x} {}",
                    usb.vid,
                    usb.pid,
                    usb.product.unwrap_or_default()
                ),
                SerialPortType::PciPort => "PCI".to_string(),
                SerialPortType::BluetoothPort => "Bluetooth".to_string(),
                SerialPortType::Unknown => "unknown".to_string(),
            };
            (p.port_name, kind.trim_end().to_string())
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    #[test]
    fn test_closure_enumerator() {
        let ports = Arc::new(Mutex::new(vec![Endpoint::from("/dev/ttyUSB0")]));
        let source = ports.clone();
        let enumerator = move || -> Result<Vec<Endpoint>> { Ok(source.lock().clone()) };

        assert_eq!(enumerator.enumerate().unwrap(), vec![Endpoint::from("/dev/ttyUSB0")]);
        ports.lock().clear();
        assert!(enumerator.enumerate().unwrap().is_empty());
    }
}
