//! Simulated transceiver attribute store
//!
//! An in-memory stand-in for the point-to-point link: a controller device
//! (`mwc`) plus transmitter and receiver chips with attributes, channels and
//! byte-wide register files. Endpoints can be unplugged and replugged to
//! exercise the link-loss paths, and every underlying call is counted.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::debug;
use wethlink_core::register::{RegisterMap, RX_DEVICE, TX_DEVICE};
use wethlink_core::{
    AttributeStore, ChannelHandle, ConnectError, ConnectErrorKind, ContextHandle, DeviceHandle,
    StoreError, TransportUri,
};

/// Number of addressable registers per chip
const REGISTER_FILE_LEN: usize = 28;

/// Counts of underlying calls
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub opens: u64,
    pub attr_reads: u64,
    pub attr_writes: u64,
    pub reg_reads: u64,
    pub reg_writes: u64,
}

#[derive(Debug, Clone)]
struct SimAttr {
    value: String,
    /// Inclusive numeric range accepted on write, if any
    range: Option<(i64, i64)>,
}

impl SimAttr {
    fn text(value: &str) -> Self {
        Self {
            value: value.to_string(),
            range: None,
        }
    }

    fn ranged(value: &str, min: i64, max: i64) -> Self {
        Self {
            value: value.to_string(),
            range: Some((min, max)),
        }
    }

    fn accepts(&self, value: &str) -> bool {
        match self.range {
            None => true,
            Some((min, max)) => value
                .trim()
                .parse::<i64>()
                .map(|v| v >= min && v <= max)
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Default)]
struct SimDevice {
    attrs: BTreeMap<String, SimAttr>,
    channels: BTreeMap<String, BTreeMap<String, SimAttr>>,
    registers: Option<(&'static RegisterMap, Vec<u8>)>,
}

impl SimDevice {
    fn with_attr(mut self, name: &str, attr: SimAttr) -> Self {
        self.attrs.insert(name.to_string(), attr);
        self
    }

    fn with_channel(mut self, name: &str, attrs: &[(&str, &str)]) -> Self {
        self.channels.insert(
            name.to_string(),
            attrs
                .iter()
                .map(|(k, v)| (k.to_string(), SimAttr::text(v)))
                .collect(),
        );
        self
    }

    fn with_registers(mut self, map: &'static RegisterMap) -> Self {
        self.registers = Some((map, default_registers()));
        self
    }
}

fn default_registers() -> Vec<u8> {
    (0..REGISTER_FILE_LEN).map(|i| (i as u8).wrapping_mul(7)).collect()
}

#[derive(Debug, Default)]
struct SimBoard {
    ports: BTreeSet<String>,
    unplugged: BTreeSet<String>,
    fail_next: Option<ConnectErrorKind>,
    description: String,
    context_attrs: Vec<(String, String)>,
    devices: BTreeMap<String, SimDevice>,
    counters: SimCounters,
    open_contexts: usize,
}

impl SimBoard {
    fn check_link(&self, port: &str) -> Result<(), StoreError> {
        if self.unplugged.contains(port) || !self.ports.contains(port) {
            return Err(StoreError::Link(format!("{}: no such device", port)));
        }
        Ok(())
    }

    fn device(&self, name: &str) -> Result<&SimDevice, StoreError> {
        self.devices
            .get(name)
            .ok_or_else(|| StoreError::DeviceNotFound(name.to_string()))
    }

    fn device_mut(&mut self, name: &str) -> Result<&mut SimDevice, StoreError> {
        self.devices
            .get_mut(name)
            .ok_or_else(|| StoreError::DeviceNotFound(name.to_string()))
    }
}

/// In-memory attribute store
#[derive(Debug, Clone)]
pub struct SimStore {
    board: Arc<Mutex<SimBoard>>,
}

impl SimStore {
    /// A transceiver reachable on each of `ports`
    pub fn transceiver(ports: &[&str]) -> Self {
        let mwc = SimDevice::default()
            .with_attr("tx_autotuning", SimAttr::ranged("1", 0, 1))
            .with_attr("rx_autotuning", SimAttr::ranged("1", 0, 1))
            .with_attr("tx_auto_ifvga", SimAttr::ranged("1", 0, 1))
            .with_attr("rx_auto_ifvga_rflna", SimAttr::ranged("1", 0, 1))
            .with_attr("tx_target", SimAttr::ranged("50", 0, 1000))
            .with_attr("rx_target", SimAttr::ranged("50", 0, 1000))
            .with_attr("reset", SimAttr::ranged("0", 0, 1))
            .with_channel("tx_det", &[("raw", "120"), ("scale", "0.5")])
            .with_channel("rx_det", &[("raw", "96"), ("scale", "0.5")]);

        let vco_available = "57240000 58320000 59400000 60480000 0 0";
        let tx = SimDevice::default()
            .with_attr("enabled", SimAttr::ranged("1", 0, 1))
            .with_attr("vco", SimAttr::text("58320000"))
            .with_attr("vco_available", SimAttr::text(vco_available))
            .with_attr("if_attn", SimAttr::ranged("5", 0, 13))
            .with_attr("rf_attn", SimAttr::ranged("3", 0, 15))
            .with_channel("temp", &[("raw", "9")])
            .with_registers(&wethlink_core::register::TX_REGISTERS);

        let rx = SimDevice::default()
            .with_attr("enabled", SimAttr::ranged("1", 0, 1))
            .with_attr("vco", SimAttr::text("58320000"))
            .with_attr("vco_available", SimAttr::text(vco_available))
            .with_attr("if_attn", SimAttr::ranged("4", 0, 13))
            .with_attr("rf_lna_gain", SimAttr::ranged("0", 0, 3))
            .with_attr("bb_attn1", SimAttr::ranged("0", 0, 3))
            .with_attr("bb_attn2", SimAttr::ranged("0", 0, 3))
            .with_attr("bb_attni_fine", SimAttr::ranged("0", 0, 6))
            .with_channel("temp", &[("raw", "8")])
            .with_registers(&wethlink_core::register::RX_REGISTERS);

        let mut devices = BTreeMap::new();
        devices.insert("mwc".to_string(), mwc);
        devices.insert(TX_DEVICE.to_string(), tx);
        devices.insert(RX_DEVICE.to_string(), rx);

        let context_attrs = [
            ("hw_model", "WL-60"),
            ("hw_version", "1.2"),
            ("hw_serial", "SIM000001"),
            ("carrier_model", "WL-CARRIER"),
            ("carrier_version", "2.0"),
            ("carrier_serial", "SIM100001"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            board: Arc::new(Mutex::new(SimBoard {
                ports: ports.iter().map(|p| p.to_string()).collect(),
                description: "wethlink simulated transceiver".to_string(),
                context_attrs,
                devices,
                ..SimBoard::default()
            })),
        }
    }

    /// Endpoints currently plugged in
    pub fn ports(&self) -> Vec<String> {
        let board = self.board.lock();
        board
            .ports
            .iter()
            .filter(|p| !board.unplugged.contains(*p))
            .cloned()
            .collect()
    }

    /// Simulate pulling the cable on `port`
    pub fn unplug(&self, port: &str) {
        debug!(port = %port, "Simulated unplug");
        self.board.lock().unplugged.insert(port.to_string());
    }

    pub fn replug(&self, port: &str) {
        debug!(port = %port, "Simulated replug");
        let mut board = self.board.lock();
        board.unplugged.remove(port);
        board.ports.insert(port.to_string());
    }

    /// Make the next `open` fail with `kind`
    pub fn fail_next_open(&self, kind: ConnectErrorKind) {
        self.board.lock().fail_next = Some(kind);
    }

    pub fn counters(&self) -> SimCounters {
        self.board.lock().counters
    }

    /// Number of context handles currently alive
    pub fn open_contexts(&self) -> usize {
        self.board.lock().open_contexts
    }

    /// Device-side view of an attribute, bypassing the counters
    pub fn attr(&self, device: &str, attr: &str) -> Option<String> {
        let board = self.board.lock();
        board
            .devices
            .get(device)?
            .attrs
            .get(attr)
            .map(|a| a.value.clone())
    }

    /// Device-side view of a register
    pub fn register(&self, device: &str, addr: u32) -> Option<u8> {
        let board = self.board.lock();
        let (_, regs) = board.devices.get(device)?.registers.as_ref()?;
        regs.get(addr as usize).copied()
    }
}

impl AttributeStore for SimStore {
    fn open(&self, uri: &str) -> Result<Box<dyn ContextHandle>, ConnectError> {
        let parsed = TransportUri::parse(uri).ok_or_else(|| {
            ConnectError::new(ConnectErrorKind::Unknown, uri, "malformed context URI")
        })?;

        let mut board = self.board.lock();
        if let Some(kind) = board.fail_next.take() {
            return Err(ConnectError::new(kind, uri, "simulated open failure"));
        }
        if board.check_link(&parsed.endpoint).is_err() {
            return Err(ConnectError::new(
                ConnectErrorKind::DeviceNotFound,
                uri,
                format!("{}: no such device", parsed.endpoint),
            ));
        }

        board.counters.opens += 1;
        board.open_contexts += 1;
        Ok(Box::new(SimContext {
            board: self.board.clone(),
            port: parsed.endpoint,
        }))
    }
}

struct SimContext {
    board: Arc<Mutex<SimBoard>>,
    port: String,
}

impl Drop for SimContext {
    fn drop(&mut self) {
        let mut board = self.board.lock();
        board.open_contexts = board.open_contexts.saturating_sub(1);
    }
}

impl ContextHandle for SimContext {
    fn description(&self) -> Result<String, StoreError> {
        let board = self.board.lock();
        board.check_link(&self.port)?;
        Ok(format!("{} on {}", board.description, self.port))
    }

    fn context_attrs(&self) -> Result<Vec<(String, String)>, StoreError> {
        let board = self.board.lock();
        board.check_link(&self.port)?;
        Ok(board.context_attrs.clone())
    }

    fn device<'a>(&'a self, name: &str) -> Result<Box<dyn DeviceHandle + 'a>, StoreError> {
        let board = self.board.lock();
        board.check_link(&self.port)?;
        board.device(name)?;
        Ok(Box::new(SimDeviceHandle {
            ctx: self,
            name: name.to_string(),
        }))
    }
}

struct SimDeviceHandle<'a> {
    ctx: &'a SimContext,
    name: String,
}

impl DeviceHandle for SimDeviceHandle<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_attr(&self, attr: &str) -> Result<String, StoreError> {
        let mut board = self.ctx.board.lock();
        board.check_link(&self.ctx.port)?;
        board.counters.attr_reads += 1;
        board
            .device(&self.name)?
            .attrs
            .get(attr)
            .map(|a| a.value.clone())
            .ok_or_else(|| StoreError::AttributeNotFound(attr.to_string()))
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<(), StoreError> {
        let mut board = self.ctx.board.lock();
        board.check_link(&self.ctx.port)?;
        board.counters.attr_writes += 1;
        let device = board.device_mut(&self.name)?;
        let entry = device
            .attrs
            .get_mut(attr)
            .ok_or_else(|| StoreError::AttributeNotFound(attr.to_string()))?;
        if !entry.accepts(value) {
            return Err(StoreError::Rejected {
                attr: attr.to_string(),
                value: value.to_string(),
            });
        }
        entry.value = value.trim().to_string();

        // Writing 1 to reset restores power-on register contents
        if attr == "reset" && entry.value == "1" {
            entry.value = "0".to_string();
            for dev in board.devices.values_mut() {
                if let Some((_, regs)) = dev.registers.as_mut() {
                    *regs = default_registers();
                }
            }
        }
        Ok(())
    }

    fn channel<'b>(&'b self, name: &str) -> Result<Box<dyn ChannelHandle + 'b>, StoreError> {
        let board = self.ctx.board.lock();
        board.check_link(&self.ctx.port)?;
        if !board.device(&self.name)?.channels.contains_key(name) {
            return Err(StoreError::ChannelNotFound {
                device: self.name.clone(),
                channel: name.to_string(),
            });
        }
        Ok(Box::new(SimChannelHandle {
            device: self,
            name: name.to_string(),
        }))
    }

    fn reg_read(&self, addr: u32) -> Result<u32, StoreError> {
        let mut board = self.ctx.board.lock();
        board.check_link(&self.ctx.port)?;
        board.counters.reg_reads += 1;
        match board.device(&self.name)?.registers.as_ref() {
            Some((map, regs)) if map.contains(addr) => Ok(u32::from(regs[addr as usize])),
            _ => Err(StoreError::BadRegister(addr)),
        }
    }

    fn reg_write(&self, addr: u32, value: u32) -> Result<(), StoreError> {
        let mut board = self.ctx.board.lock();
        board.check_link(&self.ctx.port)?;
        board.counters.reg_writes += 1;
        match board.device_mut(&self.name)?.registers.as_mut() {
            Some((map, regs)) if map.contains(addr) => {
                regs[addr as usize] = (value & 0xff) as u8;
                Ok(())
            }
            _ => Err(StoreError::BadRegister(addr)),
        }
    }
}

struct SimChannelHandle<'a> {
    device: &'a SimDeviceHandle<'a>,
    name: String,
}

impl SimChannelHandle<'_> {
    fn with_channel<T>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, SimAttr>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let ctx = self.device.ctx;
        let mut board = ctx.board.lock();
        board.check_link(&ctx.port)?;
        let channel = board
            .device_mut(&self.device.name)?
            .channels
            .get_mut(&self.name)
            .ok_or_else(|| StoreError::ChannelNotFound {
                device: self.device.name.clone(),
                channel: self.name.clone(),
            })?;
        f(channel)
    }
}

impl ChannelHandle for SimChannelHandle<'_> {
    fn read_attr(&self, attr: &str) -> Result<String, StoreError> {
        self.with_channel(|channel| {
            channel
                .get(attr)
                .map(|a| a.value.clone())
                .ok_or_else(|| StoreError::AttributeNotFound(attr.to_string()))
        })
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<(), StoreError> {
        self.with_channel(|channel| {
            let entry = channel
                .get_mut(attr)
                .ok_or_else(|| StoreError::AttributeNotFound(attr.to_string()))?;
            entry.value = value.to_string();
            Ok(())
        })
    }
}
