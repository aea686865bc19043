//! Context manager: sole owner of the live device context
//!
//! At most one context exists at a time. It lives in a mutex-guarded slot and
//! every access, including the liveness probe that follows a failed call,
//! happens under that lock. Other components never hold the handle; they ask
//! the manager, so a teardown is visible everywhere at once.
//!
//! Failure containment is two-phase: a failed call is logged and returns
//! `None`, then the probe runs. Only a failed probe tears the context down.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use wethlink_core::{
    AttributeStore, ConnectError, ContextHandle, DiagnosticSink, LogKind, RegisterDump,
    RegisterMap, StoreError,
};

/// Always-present attribute read by the liveness probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeTarget {
    #[serde(default = "default_probe_device")]
    pub device: String,
    #[serde(default = "default_probe_attr")]
    pub attr: String,
}

impl Default for ProbeTarget {
    fn default() -> Self {
        Self {
            device: default_probe_device(),
            attr: default_probe_attr(),
        }
    }
}

fn default_probe_device() -> String {
    "mwc".to_string()
}

fn default_probe_attr() -> String {
    "tx_target".to_string()
}

/// Result of the liveness probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum LinkStatus {
    /// Nothing to validate
    NoContext,
    /// Probe attribute read succeeded
    Alive,
    /// Probe failed with this error text
    Dead(String),
}

impl LinkStatus {
    pub fn is_alive(&self) -> bool {
        matches!(self, LinkStatus::Alive)
    }
}

/// What `write_attribute_if_changed` did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    Written,
    Unchanged,
}

/// Identity of the connected transceiver
#[derive(Debug, Clone, Serialize)]
pub struct ContextInfo {
    pub uri: String,
    pub description: String,
    pub attrs: Vec<(String, String)>,
}

struct DeviceContext {
    uri: String,
    handle: Box<dyn ContextHandle>,
}

pub struct ContextManager {
    store: Arc<dyn AttributeStore>,
    sink: Arc<dyn DiagnosticSink>,
    probe: ProbeTarget,
    slot: Mutex<Option<DeviceContext>>,
    teardowns: AtomicU64,
}

impl ContextManager {
    pub fn new(
        store: Arc<dyn AttributeStore>,
        sink: Arc<dyn DiagnosticSink>,
        probe: ProbeTarget,
    ) -> Self {
        Self {
            store,
            sink,
            probe,
            slot: Mutex::new(None),
            teardowns: AtomicU64::new(0),
        }
    }

    /// Open a context on `uri`, replacing any existing one.
    ///
    /// The previous handle is released before the new open so the transport
    /// endpoint is free. On failure no context remains.
    pub fn connect(&self, uri: &str) -> Result<(), ConnectError> {
        let mut slot = self.slot.lock();
        self.teardown(&mut slot, "replaced by a new context");

        debug!(uri = %uri, "Opening context");
        match self.store.open(uri) {
            Ok(handle) => {
                info!(uri = %uri, "Context created");
                self.sink
                    .write(LogKind::Device, &format!("Context created on {}", uri));
                *slot = Some(DeviceContext {
                    uri: uri.to_string(),
                    handle,
                });
                Ok(())
            }
            Err(e) => {
                warn!(uri = %uri, kind = ?e.kind, error = %e.detail, "Failed to create context");
                self.sink.write(LogKind::Error, &e.to_string());
                Err(e)
            }
        }
    }

    /// Whether a context currently exists (not whether it works)
    pub fn is_connected(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// URI of the current context
    pub fn uri(&self) -> Option<String> {
        self.slot.lock().as_ref().map(|ctx| ctx.uri.clone())
    }

    /// Number of real teardowns so far
    pub fn teardowns(&self) -> u64 {
        self.teardowns.load(Ordering::Relaxed)
    }

    /// Run the liveness probe without side effects
    pub fn check(&self) -> LinkStatus {
        let slot = self.slot.lock();
        match slot.as_ref() {
            None => LinkStatus::NoContext,
            Some(ctx) => self.probe_handle(ctx),
        }
    }

    /// `(valid, error detail)`; no context is `(false, "")`.
    ///
    /// A dead link is torn down, so once this reports false no later call
    /// reaches the store.
    pub fn is_valid(&self) -> (bool, String) {
        match self.health_check() {
            LinkStatus::Alive => (true, String::new()),
            LinkStatus::NoContext => (false, String::new()),
            LinkStatus::Dead(detail) => (false, detail),
        }
    }

    /// Probe and tear down if the link is dead
    pub fn health_check(&self) -> LinkStatus {
        let mut slot = self.slot.lock();
        let status = match slot.as_ref() {
            None => return LinkStatus::NoContext,
            Some(ctx) => self.probe_handle(ctx),
        };
        if let LinkStatus::Dead(detail) = &status {
            self.sink
                .write(LogKind::Error, &format!("Health probe failed: {}", detail));
            self.teardown(&mut slot, "health probe failed");
        }
        status
    }

    /// Release the context. Returns false if there was none.
    pub fn invalidate(&self) -> bool {
        let mut slot = self.slot.lock();
        self.teardown(&mut slot, "invalidated")
    }

    /// Operator-requested release
    pub fn disconnect(&self) -> bool {
        let mut slot = self.slot.lock();
        self.teardown(&mut slot, "disconnected by operator")
    }

    /// Run `op` against the live context inside a failure boundary.
    ///
    /// Returns `None` without calling `op` when there is no context. When
    /// `op` fails the probe decides whether the link is gone; only then is
    /// the context torn down.
    pub fn safe_execute<T, F>(&self, what: &str, op: F) -> Option<T>
    where
        F: FnOnce(&dyn ContextHandle) -> Result<T, StoreError>,
    {
        self.guarded(what, |ctx| op(ctx.handle.as_ref()))
    }

    /// `safe_execute` with the whole context, URI included
    fn guarded<T, F>(&self, what: &str, op: F) -> Option<T>
    where
        F: FnOnce(&DeviceContext) -> Result<T, StoreError>,
    {
        let mut slot = self.slot.lock();
        let ctx = match slot.as_ref() {
            Some(ctx) => ctx,
            None => {
                debug!(op = %what, "No context, skipping");
                return None;
            }
        };

        match op(ctx) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!(op = %what, error = %e, "Operation failed, probing link");
                self.sink
                    .write(LogKind::Error, &format!("{} failed: {}", what, e));

                match self.probe_handle(ctx) {
                    LinkStatus::Dead(detail) => {
                        self.sink
                            .write(LogKind::Error, &format!("Link lost: {}", detail));
                        self.teardown(&mut slot, "link lost");
                    }
                    _ => {
                        debug!(op = %what, "Link still alive, keeping context");
                    }
                }
                None
            }
        }
    }

    pub fn read_attribute(&self, device: &str, attr: &str) -> Option<String> {
        self.safe_execute(&format!("read {}/{}", device, attr), |h| {
            h.device(device)?.read_attr(attr)
        })
    }

    /// Unconditional write, for trigger attributes such as `reset`
    pub fn write_attribute(&self, device: &str, attr: &str, value: &str) -> Option<()> {
        let done = self.safe_execute(&format!("write {}/{}", device, attr), |h| {
            h.device(device)?.write_attr(attr, value)
        });
        if done.is_some() {
            self.sink
                .write(LogKind::Device, &format!("write {}/{} = {}", device, attr, value));
        }
        done
    }

    /// Read the current value and write only if it differs from `value`.
    ///
    /// The comparison uses a value read inside the same locked operation,
    /// never a cached one.
    pub fn write_attribute_if_changed(
        &self,
        device: &str,
        attr: &str,
        value: &str,
    ) -> Option<WriteOutcome> {
        let outcome = self.safe_execute(&format!("write {}/{}", device, attr), |h| {
            let dev = h.device(device)?;
            let current = dev.read_attr(attr)?;
            if current == value {
                Ok(WriteOutcome::Unchanged)
            } else {
                dev.write_attr(attr, value)?;
                Ok(WriteOutcome::Written)
            }
        })?;

        let message = match outcome {
            WriteOutcome::Unchanged => format!("no change {}/{}", device, attr),
            WriteOutcome::Written => format!("write {}/{} = {}", device, attr, value),
        };
        self.sink.write(LogKind::Device, &message);
        Some(outcome)
    }

    pub fn read_channel_attribute(&self, device: &str, channel: &str, attr: &str) -> Option<String> {
        self.safe_execute(&format!("read {}/{}/{}", device, channel, attr), |h| {
            h.device(device)?.channel(channel)?.read_attr(attr)
        })
    }

    pub fn write_channel_attribute(
        &self,
        device: &str,
        channel: &str,
        attr: &str,
        value: &str,
    ) -> Option<()> {
        let done = self.safe_execute(&format!("write {}/{}/{}", device, channel, attr), |h| {
            h.device(device)?.channel(channel)?.write_attr(attr, value)
        });
        if done.is_some() {
            self.sink.write(
                LogKind::Device,
                &format!("write {}/{}/{} = {}", device, channel, attr, value),
            );
        }
        done
    }

    pub fn read_register(&self, device: &str, addr: u32) -> Option<u8> {
        self.safe_execute(&format!("read register {}[{}]", device, addr), |h| {
            h.device(device)?.reg_read(addr).map(|v| (v & 0xff) as u8)
        })
    }

    pub fn write_register(&self, device: &str, addr: u32, value: u8) -> Option<()> {
        let done = self.safe_execute(&format!("write register {}[{}]", device, addr), |h| {
            h.device(device)?.reg_write(addr, u32::from(value))
        });
        if done.is_some() {
            self.sink.write(
                LogKind::Device,
                &format!("write register {}[{}] = 0x{:02x}", device, addr, value),
            );
        }
        done
    }

    /// Read every valid register of `map` in one pass
    pub fn export_registers(&self, map: &RegisterMap) -> Option<RegisterDump> {
        self.safe_execute(&format!("export registers of {}", map.device), |h| {
            let dev = h.device(map.device)?;
            let mut rows = Vec::with_capacity(map.len());
            for addr in map.addresses() {
                rows.push((addr, (dev.reg_read(addr)? & 0xff) as u8));
            }
            Ok(RegisterDump::new(rows))
        })
    }

    /// Apply `dump` to `device` in row order. Returns the number of rows written.
    pub fn import_registers(&self, device: &str, dump: &RegisterDump) -> Option<usize> {
        let written = self.safe_execute(&format!("import registers of {}", device), |h| {
            let dev = h.device(device)?;
            for (addr, value) in &dump.rows {
                dev.reg_write(*addr, u32::from(*value))?;
            }
            Ok(dump.len())
        })?;
        self.sink.write(
            LogKind::Device,
            &format!("imported {} registers into {}", written, device),
        );
        Some(written)
    }

    /// Description and context attributes of the connected transceiver
    pub fn context_info(&self) -> Option<ContextInfo> {
        self.guarded("read context info", |ctx| {
            Ok(ContextInfo {
                uri: ctx.uri.clone(),
                description: ctx.handle.description()?,
                attrs: ctx.handle.context_attrs()?,
            })
        })
    }

    fn probe_handle(&self, ctx: &DeviceContext) -> LinkStatus {
        let result = ctx
            .handle
            .device(&self.probe.device)
            .and_then(|dev| dev.read_attr(&self.probe.attr));
        match result {
            Ok(_) => LinkStatus::Alive,
            Err(e) => LinkStatus::Dead(e.to_string()),
        }
    }

    /// Drop the context if present; one diagnostic per real teardown
    fn teardown(&self, slot: &mut Option<DeviceContext>, reason: &str) -> bool {
        match slot.take() {
            Some(ctx) => {
                let uri = ctx.uri.clone();
                drop(ctx);
                self.teardowns.fetch_add(1, Ordering::Relaxed);
                info!(uri = %uri, reason = %reason, "Context released");
                self.sink
                    .write(LogKind::Device, &format!("Context {} released: {}", uri, reason));
                true
            }
            None => false,
        }
    }
}
