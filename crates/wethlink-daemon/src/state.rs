//! Application state management

use anyhow::Result;
use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wethlink_context::{ContextManager, LinkStatus};
use wethlink_core::rf::{detector_millivolts, khz_to_ghz, temperature_band};
use wethlink_core::{
    AttributeStore, ConnectError, ConnectErrorKind, DiagnosticSink, FanoutSink, FileSink, LogKind,
    MemorySink, TracingSink,
};
use wethlink_discovery::{
    DiscoveryEvent, DiscoveryOutcome, DiscoveryService, Endpoint, EndpointEnumerator,
};

use crate::config::{Config, MonitorConfig};
use crate::heartbeat::{HeartbeatError, HeartbeatScheduler};

/// Events pushed to console clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ConsoleEvent {
    EndpointAdded { endpoint: String },
    EndpointRemoved { endpoint: String },
    ScanCompleted { added: usize, removed: usize, total: usize },
    Connected { endpoint: String, uri: String },
    Disconnected { endpoint: Option<String> },
    ConnectFailed {
        kind: ConnectErrorKind,
        title: String,
        detail: String,
    },
    /// The link went away without an operator action
    LinkLost {
        endpoint: Option<String>,
        detail: String,
    },
    Snapshot(RefreshSnapshot),
}

/// One monitored value
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReading {
    pub device: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub attr: String,
    /// `None` when the read failed
    pub value: Option<String>,
    /// Display form (millivolts, temperature band, GHz)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

/// Result of one refresh pulse
#[derive(Debug, Clone, Serialize)]
pub struct RefreshSnapshot {
    pub at: DateTime<Local>,
    pub uri: Option<String>,
    pub readings: Vec<MonitorReading>,
}

/// Link and selection summary
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub version: &'static str,
    pub selection: Option<String>,
    pub uri: Option<String>,
    pub link: LinkStatus,
    pub teardowns: u64,
}

/// Shared application state
pub struct AppState {
    /// Configuration
    pub config: Config,
    /// Sole owner of the device context
    pub context: Arc<ContextManager>,
    /// Endpoint list and selection
    pub discovery: Arc<DiscoveryService>,
    /// Recent diagnostic entries
    pub diagnostics: Arc<MemorySink>,
    pub heartbeats: HeartbeatScheduler,
    /// Event broadcast for WebSocket clients
    pub events: broadcast::Sender<ConsoleEvent>,
    sink: Arc<dyn DiagnosticSink>,
    snapshot: Mutex<Option<RefreshSnapshot>>,
    /// Held while the selection and the context change together
    link: Mutex<()>,
}

impl AppState {
    /// Create new application state. Must be called from within a tokio runtime.
    pub fn new(
        config: Config,
        store: Arc<dyn AttributeStore>,
        enumerator: Box<dyn EndpointEnumerator>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let diagnostics = Arc::new(MemorySink::new(config.diagnostics.recent));
        let mut fanout = FanoutSink::new().with(diagnostics.clone());
        if config.diagnostics.file {
            let file = FileSink::new(&config.diagnostics.path, config.diagnostics.max_bytes);
            info!(path = %file.path().display(), "Diagnostic log file enabled");
            fanout = fanout.with(Arc::new(file));
        }
        if config.diagnostics.tracing {
            fanout = fanout.with(Arc::new(TracingSink));
        }
        let sink: Arc<dyn DiagnosticSink> = Arc::new(fanout);

        let context = Arc::new(ContextManager::new(store, sink.clone(), config.probe.clone()));
        let discovery = Arc::new(DiscoveryService::new(enumerator));
        let (events, _) = broadcast::channel(100);

        // Forward discovery events to console clients
        let mut rx = discovery.subscribe();
        let tx = events.clone();
        tokio::spawn(async move {
            loop {
                let event = match rx.recv().await {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Discovery event channel lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                let forwarded = match event {
                    DiscoveryEvent::EndpointAdded(e) => ConsoleEvent::EndpointAdded { endpoint: e.0 },
                    DiscoveryEvent::EndpointRemoved(e) => {
                        ConsoleEvent::EndpointRemoved { endpoint: e.0 }
                    }
                    DiscoveryEvent::ScanCompleted { added, removed, total } => {
                        ConsoleEvent::ScanCompleted { added, removed, total }
                    }
                    // Reported as LinkLost by the discovery pulse
                    DiscoveryEvent::SelectionLost(_) => continue,
                };
                let _ = tx.send(forwarded);
            }
        });

        Arc::new(Self {
            config,
            context,
            discovery,
            diagnostics,
            heartbeats: HeartbeatScheduler::new(cancel),
            events,
            sink,
            snapshot: Mutex::new(None),
            link: Mutex::new(()),
        })
    }

    /// Register the refresh, health and discovery pulses
    pub fn start_heartbeats(self: &Arc<Self>) -> Result<(), HeartbeatError> {
        let cadence = &self.config.heartbeat;

        let state = self.clone();
        self.heartbeats
            .register("refresh", cadence.refresh(), move || state.refresh_pulse())?;
        let state = self.clone();
        self.heartbeats
            .register("health", cadence.health(), move || state.health_pulse())?;
        let state = self.clone();
        self.heartbeats
            .register("discovery", cadence.discovery(), move || state.discovery_pulse())?;
        Ok(())
    }

    /// Subscribe to console events
    pub fn subscribe(&self) -> broadcast::Receiver<ConsoleEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: ConsoleEvent) {
        let _ = self.events.send(event);
    }

    /// Read every monitored attribute and publish the snapshot
    pub fn refresh_pulse(&self) -> Result<()> {
        if !self.context.is_connected() {
            return Ok(());
        }

        let readings = self
            .config
            .monitors
            .iter()
            .map(|m| self.read_monitor(m))
            .collect();
        let snapshot = RefreshSnapshot {
            at: Local::now(),
            uri: self.context.uri(),
            readings,
        };

        *self.snapshot.lock() = Some(snapshot.clone());
        self.notify(ConsoleEvent::Snapshot(snapshot));
        Ok(())
    }

    fn read_monitor(&self, monitor: &MonitorConfig) -> MonitorReading {
        let value = match &monitor.channel {
            Some(channel) => {
                self.context
                    .read_channel_attribute(&monitor.device, channel, &monitor.attr)
            }
            None => self.context.read_attribute(&monitor.device, &monitor.attr),
        };

        let display = value
            .as_deref()
            .and_then(|v| self.display_value(monitor, v));

        MonitorReading {
            device: monitor.device.clone(),
            channel: monitor.channel.clone(),
            attr: monitor.attr.clone(),
            value,
            display,
        }
    }

    fn display_value(&self, monitor: &MonitorConfig, value: &str) -> Option<String> {
        match (monitor.channel.as_deref(), monitor.attr.as_str()) {
            (Some("temp"), "raw") => value
                .trim()
                .parse::<u32>()
                .ok()
                .map(|raw| temperature_band(raw).to_string()),
            (Some(channel), "raw") if channel.ends_with("_det") => {
                let scale = self
                    .context
                    .read_channel_attribute(&monitor.device, channel, "scale")?;
                detector_millivolts(value, &scale).map(|mv| format!("{} mV", mv))
            }
            (None, "vco") => khz_to_ghz(value).map(|ghz| format!("{} GHz", ghz)),
            _ => None,
        }
    }

    /// Probe the link and drop the selection if it is dead.
    ///
    /// A selection left without a context (a failed call tore the link
    /// down) is dropped as well.
    pub fn health_pulse(&self) -> Result<()> {
        let _link = self.link.lock();
        let detail = match self.context.health_check() {
            LinkStatus::Dead(detail) => detail,
            LinkStatus::NoContext if self.discovery.selection().is_some() => {
                "context released".to_string()
            }
            _ => return Ok(()),
        };
        let lost = self.discovery.select(None);
        warn!(endpoint = ?lost, detail = %detail, "Link lost");
        self.notify(ConsoleEvent::LinkLost {
            endpoint: lost.map(|e| e.0),
            detail,
        });
        Ok(())
    }

    pub fn discovery_pulse(&self) -> Result<()> {
        self.scan();
        Ok(())
    }

    /// Re-enumerate endpoints; a vanished selection is an implicit disconnect
    pub fn scan(&self) -> DiscoveryOutcome {
        let _link = self.link.lock();
        let outcome = self.discovery.pulse();
        if let Some(endpoint) = &outcome.selection_lost {
            self.context.invalidate();
            self.sink.write(
                LogKind::Warning,
                &format!("Endpoint {} disappeared, context released", endpoint),
            );
            self.notify(ConsoleEvent::LinkLost {
                endpoint: Some(endpoint.0.clone()),
                detail: "endpoint removed".to_string(),
            });
        }
        outcome
    }

    /// Select an endpoint and connect to it. `None` or the placeholder disconnects.
    ///
    /// Blocking: call from the blocking pool.
    pub fn select_endpoint(&self, endpoint: Option<&str>) -> Result<Option<String>, ConnectError> {
        let _link = self.link.lock();
        let endpoint = endpoint.map(Endpoint::from).filter(|e| !e.is_sentinel());
        let Some(endpoint) = endpoint else {
            let previous = self.discovery.select(None);
            self.context.disconnect();
            *self.snapshot.lock() = None;
            self.notify(ConsoleEvent::Disconnected {
                endpoint: previous.map(|e| e.0),
            });
            return Ok(None);
        };

        let uri = self.config.transport.uri_for(endpoint.as_str());
        self.discovery.select(Some(endpoint.clone()));
        info!(endpoint = %endpoint, uri = %uri, "Connecting");

        match self.context.connect(&uri) {
            Ok(()) => {
                self.notify(ConsoleEvent::Connected {
                    endpoint: endpoint.0,
                    uri: uri.clone(),
                });
                Ok(Some(uri))
            }
            Err(e) => {
                self.discovery.select(None);
                if e.kind.endpoint_gone() {
                    // Drop the stale entry now rather than at the next discovery pulse
                    self.discovery.pulse();
                }
                self.notify(ConsoleEvent::ConnectFailed {
                    kind: e.kind,
                    title: e.kind.title().to_string(),
                    detail: e.detail.clone(),
                });
                Err(e)
            }
        }
    }

    /// Blocking: probes the link
    pub fn status(&self) -> StatusReport {
        let (selection, uri) = {
            let _link = self.link.lock();
            (self.discovery.selection().map(|e| e.0), self.context.uri())
        };
        StatusReport {
            version: env!("CARGO_PKG_VERSION"),
            selection,
            uri,
            link: self.context.check(),
            teardowns: self.context.teardowns(),
        }
    }

    pub fn last_snapshot(&self) -> Option<RefreshSnapshot> {
        self.snapshot.lock().clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Weak;
    use std::thread;
    use std::time::Duration;
    use wethlink_context::SimStore;
    use wethlink_core::{ContextHandle, DeviceHandle, StoreError};

    type Hook = Arc<Mutex<Option<Box<dyn FnOnce() + Send>>>>;

    /// Runs a one-shot hook on the next device lookup or enumeration
    struct HookedStore {
        inner: Arc<SimStore>,
        hook: Hook,
    }

    struct HookedHandle {
        inner: Box<dyn ContextHandle>,
        hook: Hook,
    }

    impl AttributeStore for HookedStore {
        fn open(&self, uri: &str) -> Result<Box<dyn ContextHandle>, ConnectError> {
            let inner = self.inner.open(uri)?;
            Ok(Box::new(HookedHandle {
                inner,
                hook: self.hook.clone(),
            }))
        }
    }

    impl ContextHandle for HookedHandle {
        fn description(&self) -> Result<String, StoreError> {
            self.inner.description()
        }

        fn context_attrs(&self) -> Result<Vec<(String, String)>, StoreError> {
            self.inner.context_attrs()
        }

        fn device<'a>(&'a self, name: &str) -> Result<Box<dyn DeviceHandle + 'a>, StoreError> {
            let hook = self.hook.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            self.inner.device(name)
        }
    }

    /// Arms `hook` to select `endpoint` from another thread, then give it time to race
    fn race_select(
        hook: &Hook,
        state: &Arc<AppState>,
        endpoint: &'static str,
    ) -> Arc<Mutex<Option<thread::JoinHandle<bool>>>> {
        let joined = Arc::new(Mutex::new(None));
        let slot = joined.clone();
        let weak: Weak<AppState> = Arc::downgrade(state);
        *hook.lock() = Some(Box::new(move || {
            let Some(state) = weak.upgrade() else {
                return;
            };
            *slot.lock() = Some(thread::spawn(move || {
                state.select_endpoint(Some(endpoint)).is_ok()
            }));
            thread::sleep(Duration::from_millis(100));
        }));
        joined
    }

    fn hooked_state(ports: &[&str]) -> (Arc<SimStore>, Hook, Arc<AppState>) {
        let sim = Arc::new(SimStore::transceiver(ports));
        let hook: Hook = Arc::new(Mutex::new(None));
        let store = Arc::new(HookedStore {
            inner: sim.clone(),
            hook: hook.clone(),
        });
        let source = sim.clone();
        let on_scan = hook.clone();
        let enumerator = move || -> anyhow::Result<Vec<Endpoint>> {
            let ports = source.ports();
            let hook = on_scan.lock().take();
            if let Some(hook) = hook {
                hook();
            }
            Ok(ports.into_iter().map(Endpoint).collect())
        };
        let state = AppState::new(
            test_config(),
            store,
            Box::new(enumerator),
            CancellationToken::new(),
        );
        (sim, hook, state)
    }

    pub(crate) fn test_config() -> Config {
        let mut config = Config::default();
        config.diagnostics.file = false;
        config
    }

    /// State over a simulated transceiver whose plugged ports are the live endpoints
    pub(crate) fn sim_state(ports: &[&str]) -> (Arc<SimStore>, Arc<AppState>) {
        let store = Arc::new(SimStore::transceiver(ports));
        let source = store.clone();
        let enumerator = move || -> anyhow::Result<Vec<Endpoint>> {
            Ok(source.ports().into_iter().map(Endpoint).collect())
        };
        let state = AppState::new(
            test_config(),
            store.clone(),
            Box::new(enumerator),
            CancellationToken::new(),
        );
        (store, state)
    }

    #[tokio::test]
    async fn test_unplug_invalidates_on_discovery_pulse() {
        let (store, state) = sim_state(&["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        state.discovery_pulse().unwrap();
        assert_eq!(
            state.select_endpoint(Some("/dev/ttyUSB0")).unwrap().as_deref(),
            Some("serial:/dev/ttyUSB0,115200,8n2n")
        );
        assert_eq!(state.context.is_valid(), (true, String::new()));
        let mut events = state.subscribe();

        store.unplug("/dev/ttyUSB0");
        state.discovery_pulse().unwrap();

        assert_eq!(state.context.is_valid(), (false, String::new()));
        assert_eq!(state.context.teardowns(), 1);
        assert_eq!(state.discovery.selection(), None);
        assert_eq!(state.discovery.display_names(), vec!["No device", "/dev/ttyUSB1"]);
        assert_eq!(state.diagnostics.count_containing("disappeared"), 1);

        // The following refresh pulse touches nothing
        let reads = store.counters().attr_reads;
        state.refresh_pulse().unwrap();
        assert_eq!(store.counters().attr_reads, reads);

        let mut saw_link_lost = false;
        while let Ok(event) = events.try_recv() {
            if let ConsoleEvent::LinkLost { endpoint, .. } = event {
                assert_eq!(endpoint.as_deref(), Some("/dev/ttyUSB0"));
                saw_link_lost = true;
            }
        }
        assert!(saw_link_lost);
    }

    #[tokio::test]
    async fn test_health_pulse_clears_selection() {
        let (store, state) = sim_state(&["/dev/ttyUSB0"]);
        state.discovery_pulse().unwrap();
        state.select_endpoint(Some("/dev/ttyUSB0")).unwrap();

        state.health_pulse().unwrap();
        assert!(state.context.is_connected());

        store.unplug("/dev/ttyUSB0");
        state.health_pulse().unwrap();
        assert!(!state.context.is_connected());
        assert_eq!(state.discovery.selection(), None);
    }

    #[tokio::test]
    async fn test_select_during_health_pulse_keeps_selection() {
        let (sim, hook, state) = hooked_state(&["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        state.discovery_pulse().unwrap();
        state.select_endpoint(Some("/dev/ttyUSB0")).unwrap();

        sim.unplug("/dev/ttyUSB0");
        let joined = race_select(&hook, &state, "/dev/ttyUSB1");
        state.health_pulse().unwrap();

        let select = joined.lock().take().unwrap();
        assert!(select.join().unwrap());
        assert_eq!(state.discovery.selection(), Some(Endpoint::from("/dev/ttyUSB1")));
        assert_eq!(
            state.context.uri().as_deref(),
            Some("serial:/dev/ttyUSB1,115200,8n2n")
        );
        assert!(state.context.is_valid().0);
    }

    #[tokio::test]
    async fn test_select_during_scan_is_not_invalidated() {
        let (sim, hook, state) = hooked_state(&["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        state.discovery_pulse().unwrap();
        state.select_endpoint(Some("/dev/ttyUSB0")).unwrap();

        sim.unplug("/dev/ttyUSB0");
        let joined = race_select(&hook, &state, "/dev/ttyUSB1");
        let outcome = state.scan();
        assert_eq!(outcome.selection_lost, Some(Endpoint::from("/dev/ttyUSB0")));

        let select = joined.lock().take().unwrap();
        assert!(select.join().unwrap());
        assert_eq!(state.discovery.selection(), Some(Endpoint::from("/dev/ttyUSB1")));
        assert_eq!(
            state.context.uri().as_deref(),
            Some("serial:/dev/ttyUSB1,115200,8n2n")
        );
    }

    #[tokio::test]
    async fn test_health_pulse_drops_orphaned_selection() {
        let (store, state) = sim_state(&["/dev/ttyUSB0"]);
        state.discovery_pulse().unwrap();
        state.select_endpoint(Some("/dev/ttyUSB0")).unwrap();

        // A failed refresh read tears the link down behind the selection
        store.unplug("/dev/ttyUSB0");
        assert_eq!(state.context.read_attribute("mwc", "tx_target"), None);
        assert!(!state.context.is_connected());
        assert_eq!(state.discovery.selection(), Some(Endpoint::from("/dev/ttyUSB0")));

        state.health_pulse().unwrap();
        assert_eq!(state.discovery.selection(), None);
    }

    #[tokio::test]
    async fn test_refresh_snapshot() {
        let (_store, state) = sim_state(&["/dev/ttyUSB0"]);
        state.refresh_pulse().unwrap();
        assert!(state.last_snapshot().is_none());

        state.select_endpoint(Some("/dev/ttyUSB0")).unwrap();
        state.refresh_pulse().unwrap();
        let snapshot = state.last_snapshot().unwrap();
        assert_eq!(snapshot.readings.len(), state.config.monitors.len());

        let find = |device: &str, channel: Option<&str>, attr: &str| {
            snapshot
                .readings
                .iter()
                .find(|r| r.device == device && r.channel.as_deref() == channel && r.attr == attr)
                .unwrap()
                .clone()
        };
        assert_eq!(find("mwc", None, "tx_target").value.as_deref(), Some("50"));
        assert_eq!(find("mwc", Some("tx_det"), "raw").display.as_deref(), Some("60 mV"));
        assert_eq!(
            find("hmc6300", Some("temp"), "raw").display.as_deref(),
            Some("(+10...+45 °C)")
        );
        assert_eq!(find("hmc6301", None, "vco").display.as_deref(), Some("58.32 GHz"));
        assert!(state.context.is_connected());
    }

    #[tokio::test]
    async fn test_connect_failure_is_categorized() {
        let (store, state) = sim_state(&["/dev/ttyUSB0"]);
        store.fail_next_open(ConnectErrorKind::Busy);
        let err = state.select_endpoint(Some("/dev/ttyUSB0")).unwrap_err();
        assert_eq!(err.kind, ConnectErrorKind::Busy);
        assert_eq!(state.discovery.selection(), None);
        assert!(!state.context.is_connected());
    }

    #[tokio::test]
    async fn test_vanished_endpoint_leaves_list_on_connect() {
        let (store, state) = sim_state(&["/dev/ttyUSB0", "/dev/ttyUSB1"]);
        state.discovery_pulse().unwrap();
        store.unplug("/dev/ttyUSB1");

        let err = state.select_endpoint(Some("/dev/ttyUSB1")).unwrap_err();
        assert_eq!(err.kind, ConnectErrorKind::DeviceNotFound);
        assert_eq!(state.discovery.display_names(), vec!["No device", "/dev/ttyUSB0"]);
        assert_eq!(store.counters().opens, 0);
    }

    #[tokio::test]
    async fn test_select_placeholder_disconnects() {
        let (_store, state) = sim_state(&["/dev/ttyUSB0"]);
        state.select_endpoint(Some("/dev/ttyUSB0")).unwrap();
        assert!(state.context.is_connected());

        assert_eq!(state.select_endpoint(Some("No device")).unwrap(), None);
        assert!(!state.context.is_connected());
        assert_eq!(state.status().link, LinkStatus::NoContext);
    }

    #[tokio::test]
    async fn test_heartbeats_drive_pulses() {
        let (_store, state) = sim_state(&["/dev/ttyUSB0"]);
        state.start_heartbeats().unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        state.heartbeats.shutdown().await;

        let tasks = state.heartbeats.tasks();
        let names: Vec<&str> = tasks.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["refresh", "health", "discovery"]);
        assert!(tasks.iter().all(|t| t.pulses >= 1 && t.failures == 0));
        // First discovery pulse populated the list
        assert_eq!(state.discovery.endpoints(), vec![Endpoint::from("/dev/ttyUSB0")]);
    }
}
