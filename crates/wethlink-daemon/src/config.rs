//! Configuration loading

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;
use wethlink_context::{IioCliConfig, ProbeTarget};
use wethlink_core::diag::DEFAULT_MAX_BYTES;
use wethlink_core::TransportConfig;
use wethlink_discovery::SerialEnumeratorConfig;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub probe: ProbeTarget,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub discovery: SerialEnumeratorConfig,
    #[serde(default)]
    pub iio: IioCliConfig,
    /// Attributes read on every refresh pulse
    #[serde(default = "default_monitors", rename = "monitor")]
    pub monitors: Vec<MonitorConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            transport: TransportConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            probe: ProbeTarget::default(),
            diagnostics: DiagnosticsConfig::default(),
            discovery: SerialEnumeratorConfig::default(),
            iio: IioCliConfig::default(),
            monitors: default_monitors(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Bind address for the console API
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Pulse cadences in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,
    #[serde(default = "default_health_ms")]
    pub health_ms: u64,
    #[serde(default = "default_discovery_ms")]
    pub discovery_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            refresh_ms: default_refresh_ms(),
            health_ms: default_health_ms(),
            discovery_ms: default_discovery_ms(),
        }
    }
}

impl HeartbeatConfig {
    pub fn refresh(&self) -> Duration {
        Duration::from_millis(self.refresh_ms)
    }

    pub fn health(&self) -> Duration {
        Duration::from_millis(self.health_ms)
    }

    pub fn discovery(&self) -> Duration {
        Duration::from_millis(self.discovery_ms)
    }
}

fn default_refresh_ms() -> u64 {
    2000
}

fn default_health_ms() -> u64 {
    2000
}

fn default_discovery_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsConfig {
    /// Append entries to `path`
    #[serde(default = "default_true")]
    pub file: bool,
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    /// Size at which the oldest lines are trimmed
    #[serde(default = "default_max_bytes")]
    pub max_bytes: u64,
    /// Entries kept in memory for the console
    #[serde(default = "default_recent")]
    pub recent: usize,
    /// Mirror entries into the process log
    #[serde(default)]
    pub tracing: bool,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            file: true,
            path: default_log_path(),
            max_bytes: default_max_bytes(),
            recent: default_recent(),
            tracing: false,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_log_path() -> PathBuf {
    PathBuf::from("logs/logs.txt")
}

fn default_max_bytes() -> u64 {
    DEFAULT_MAX_BYTES
}

fn default_recent() -> usize {
    256
}

/// One attribute read by the refresh pulse
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    pub device: String,
    #[serde(default)]
    pub channel: Option<String>,
    pub attr: String,
}

impl MonitorConfig {
    fn device_attr(device: &str, attr: &str) -> Self {
        Self {
            device: device.to_string(),
            channel: None,
            attr: attr.to_string(),
        }
    }

    fn channel_attr(device: &str, channel: &str, attr: &str) -> Self {
        Self {
            device: device.to_string(),
            channel: Some(channel.to_string()),
            attr: attr.to_string(),
        }
    }
}

fn default_monitors() -> Vec<MonitorConfig> {
    let mut monitors: Vec<MonitorConfig> = [
        "tx_autotuning",
        "rx_autotuning",
        "tx_auto_ifvga",
        "rx_auto_ifvga_rflna",
        "tx_target",
        "rx_target",
    ]
    .iter()
    .map(|attr| MonitorConfig::device_attr("mwc", attr))
    .collect();

    monitors.push(MonitorConfig::channel_attr("mwc", "tx_det", "raw"));
    monitors.push(MonitorConfig::channel_attr("mwc", "rx_det", "raw"));
    for (device, attrs) in [
        ("hmc6300", &["enabled", "vco", "if_attn", "rf_attn"][..]),
        ("hmc6301", &["enabled", "vco", "if_attn", "rf_lna_gain"][..]),
    ] {
        monitors.extend(attrs.iter().map(|attr| MonitorConfig::device_attr(device, attr)));
        monitors.push(MonitorConfig::channel_attr(device, "temp", "raw"));
    }
    monitors
}

/// Load configuration from file, falling back to defaults when it is missing
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = load_config(&dir.path().join("wethlink.toml")).unwrap();
        assert_eq!(config.daemon.bind, "127.0.0.1:8080");
        assert_eq!(config.heartbeat.refresh(), Duration::from_secs(2));
        assert_eq!(config.heartbeat.discovery(), Duration::from_secs(5));
        assert_eq!(config.probe, ProbeTarget::default());
        assert_eq!(config.transport.uri_for("/dev/ttyUSB0"), "serial:/dev/ttyUSB0,115200,8n2n");
        assert_eq!(config.monitors.len(), 18);
    }

    #[test]
    fn test_partial_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wethlink.toml");
        std::fs::write(
            &path,
            r#"
[heartbeat]
discovery_ms = 750

[transport]
baud = 57600

[diagnostics]
file = false

[[monitor]]
device = "mwc"
attr = "tx_target"

[[monitor]]
device = "mwc"
channel = "tx_det"
attr = "raw"
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.heartbeat.discovery_ms, 750);
        assert_eq!(config.heartbeat.health_ms, 2000);
        assert_eq!(config.transport.baud, 57600);
        assert_eq!(config.transport.framing, "8n2n");
        assert!(!config.diagnostics.file);
        assert_eq!(config.diagnostics.recent, 256);
        assert_eq!(config.monitors.len(), 2);
        assert_eq!(config.monitors[1].channel.as_deref(), Some("tx_det"));
        assert_eq!(config.iio.timeout_ms, 3000);
    }

    #[test]
    fn test_empty_file_gets_default_monitors() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wethlink.toml");
        std::fs::write(&path, "").unwrap();
        let config = load_config(&path).unwrap();
        assert_eq!(config.monitors, default_monitors());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wethlink.toml");
        std::fs::write(&path, "[heartbeat\nrefresh_ms = ").unwrap();
        assert!(load_config(&path).is_err());
    }
}
