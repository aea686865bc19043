//! Transport URI composition
//!
//! A context URI is `<scheme>:<endpoint>,<parameters>`, for example
//! `serial:/dev/ttyUSB0,115200,8n2n`.

use serde::{Deserialize, Serialize};

/// Fixed connection-type prefix and transport parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Connection type prefix
    #[serde(default = "default_scheme")]
    pub scheme: String,
    /// Baud rate
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// Framing: data bits, parity, stop bits, flow control
    #[serde(default = "default_framing")]
    pub framing: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            scheme: default_scheme(),
            baud: default_baud(),
            framing: default_framing(),
        }
    }
}

fn default_scheme() -> String {
    "serial".to_string()
}

fn default_baud() -> u32 {
    115200
}

fn default_framing() -> String {
    "8n2n".to_string()
}

impl TransportConfig {
    /// Build the full context URI for an endpoint
    pub fn uri_for(&self, endpoint: &str) -> String {
        format!(
            "{}:{},{},{}",
            self.scheme,
            port_path(endpoint),
            self.baud,
            self.framing
        )
    }
}

/// Platform path of a serial endpoint. Bare POSIX names get `/dev/`.
pub fn port_path(name: &str) -> String {
    if cfg!(unix) && !name.starts_with('/') {
        format!("/dev/{}", name)
    } else {
        name.to_string()
    }
}

/// A parsed context URI
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportUri {
    pub scheme: String,
    pub endpoint: String,
    pub params: Vec<String>,
}

impl TransportUri {
    /// Split `scheme:endpoint,param,param`
    pub fn parse(uri: &str) -> Option<Self> {
        let (scheme, rest) = uri.split_once(':')?;
        if scheme.is_empty() {
            return None;
        }
        let mut parts = rest.split(',');
        let endpoint = parts.next().filter(|e| !e.is_empty())?;
        Some(Self {
            scheme: scheme.to_string(),
            endpoint: endpoint.to_string(),
            params: parts.map(str::to_string).collect(),
        })
    }

    /// Baud rate parameter, if present and numeric
    pub fn baud(&self) -> Option<u32> {
        self.params.first().and_then(|b| b.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(unix)]
    fn test_uri_for_bare_name() {
        let config = TransportConfig::default();
        assert_eq!(config.uri_for("ttyUSB0"), "serial:/dev/ttyUSB0,115200,8n2n");
        assert_eq!(config.uri_for("/dev/ttyACM1"), "serial:/dev/ttyACM1,115200,8n2n");
    }

    #[test]
    fn test_parse_uri() {
        let uri = TransportUri::parse("serial:/dev/ttyUSB0,115200,8n2n").unwrap();
        assert_eq!(uri.scheme, "serial");
        assert_eq!(uri.endpoint, "/dev/ttyUSB0");
        assert_eq!(uri.params, vec!["115200", "8n2n"]);
        assert_eq!(uri.baud(), Some(115200));

        let uri = TransportUri::parse("ip:192.168.2.1").unwrap();
        assert_eq!(uri.endpoint, "192.168.2.1");
        assert!(uri.params.is_empty());
        assert_eq!(uri.baud(), None);

        assert!(TransportUri::parse("serial:").is_none());
        assert!(TransportUri::parse("/dev/ttyUSB0").is_none());
    }
}
