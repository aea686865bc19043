//! Attribute store backed by the libiio command-line utilities
//!
//! Each call runs one `iio_attr` / `iio_reg` process against the context URI
//! and waits for it with a deadline. Output is drained while the tool runs.
//! A serial endpoint is opened once with `serialport` before the context is
//! created so that missing, busy and forbidden ports are classified by kind.

use serde::{Deserialize, Serialize};
use std::io::{self, Read};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, trace};
use wethlink_core::{
    AttributeStore, ChannelHandle, ConnectError, ConnectErrorKind, ContextHandle, DeviceHandle,
    StoreError, TransportUri,
};

/// Commands and limits for the CLI backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IioCliConfig {
    /// Attribute tool and leading arguments
    #[serde(default = "default_attr_command")]
    pub attr_command: Vec<String>,
    /// Register tool and leading arguments
    #[serde(default = "default_reg_command")]
    pub reg_command: Vec<String>,
    /// Context information tool and leading arguments
    #[serde(default = "default_info_command")]
    pub info_command: Vec<String>,
    /// Per-call deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for IioCliConfig {
    fn default() -> Self {
        Self {
            attr_command: default_attr_command(),
            reg_command: default_reg_command(),
            info_command: default_info_command(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_attr_command() -> Vec<String> {
    vec!["iio_attr".to_string()]
}

fn default_reg_command() -> Vec<String> {
    vec!["iio_reg".to_string()]
}

fn default_info_command() -> Vec<String> {
    vec!["iio_info".to_string()]
}

fn default_timeout_ms() -> u64 {
    3000
}

/// libiio CLI attribute store
#[derive(Debug, Clone, Default)]
pub struct IioCliStore {
    config: Arc<IioCliConfig>,
}

impl IioCliStore {
    pub fn new(config: IioCliConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }
}

impl AttributeStore for IioCliStore {
    fn open(&self, uri: &str) -> Result<Box<dyn ContextHandle>, ConnectError> {
        let parsed = TransportUri::parse(uri).ok_or_else(|| {
            ConnectError::new(ConnectErrorKind::Unknown, uri, "malformed context URI")
        })?;

        if parsed.scheme == "serial" {
            preflight_serial(uri, &parsed, self.timeout())?;
        }

        let args = ["-u".to_string(), uri.to_string()];
        let output = run(&self.config.info_command, &args, self.timeout()).map_err(|e| {
            // A tool that cannot be spawned says nothing about the endpoint
            let kind = match e {
                StoreError::Io(_) => ConnectErrorKind::Unknown,
                _ => ConnectErrorKind::NotSupported,
            };
            ConnectError::new(kind, uri, e.to_string())
        })?;

        let description = output
            .lines()
            .find_map(|l| l.trim().strip_prefix("Backend description string:"))
            .map(|d| d.trim().to_string())
            .unwrap_or_default();
        debug!(uri = %uri, description = %description, "iio context opened");

        Ok(Box::new(CliContext {
            config: self.config.clone(),
            uri: uri.to_string(),
            description,
        }))
    }
}

/// Open and close the serial port once to classify unreachable endpoints
fn preflight_serial(uri: &str, parsed: &TransportUri, timeout: Duration) -> Result<(), ConnectError> {
    let baud = parsed.baud().unwrap_or(115200);
    match serialport::new(parsed.endpoint.as_str(), baud)
        .timeout(timeout)
        .open()
    {
        Ok(port) => {
            drop(port);
            Ok(())
        }
        Err(e) => Err(ConnectError::new(serial_error_kind(e.kind()), uri, e.to_string())),
    }
}

/// `serialport` reports a port locked by another opener (EBUSY from
/// TIOCEXCL, a held flock) as `NoDevice`; a missing node is `Io(NotFound)`.
#[cfg(unix)]
fn serial_error_kind(kind: serialport::ErrorKind) -> ConnectErrorKind {
    match kind {
        serialport::ErrorKind::NoDevice => ConnectErrorKind::Busy,
        serialport::ErrorKind::Io(kind) => ConnectErrorKind::from_io(&io::Error::from(kind)),
        _ => ConnectErrorKind::Unknown,
    }
}

/// Windows folds "not found", "access denied" and "in use" into `NoDevice`
#[cfg(not(unix))]
fn serial_error_kind(kind: serialport::ErrorKind) -> ConnectErrorKind {
    match kind {
        serialport::ErrorKind::NoDevice => ConnectErrorKind::DeviceNotFound,
        serialport::ErrorKind::Io(kind) => ConnectErrorKind::from_io(&io::Error::from(kind)),
        _ => ConnectErrorKind::Unknown,
    }
}

/// Read a pipe to the end on its own thread
fn drain<R: Read + Send + 'static>(mut pipe: R) -> thread::JoinHandle<io::Result<String>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        pipe.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    })
}

fn collect(reader: Option<thread::JoinHandle<io::Result<String>>>) -> Result<String, StoreError> {
    match reader {
        Some(reader) => reader
            .join()
            .map_err(|_| StoreError::Link("output reader panicked".to_string()))?
            .map_err(StoreError::from),
        None => Ok(String::new()),
    }
}

/// Run `command + args`, returning trimmed stdout or failing past `timeout`
fn run(command: &[String], args: &[String], timeout: Duration) -> Result<String, StoreError> {
    let (program, leading) = command
        .split_first()
        .ok_or_else(|| StoreError::Link("empty command".to_string()))?;

    trace!(program = %program, args = ?args, "Running iio tool");
    let mut child = Command::new(program)
        .args(leading)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if Instant::now() >= deadline {
            // Readers are left to finish on their own; a grandchild may still hold the pipes
            let _ = child.kill();
            let _ = child.wait();
            return Err(StoreError::Timeout(timeout));
        }
        thread::sleep(Duration::from_millis(5));
    };

    let stdout = collect(stdout)?;
    let stderr = collect(stderr)?;

    if status.success() {
        Ok(stdout.trim().to_string())
    } else {
        let detail = stderr.trim();
        Err(StoreError::Link(if detail.is_empty() {
            format!("{} exited with {}", program, status)
        } else {
            detail.to_string()
        }))
    }
}

/// Value from `iio_attr` output, which may be decorated as `value :'x'`
fn attr_value(output: &str) -> String {
    match output.rsplit_once("value :'") {
        Some((_, rest)) => rest.trim_end().trim_end_matches('\'').to_string(),
        None => output.trim().to_string(),
    }
}

struct CliContext {
    config: Arc<IioCliConfig>,
    uri: String,
    description: String,
}

impl CliContext {
    fn attr(&self, args: &[&str]) -> Result<String, StoreError> {
        let mut full = vec!["-u".to_string(), self.uri.clone()];
        full.extend(args.iter().map(|a| a.to_string()));
        run(&self.config.attr_command, &full, self.timeout()).map(|o| attr_value(&o))
    }

    fn reg(&self, args: &[String]) -> Result<String, StoreError> {
        let mut full = vec!["-u".to_string(), self.uri.clone()];
        full.extend_from_slice(args);
        run(&self.config.reg_command, &full, self.timeout())
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }
}

impl ContextHandle for CliContext {
    fn description(&self) -> Result<String, StoreError> {
        Ok(self.description.clone())
    }

    fn context_attrs(&self) -> Result<Vec<(String, String)>, StoreError> {
        let output = self.attr(&["-C"])?;
        Ok(output
            .lines()
            .map(str::trim)
            .filter(|l| !l.starts_with("IIO context") && !l.starts_with("Using"))
            .filter_map(|l| l.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect())
    }

    fn device<'a>(&'a self, name: &str) -> Result<Box<dyn DeviceHandle + 'a>, StoreError> {
        Ok(Box::new(CliDevice {
            ctx: self,
            name: name.to_string(),
        }))
    }
}

struct CliDevice<'a> {
    ctx: &'a CliContext,
    name: String,
}

impl DeviceHandle for CliDevice<'_> {
    fn name(&self) -> &str {
        &self.name
    }

    fn read_attr(&self, attr: &str) -> Result<String, StoreError> {
        self.ctx.attr(&["-d", &self.name, attr])
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<(), StoreError> {
        self.ctx.attr(&["-d", &self.name, attr, value]).map(|_| ())
    }

    fn channel<'b>(&'b self, name: &str) -> Result<Box<dyn ChannelHandle + 'b>, StoreError> {
        Ok(Box::new(CliChannel {
            device: self,
            name: name.to_string(),
        }))
    }

    fn reg_read(&self, addr: u32) -> Result<u32, StoreError> {
        let output = self.ctx.reg(&[self.name.clone(), format!("0x{:x}", addr)])?;
        let text = output.trim();
        let parsed = match text.strip_prefix("0x") {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => text.parse(),
        };
        parsed.map_err(|_| StoreError::Link(format!("unexpected register output '{}'", text)))
    }

    fn reg_write(&self, addr: u32, value: u32) -> Result<(), StoreError> {
        self.ctx
            .reg(&[
                self.name.clone(),
                format!("0x{:x}", addr),
                format!("0x{:x}", value),
            ])
            .map(|_| ())
    }
}

struct CliChannel<'a> {
    device: &'a CliDevice<'a>,
    name: String,
}

impl ChannelHandle for CliChannel<'_> {
    fn read_attr(&self, attr: &str) -> Result<String, StoreError> {
        self.device
            .ctx
            .attr(&["-c", &self.device.name, &self.name, attr])
    }

    fn write_attr(&self, attr: &str, value: &str) -> Result<(), StoreError> {
        self.device
            .ctx
            .attr(&["-c", &self.device.name, &self.name, attr, value])
            .map(|_| ())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    const URI: &str = "ip:192.168.2.1";

    fn script(dir: &TempDir, name: &str, body: &str) -> Vec<String> {
        let path = dir.path().join(name);
        fs::write(&path, body).unwrap();
        vec!["sh".to_string(), path.display().to_string()]
    }

    fn fake_store(dir: &TempDir, timeout_ms: u64) -> IioCliStore {
        IioCliStore::new(IioCliConfig {
            attr_command: script(
                dir,
                "attr.sh",
                r#"case "$*" in
  *" -C") printf 'IIO context with 3 devices:\nhw_model: WL-60\nhw_serial: 0042\n' ;;
  *"-d mwc tx_target") echo "dev 'mwc', attr 'tx_target', value :'50'" ;;
  *"-d mwc tx_target "*) exit 0 ;;
  *"-c mwc tx_det scale") echo 0.5 ;;
  *"slow"*) sleep 5 ;;
  *) echo "attribute not found" >&2; exit 1 ;;
esac
"#,
            ),
            reg_command: script(
                dir,
                "reg.sh",
                r#"case "$*" in
  *"hmc6300 0x5") echo 0x2a ;;
  *"hmc6300 0x5 0x"*) exit 0 ;;
  *) exit 2 ;;
esac
"#,
            ),
            info_command: script(
                dir,
                "info.sh",
                "echo 'Library version: 0.25'\necho 'Backend description string: wethlink fw 1.4'\n",
            ),
            timeout_ms,
        })
    }

    #[test]
    fn test_attr_value_decoration() {
        assert_eq!(attr_value("dev 'mwc', attr 'tx_target', value :'50'"), "50");
        assert_eq!(attr_value("  7\n"), "7");
    }

    #[test]
    fn test_open_and_read() {
        let dir = TempDir::new().unwrap();
        let store = fake_store(&dir, 2000);
        let ctx = store.open(URI).unwrap();
        assert_eq!(ctx.description().unwrap(), "wethlink fw 1.4");

        let attrs = ctx.context_attrs().unwrap();
        assert_eq!(
            attrs,
            vec![
                ("hw_model".to_string(), "WL-60".to_string()),
                ("hw_serial".to_string(), "0042".to_string()),
            ]
        );

        let mwc = ctx.device("mwc").unwrap();
        assert_eq!(mwc.read_attr("tx_target").unwrap(), "50");
        mwc.write_attr("tx_target", "60").unwrap();
        assert_eq!(mwc.channel("tx_det").unwrap().read_attr("scale").unwrap(), "0.5");
        assert!(matches!(mwc.read_attr("bogus"), Err(StoreError::Link(msg)) if msg == "attribute not found"));
    }

    #[test]
    fn test_registers() {
        let dir = TempDir::new().unwrap();
        let store = fake_store(&dir, 2000);
        let ctx = store.open(URI).unwrap();
        let tx = ctx.device("hmc6300").unwrap();
        assert_eq!(tx.reg_read(5).unwrap(), 0x2a);
        tx.reg_write(5, 0x11).unwrap();
        assert!(tx.reg_read(6).is_err());
    }

    #[test]
    fn test_call_timeout() {
        let dir = TempDir::new().unwrap();
        let store = fake_store(&dir, 100);
        let ctx = store.open(URI).unwrap();
        let started = Instant::now();
        let err = ctx.device("mwc").unwrap().read_attr("slow").unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_large_output_does_not_stall() {
        let dir = TempDir::new().unwrap();
        let store = IioCliStore::new(IioCliConfig {
            info_command: script(
                &dir,
                "info.sh",
                "i=0\nwhile [ $i -lt 4000 ]; do\n  echo \"  attr $i: channel value with padding to fill the pipe\"\n  i=$((i+1))\ndone\necho 'Backend description string: wethlink fw 1.4'\n",
            ),
            ..IioCliConfig::default()
        });
        let started = Instant::now();
        let ctx = store.open(URI).unwrap();
        assert_eq!(ctx.description().unwrap(), "wethlink fw 1.4");
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[test]
    fn test_serial_error_kinds() {
        use serialport::ErrorKind as K;
        assert_eq!(serial_error_kind(K::NoDevice), ConnectErrorKind::Busy);
        assert_eq!(
            serial_error_kind(K::Io(io::ErrorKind::NotFound)),
            ConnectErrorKind::DeviceNotFound
        );
        assert_eq!(
            serial_error_kind(K::Io(io::ErrorKind::PermissionDenied)),
            ConnectErrorKind::PermissionDenied
        );
        assert_eq!(serial_error_kind(K::InvalidInput), ConnectErrorKind::Unknown);
    }

    #[test]
    fn test_open_failure_kinds() {
        let dir = TempDir::new().unwrap();
        let store = IioCliStore::new(IioCliConfig {
            info_command: script(&dir, "info.sh", "exit 1\n"),
            ..IioCliConfig::default()
        });
        let err = store.open(URI).err().unwrap();
        assert_eq!(err.kind, ConnectErrorKind::NotSupported);

        let store = IioCliStore::new(IioCliConfig {
            info_command: vec!["/nonexistent/iio_info".to_string()],
            ..IioCliConfig::default()
        });
        let err = store.open(URI).err().unwrap();
        assert_eq!(err.kind, ConnectErrorKind::Unknown);

        let err = store.open("serial:/dev/wethlink-no-such-port,115200,8n2n").err().unwrap();
        assert!(err.kind.endpoint_gone());
    }
}
