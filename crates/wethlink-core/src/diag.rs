//! Diagnostic sink
//!
//! Append-only, human-readable log of device activity. Callers hand over a
//! kind and a message and never see a failure: sinks swallow their own
//! errors and report them through `tracing` instead.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Category of a diagnostic entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogKind {
    Default,
    Device,
    Warning,
    Error,
    Ui,
}

impl LogKind {
    /// Header prefix written before the timestamp
    pub fn header(&self) -> &'static str {
        match self {
            LogKind::Default => "--- Message: ",
            LogKind::Device => "--- IIO Device: ",
            LogKind::Warning => "--- Warning: ",
            LogKind::Error => "--- Error: ",
            LogKind::Ui => "--- UI: ",
        }
    }
}

/// Consumer of diagnostic entries
pub trait DiagnosticSink: Send + Sync {
    /// Record one entry. Must not panic or block for long.
    fn write(&self, kind: LogKind, message: &str);
}

impl<T: DiagnosticSink + ?Sized> DiagnosticSink for Arc<T> {
    fn write(&self, kind: LogKind, message: &str) {
        (**self).write(kind, message)
    }
}

/// A recorded entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: LogKind,
    pub message: String,
    pub at: DateTime<Local>,
}

/// Mirrors entries into `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn write(&self, kind: LogKind, message: &str) {
        match kind {
            LogKind::Error => error!(target: "wethlink::diag", "{}", message),
            LogKind::Warning => warn!(target: "wethlink::diag", "{}", message),
            LogKind::Device | LogKind::Default => info!(target: "wethlink::diag", "{}", message),
            LogKind::Ui => debug!(target: "wethlink::diag", "{}", message),
        }
    }
}

/// Default size limit of the log file (5 MiB)
pub const DEFAULT_MAX_BYTES: u64 = 5 * 1024 * 1024;

/// Appends entries to a text file and trims the oldest lines past a size limit
#[derive(Debug)]
pub struct FileSink {
    path: PathBuf,
    max_bytes: u64,
    lock: Mutex<()>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn append(&self, kind: LogKind, message: &str) -> io::Result<()> {
        let _guard = self.lock.lock();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let stamp = Local::now().format("%d-%m-%Y  %H:%M:%S:%6f");
        write!(file, "{}{}\n{}\n\n\n", kind.header(), stamp, message)?;
        drop(file);

        self.trim()
    }

    /// Drop leading lines until the file is at most 90% of the limit
    fn trim(&self) -> io::Result<()> {
        let size = fs::metadata(&self.path)?.len();
        if size <= self.max_bytes {
            return Ok(());
        }

        let target = self.max_bytes / 10 * 9;
        let content = fs::read_to_string(&self.path)?;
        let mut excess = size.saturating_sub(target) as usize;
        let mut start = 0;
        for line in content.split_inclusive('\n') {
            if excess == 0 {
                break;
            }
            start += line.len();
            excess = excess.saturating_sub(line.len());
        }

        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, &content[start..])?;
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), dropped = start, "Trimmed diagnostic log");
        Ok(())
    }
}

impl DiagnosticSink for FileSink {
    fn write(&self, kind: LogKind, message: &str) {
        if let Err(e) = self.append(kind, message) {
            warn!(path = %self.path.display(), error = %e, "Failed to write diagnostic log");
        }
    }
}

/// Keeps the most recent entries in memory
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of recorded entries, oldest first
    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of entries whose message contains `needle`
    pub fn count_containing(&self, needle: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.message.contains(needle))
            .count()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl DiagnosticSink for MemorySink {
    fn write(&self, kind: LogKind, message: &str) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(LogEntry {
            kind,
            message: message.to_string(),
            at: Local::now(),
        });
    }
}

/// Writes every entry to each inner sink
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn DiagnosticSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl DiagnosticSink for FanoutSink {
    fn write(&self, kind: LogKind, message: &str) {
        for sink in &self.sinks {
            sink.write(kind, message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_file_sink_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs").join("logs.txt");
        let sink = FileSink::new(&path, DEFAULT_MAX_BYTES);

        sink.write(LogKind::Device, "write tx_target");
        sink.write(LogKind::Error, "boom");

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[0].starts_with("--- IIO Device: "));
        assert_eq!(lines[1], "write tx_target");
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "");
        assert!(lines[4].starts_with("--- Error: "));
        assert_eq!(lines[5], "boom");
    }

    #[test]
    fn test_file_sink_trims_oldest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("logs.txt");
        let sink = FileSink::new(&path, 2048);

        for i in 0..100 {
            sink.write(LogKind::Default, &format!("entry number {:03}", i));
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.len() as u64 <= 2048);
        assert!(content.contains("entry number 099"));
        assert!(!content.contains("entry number 000"));
    }

    #[test]
    fn test_file_sink_never_fails_caller() {
        let dir = TempDir::new().unwrap();
        // A directory where the file should be
        let sink = FileSink::new(dir.path(), DEFAULT_MAX_BYTES);
        sink.write(LogKind::Warning, "ignored");
    }

    #[test]
    fn test_memory_sink_capacity() {
        let sink = MemorySink::new(2);
        sink.write(LogKind::Device, "a");
        sink.write(LogKind::Error, "b");
        sink.write(LogKind::Device, "c");
        let entries = sink.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message, "b");
        assert_eq!(entries[1].kind, LogKind::Device);
        assert_eq!(entries[1].message, "c");
    }

    #[test]
    fn test_fanout() {
        let a = Arc::new(MemorySink::default());
        let b = Arc::new(MemorySink::default());
        let fanout = FanoutSink::new().with(a.clone()).with(b.clone());
        fanout.write(LogKind::Ui, "hello");
        assert_eq!(a.count_containing("hello"), 1);
        assert_eq!(b.count_containing("hello"), 1);
    }
}
