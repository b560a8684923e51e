#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Structured diagnostics shared across the rosette services.
//!
//! The core never formats or persists log output itself. It writes
//! [`LogRecord`]s into a [`DiagnosticSink`], and the embedding process decides
//! where those records end up (a JSON-lines file, `tracing`, memory, or all of
//! them at once).

use std::{
    collections::VecDeque,
    fmt,
    fs::{self, File},
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Log severity level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    /// Debug information.
    Debug,
    /// Informational events.
    Info,
    /// Warning indicator.
    Warn,
    /// Error indicator.
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Debug => write!(f, "DEBUG"),
            Self::Info => write!(f, "INFO"),
            Self::Warn => write!(f, "WARN"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// Structured diagnostic event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Timestamp in ISO8601.
    pub timestamp: DateTime<Utc>,
    /// Component or node emitting the record.
    pub source: String,
    /// Severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
    /// Arbitrary JSON payload for structured fields.
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl LogRecord {
    /// Creates a record with the provided info.
    #[must_use]
    pub fn new(source: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            source: source.into(),
            level,
            message: message.into(),
            metadata: serde_json::Map::new(),
        }
    }

    /// Attaches structured fields. Non-object values are stored under `value`.
    #[must_use]
    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        match metadata {
            serde_json::Value::Object(map) => self.metadata.extend(map),
            serde_json::Value::Null => {}
            other => {
                self.metadata.insert("value".into(), other);
            }
        }
        self
    }
}

/// Destination for diagnostic events emitted by the core services.
///
/// Implementations must not panic and must swallow their own I/O failures;
/// emitting a diagnostic can never fail the operation that produced it.
pub trait DiagnosticSink: Send + Sync {
    /// Records a single event.
    fn emit(&self, record: LogRecord);
}

/// Shared, type-erased sink handle passed to every service.
pub type SharedSink = Arc<dyn DiagnosticSink>;

/// Convenience helpers available on every sink.
pub trait DiagnosticSinkExt: DiagnosticSink {
    /// Builds and emits a record in one call.
    fn record(&self, source: &str, level: LogLevel, message: &str, metadata: serde_json::Value) {
        self.emit(LogRecord::new(source, level, message).with_metadata(metadata));
    }
}

impl<S: DiagnosticSink + ?Sized> DiagnosticSinkExt for S {}

/// Thread-safe JSON logger with append-only semantics.
#[derive(Debug)]
pub struct JsonLogger {
    path: PathBuf,
    writer: Mutex<File>,
}

impl JsonLogger {
    /// Creates or opens a logger at the desired path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self {
            path,
            writer: Mutex::new(file),
        })
    }

    /// Writes a log record as JSON line.
    pub fn log(&self, record: &LogRecord) -> Result<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }

    /// Returns the underlying file path (useful for tests).
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DiagnosticSink for JsonLogger {
    fn emit(&self, record: LogRecord) {
        if let Err(err) = self.log(&record) {
            eprintln!("diagnostic write to {} failed: {err:?}", self.path.display());
        }
    }
}

/// Forwards records to the `tracing` macros.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, record: LogRecord) {
        let metadata = serde_json::Value::Object(record.metadata);
        match record.level {
            LogLevel::Debug => {
                tracing::debug!(source = %record.source, %metadata, "{}", record.message);
            }
            LogLevel::Info => {
                tracing::info!(source = %record.source, %metadata, "{}", record.message);
            }
            LogLevel::Warn => {
                tracing::warn!(source = %record.source, %metadata, "{}", record.message);
            }
            LogLevel::Error => {
                tracing::error!(source = %record.source, %metadata, "{}", record.message);
            }
        }
    }
}

/// Bounded in-memory ring of the most recent records.
#[derive(Debug)]
pub struct MemorySink {
    capacity: usize,
    records: Mutex<VecDeque<LogRecord>>,
}

impl MemorySink {
    /// Creates a sink retaining at most `capacity` records.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Snapshot of retained records, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Records at or above the given level.
    #[must_use]
    pub fn at_least(&self, level: LogLevel) -> Vec<LogRecord> {
        self.records
            .lock()
            .iter()
            .filter(|record| record.level >= level)
            .cloned()
            .collect()
    }

    /// Returns true when any retained record's message contains `needle`.
    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|record| record.message.contains(needle))
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Whether no record has been retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(512)
    }
}

impl DiagnosticSink for MemorySink {
    fn emit(&self, record: LogRecord) {
        let mut records = self.records.lock();
        records.push_back(record);
        while records.len() > self.capacity {
            records.pop_front();
        }
    }
}

/// Duplicates every record into several sinks.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<SharedSink>,
}

impl fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl FanoutSink {
    /// Creates an empty fanout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a destination.
    #[must_use]
    pub fn with(mut self, sink: SharedSink) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl DiagnosticSink for FanoutSink {
    fn emit(&self, record: LogRecord) {
        if let Some((last, rest)) = self.sinks.split_last() {
            for sink in rest {
                sink.emit(record.clone());
            }
            last.emit(record);
        }
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl DiagnosticSink for NullSink {
    fn emit(&self, _record: LogRecord) {}
}
