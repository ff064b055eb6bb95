//! Structured error and file-stats reporting.
//!
//! The engine reports through a [`DiagnosticsSink`] trait object and does not
//! depend on the concrete reporter's behavior. Repeated reports for the same
//! path replace the prior report; an empty error list clears diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tether_types::{CanonicalPath, FileMetadata};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub severity: Severity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl DiagnosticEntry {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            line: None,
            column: None,
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
            line: None,
            column: None,
        }
    }
}

/// Performance timings attached to a report, in milliseconds.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Timings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub read_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_ms: Option<u64>,
}

/// One report for one path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<FileMetadata>,
    pub errors: Vec<DiagnosticEntry>,
    #[serde(default)]
    pub timings: Timings,
}

impl FileReport {
    pub fn stats(metadata: FileMetadata) -> Self {
        Self {
            metadata: Some(metadata),
            errors: Vec::new(),
            timings: Timings::default(),
        }
    }

    pub fn failure(entry: DiagnosticEntry) -> Self {
        Self {
            metadata: None,
            errors: vec![entry],
            timings: Timings::default(),
        }
    }

    pub fn with_write_ms(mut self, write_ms: u64) -> Self {
        self.timings.write_ms = Some(write_ms);
        self
    }
}

/// Boundary interface for diagnostics reporting.
pub trait DiagnosticsSink: Send + Sync {
    fn report(&self, path: &CanonicalPath, report: FileReport);
}

/// Sink that forwards reports to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn report(&self, path: &CanonicalPath, report: FileReport) {
        if report.errors.is_empty() {
            debug!(path = %path, metadata = ?report.metadata, timings = ?report.timings, "file stats");
        } else {
            for entry in &report.errors {
                warn!(path = %path, severity = ?entry.severity, message = %entry.message, "diagnostic");
            }
        }
    }
}

/// Sink that retains the latest report per path. Used by tests and by host
/// integrations that poll rather than subscribe.
#[derive(Debug, Default)]
pub struct MemorySink {
    inner: Mutex<HashMap<CanonicalPath, FileReport>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latest report for a path, if any.
    pub fn latest(&self, path: &CanonicalPath) -> Option<FileReport> {
        self.inner.lock().unwrap().get(path).cloned()
    }

    /// Current error entries for a path. Empty when the last report cleared
    /// diagnostics or no report exists.
    pub fn errors_for(&self, path: &CanonicalPath) -> Vec<DiagnosticEntry> {
        self.inner
            .lock()
            .unwrap()
            .get(path)
            .map(|r| r.errors.clone())
            .unwrap_or_default()
    }

    pub fn report_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

impl DiagnosticsSink for MemorySink {
    fn report(&self, path: &CanonicalPath, report: FileReport) {
        self.inner.lock().unwrap().insert(path.clone(), report);
    }
}
