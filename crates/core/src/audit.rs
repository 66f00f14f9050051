//! Append-only CSV audit trail.
//!
//! Every externally observable decision of a run (a mutation attempted, simulated or skipped)
//! becomes exactly one row. Rows are flushed as they are written so that a crash never loses
//! a decision that was already acted on.

use crate::{SyncError, SyncResult};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

pub const AUDIT_COLUMNS: [&str; 7] = [
    "timestamp",
    "subject",
    "target",
    "step",
    "http_code",
    "result",
    "info",
];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuditResult {
    Success,
    Partial,
    Skipped,
    Simulated,
    Failed,
    Warning,
}

impl AuditResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Skipped => "SKIPPED",
            Self::Simulated => "SIMULATED",
            Self::Failed => "FAILED",
            Self::Warning => "WARNING",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub subject: String,
    pub target: String,
    pub step: String,
    pub http_code: String,
    pub result: AuditResult,
    pub info: String,
}

impl AuditEntry {
    pub fn new(
        subject: impl Into<String>,
        target: impl Into<String>,
        step: impl Into<String>,
        result: AuditResult,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            subject: subject.into(),
            target: target.into(),
            step: step.into(),
            http_code: String::new(),
            result,
            info: String::new(),
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.http_code = code.into();
        self
    }

    pub fn with_info(mut self, info: impl Into<String>) -> Self {
        self.info = info.into();
        self
    }

    fn record(&self) -> [String; 7] {
        [
            self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
            self.subject.clone(),
            self.target.clone(),
            self.step.clone(),
            self.http_code.clone(),
            self.result.as_str().to_string(),
            self.info.clone(),
        ]
    }
}

/// The audit file of one run. Shared between components behind an `Arc`.
pub struct AuditLog {
    path: PathBuf,
    writer: Mutex<csv::Writer<File>>,
    rows: AtomicUsize,
}

impl AuditLog {
    /// Create the file and write the header.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Io`] if the file cannot be created and [`SyncError::Audit`] if the
    /// header cannot be written.
    pub fn create(path: impl Into<PathBuf>) -> SyncResult<Self> {
        let path = path.into();
        let file = File::create(&path).map_err(|e| SyncError::io(&path, e))?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(AUDIT_COLUMNS)?;
        writer.flush().map_err(csv::Error::from)?;

        Ok(Self {
            path,
            writer: Mutex::new(writer),
            rows: AtomicUsize::new(0),
        })
    }

    pub fn record(&self, entry: &AuditEntry) -> SyncResult<()> {
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        writer.write_record(entry.record())?;
        writer.flush().map_err(csv::Error::from)?;
        self.rows.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Rows written so far, header excluded.
    pub fn rows(&self) -> usize {
        self.rows.load(Ordering::Relaxed)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLog")
            .field("path", &self.path)
            .field("rows", &self.rows())
            .finish()
    }
}
