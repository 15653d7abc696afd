//! Audit records for flagged hits.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{error, warn};

use crate::error::Result;

/// Why a hit was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlagReason {
    RateExceeded,
    CapacityExhausted,
}

/// One flagged hit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub time: DateTime<Utc>,
    pub direction: String,
    pub value: String,
    pub reason: FlagReason,
}

impl AuditEntry {
    pub fn new(direction: &str, value: String, reason: FlagReason) -> Self {
        Self {
            time: Utc::now(),
            direction: direction.to_string(),
            value,
            reason,
        }
    }
}

/// Sink receiving one record per flagged hit.
pub trait AuditLog: Send + Sync {
    fn record(&self, entry: &AuditEntry);
}

/// Emits audit records as `tracing` events under the `fencer::audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditLog;

impl AuditLog for TracingAuditLog {
    fn record(&self, entry: &AuditEntry) {
        warn!(
            target: "fencer::audit",
            direction = %entry.direction,
            value = %entry.value,
            reason = ?entry.reason,
            "Attack detected"
        );
    }
}

/// Appends audit records to a file, one JSON object per line.
#[derive(Debug)]
pub struct FileAuditLog {
    writer: Mutex<BufWriter<File>>,
}

impl FileAuditLog {
    /// Open `path` for appending, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

impl AuditLog for FileAuditLog {
    fn record(&self, entry: &AuditEntry) {
        let mut writer = self.writer.lock();
        let written = serde_json::to_writer(&mut *writer, entry)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"))
            .and_then(|_| writer.flush());

        if let Err(e) = written {
            error!(
                error = %e,
                direction = %entry.direction,
                value = %entry.value,
                "Failed to write audit record"
            );
        }
    }
}

/// Keeps audit records in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditLog {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// All records so far, oldest first.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditLog for MemoryAuditLog {
    fn record(&self, entry: &AuditEntry) {
        self.entries.lock().push(entry.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_audit_log_appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.log");

        let log = FileAuditLog::open(&path).unwrap();
        log.record(&AuditEntry::new("login", "10.0.0.1".into(), FlagReason::RateExceeded));
        log.record(&AuditEntry::new("login", "10.0.0.2".into(), FlagReason::CapacityExhausted));
        drop(log);

        // Reopening appends rather than truncating
        let log = FileAuditLog::open(&path).unwrap();
        log.record(&AuditEntry::new("user", "42".into(), FlagReason::RateExceeded));

        let contents = std::fs::read_to_string(&path).unwrap();
        let entries: Vec<AuditEntry> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].value, "10.0.0.1");
        assert_eq!(entries[1].reason, FlagReason::CapacityExhausted);
        assert_eq!(entries[2].direction, "user");
    }

    #[test]
    fn test_reason_serialization() {
        let json = serde_json::to_string(&FlagReason::CapacityExhausted).unwrap();
        assert_eq!(json, "\"capacity_exhausted\"");
    }

    #[test]
    fn test_memory_audit_log() {
        let log = MemoryAuditLog::new();
        assert!(log.is_empty());
        log.record(&AuditEntry::new("login", "a".into(), FlagReason::RateExceeded));
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].direction, "login");
    }
}
