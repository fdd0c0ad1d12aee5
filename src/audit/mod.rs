//! Append-only audit trail.
//!
//! Every façade call, authorized or rejected, produces exactly one
//! [`AuditRecord`]. The record is durable before the caller sees the
//! operation's result; a crash between commit and audit append is the only
//! unaudited window.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::error::{Error, Result};

/// One audited operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub operation: String,
    pub session_id: Option<String>,
    pub success: bool,
    /// Whether credential scrubbing changed any persisted text
    pub scrubbed: bool,
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

impl AuditRecord {
    pub fn new(agent_id: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            agent_id: agent_id.into(),
            operation: operation.into(),
            session_id: None,
            success: true,
            scrubbed: false,
            error: None,
            warning: None,
        }
    }

    pub fn session(mut self, session_id: Option<impl ToString>) -> Self {
        self.session_id = session_id.map(|s| s.to_string());
        self
    }

    pub fn scrubbed(mut self, scrubbed: bool) -> Self {
        self.scrubbed = scrubbed;
        self
    }

    pub fn failed(mut self, error: &Error) -> Self {
        self.success = false;
        self.error = Some(format!("{}: {}", error.kind(), error));
        self
    }

    pub fn warning(mut self, warning: impl Into<String>) -> Self {
        self.warning = Some(warning.into());
        self
    }
}

enum Sink {
    File { path: PathBuf, file: File },
    Memory(Vec<AuditRecord>),
}

struct Inner {
    sink: Sink,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only audit logger.
pub struct AuditLogger {
    inner: Mutex<Inner>,
}

impl AuditLogger {
    /// Open (or create) an append-only audit file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self::with_sink(Sink::File { path, file }))
    }

    /// Keep records in memory (for testing).
    pub fn in_memory() -> Self {
        Self::with_sink(Sink::Memory(Vec::new()))
    }

    fn with_sink(sink: Sink) -> Self {
        Self {
            inner: Mutex::new(Inner {
                sink,
                last_timestamp: None,
            }),
        }
    }

    /// Append a record. Timestamps never go backwards within this process.
    pub fn log(&self, mut record: AuditRecord) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock audit log: {}", e)))?;

        if let Some(last) = inner.last_timestamp {
            if record.timestamp < last {
                record.timestamp = last;
            }
        }
        inner.last_timestamp = Some(record.timestamp);

        match &mut inner.sink {
            Sink::Memory(records) => records.push(record),
            Sink::File { path, file } => {
                let mut line = serde_json::to_string(&record)?;
                line.push('\n');
                append_line(file, line.as_bytes()).map_err(|e| {
                    error!(path = %path.display(), "audit append failed: {}", e);
                    e
                })?;
            }
        }
        Ok(())
    }

    /// Convenience wrapper around [`AuditLogger::log`].
    pub fn record(
        &self,
        agent_id: &str,
        operation: &str,
        session_id: Option<&str>,
        success: bool,
        scrubbed: bool,
        error: Option<&str>,
    ) -> Result<()> {
        let mut record = AuditRecord::new(agent_id, operation)
            .session(session_id)
            .scrubbed(scrubbed);
        record.success = success;
        record.error = error.map(str::to_string);
        self.log(record)
    }

    /// All records written so far.
    pub fn records(&self) -> Result<Vec<AuditRecord>> {
        let inner = self
            .inner
            .lock()
            .map_err(|e| Error::Internal(format!("Failed to lock audit log: {}", e)))?;
        match &inner.sink {
            Sink::Memory(records) => Ok(records.clone()),
            Sink::File { path, .. } => read_records(path),
        }
    }
}

fn append_line(file: &mut File, bytes: &[u8]) -> Result<()> {
    // Exclusive advisory lock so processes sharing the file never interleave
    file.lock_exclusive()?;
    let written = file.write_all(bytes).and_then(|_| file.sync_data());
    let unlocked = FileExt::unlock(file);
    written?;
    unlocked?;
    Ok(())
}

/// Parse an audit file written by [`AuditLogger`].
pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>> {
    let file = match File::open(path.as_ref()) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        records.push(serde_json::from_str(&line)?);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_in_memory_records() {
        let logger = AuditLogger::in_memory();
        logger
            .record("agent-1", "record_experience", Some("s1"), true, false, None)
            .unwrap();
        logger
            .log(AuditRecord::new("agent-1", "retrieve_knowledge").failed(&Error::timeout(5)))
            .unwrap();

        let records = logger.records().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].session_id.as_deref(), Some("s1"));
        assert!(!records[1].success);
        assert!(records[1].error.as_deref().unwrap().starts_with("timeout"));
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let logger = AuditLogger::in_memory();
        let mut late = AuditRecord::new("a", "op");
        late.timestamp = Utc::now() + Duration::hours(1);
        let mut early = AuditRecord::new("a", "op");
        early.timestamp = Utc::now() - Duration::hours(1);

        logger.log(late).unwrap();
        logger.log(early).unwrap();
        logger.log(AuditRecord::new("a", "op")).unwrap();

        let records = logger.records().unwrap();
        assert!(records.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("agent.audit.jsonl");

        {
            let logger = AuditLogger::open(&path).unwrap();
            logger
                .record("a", "start_session", Some("s1"), true, false, None)
                .unwrap();
        }
        let logger = AuditLogger::open(&path).unwrap();
        logger
            .log(AuditRecord::new("a", "extract_knowledge").warning("2 heads for concept 'x'"))
            .unwrap();

        let records = read_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].operation, "start_session");
        assert_eq!(records[1].warning.as_deref(), Some("2 heads for concept 'x'"));

        let raw = std::fs::read_to_string(&path).unwrap();
        let first: serde_json::Value = serde_json::from_str(raw.lines().next().unwrap()).unwrap();
        for field in ["timestamp", "agent_id", "operation", "session_id", "success", "scrubbed", "error"] {
            assert!(first.get(field).is_some(), "missing field {}", field);
        }
    }
}
