//! Append-only audit trail.
//!
//! Every history event and every retry queue mutation becomes one JSON line.
//! Lines are kept in memory and optionally appended to a file. With a file
//! sink the export reads the file, so records evicted from memory survive.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::error::{ReindexError, Result};
use crate::jobs::history::HistoryEvent;
use crate::jobs::retry_queue::QueueMutation;

/// One line of the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum AuditRecord {
    HistoryEvent(HistoryEvent),
    QueueMutation(QueueMutation),
}

impl AuditRecord {
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

struct FileSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl FileSink {
    fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| ReindexError::audit_write(path, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| ReindexError::audit_write(path, e))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
        })
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        self.writer
            .write_all(line.as_bytes())
            .and_then(|()| self.writer.write_all(b"\n"))
            .and_then(|()| self.writer.flush())
            .map_err(|e| ReindexError::audit_write(&self.path, e))
    }

    fn read_all(&mut self) -> Result<String> {
        self.writer
            .flush()
            .map_err(|e| ReindexError::audit_write(&self.path, e))?;
        std::fs::read_to_string(&self.path).map_err(|e| ReindexError::audit_read(&self.path, e))
    }
}

#[derive(Default)]
struct AuditState {
    records: VecDeque<AuditRecord>,
    sink: Option<FileSink>,
    dropped: u64,
    sink_failures: u64,
}

/// An NDJSON export of the audit trail.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditExport {
    pub body: String,
    /// Records known to be absent from `body`
    pub missing: u64,
}

impl AuditExport {
    pub fn is_complete(&self) -> bool {
        self.missing == 0
    }
}

/// In-memory audit buffer with an optional JSONL file sink.
pub struct AuditLog {
    state: Mutex<AuditState>,
    max_in_memory: usize,
}

impl std::fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("AuditLog")
            .field("records", &state.records.len())
            .field("file", &state.sink.as_ref().map(|s| s.path.clone()))
            .field("max_in_memory", &self.max_in_memory)
            .finish()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::in_memory(10_000)
    }
}

impl AuditLog {
    /// Memory-only audit log keeping at most `max_in_memory` records.
    pub fn in_memory(max_in_memory: usize) -> Self {
        Self {
            state: Mutex::new(AuditState::default()),
            max_in_memory: max_in_memory.max(1),
        }
    }

    /// Audit log that also appends every record to `path`.
    pub fn with_file(path: impl AsRef<Path>, max_in_memory: usize) -> Result<Self> {
        let log = Self::in_memory(max_in_memory);
        log.state.lock().sink = Some(FileSink::open(path.as_ref())?);
        tracing::info!(path = %path.as_ref().display(), "Audit file sink opened");
        Ok(log)
    }

    pub fn record_history(&self, event: &HistoryEvent) {
        self.append(AuditRecord::HistoryEvent(event.clone()));
    }

    pub fn record_queue(&self, mutation: &QueueMutation) {
        self.append(AuditRecord::QueueMutation(mutation.clone()));
    }

    fn append(&self, record: AuditRecord) {
        let mut state = self.state.lock();

        if let Some(sink) = state.sink.as_mut() {
            let written = record
                .to_line()
                .and_then(|line| sink.write_line(&line));
            if let Err(e) = written {
                e.log();
                state.sink_failures += 1;
            }
        }

        if state.records.len() >= self.max_in_memory {
            state.records.pop_front();
            state.dropped += 1;
        }
        state.records.push_back(record);
    }

    /// Records currently held in memory, oldest first.
    pub fn records(&self) -> Vec<AuditRecord> {
        self.state.lock().records.iter().cloned().collect()
    }

    /// Records evicted from memory because of the size cap.
    pub fn evicted(&self) -> u64 {
        self.state.lock().dropped
    }

    /// Line-delimited JSON of the whole trail.
    ///
    /// Reads the file sink when there is one. A memory-only log can only
    /// export what it still holds; evicted records are counted as missing.
    pub fn export_ndjson(&self) -> Result<AuditExport> {
        let mut state = self.state.lock();
        let sink_failures = state.sink_failures;

        if let Some(sink) = state.sink.as_mut() {
            let body = sink.read_all()?;
            return Ok(AuditExport {
                body,
                missing: sink_failures,
            });
        }

        let mut body = String::new();
        for record in &state.records {
            body.push_str(&record.to_line()?);
            body.push('\n');
        }
        if state.dropped > 0 {
            tracing::warn!(
                evicted = state.dropped,
                "Audit export is missing records evicted from memory; configure an audit file"
            );
        }
        Ok(AuditExport {
            body,
            missing: state.dropped,
        })
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
