//! Append-only operator files: the JSON-lines audit log and the plain-text
//! list of unregistered card UIDs. Neither is ever truncated.

use crate::types::{AccessAction, CardScan};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

const AUDIT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Error, Debug)]
pub enum JournalError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialize: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One audit log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditRecord {
    pub timestamp: String,
    pub uid: String,
    pub is_recognized: bool,
    pub raw_data: String,
    #[serde(rename = "type")]
    pub kind: String,
}

impl AuditRecord {
    /// Build a record for a scan and its outcome, stamped with local time.
    pub fn for_outcome(scan: &CardScan, action: AccessAction) -> Self {
        Self {
            timestamp: chrono::Local::now().format(AUDIT_TIMESTAMP_FORMAT).to_string(),
            uid: scan.uid.clone(),
            is_recognized: scan.is_recognized,
            raw_data: scan.raw_line.clone(),
            kind: action.to_string(),
        }
    }
}

/// JSON-lines audit log.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, record: &AuditRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        append_line(&self.path, &line)
    }
}

/// Plain-text list of card UIDs that were presented but are not enrolled.
#[derive(Debug, Clone)]
pub struct UnregisteredCards {
    path: PathBuf,
}

impl UnregisteredCards {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self, uid: &str) -> Result<(), JournalError> {
        append_line(&self.path, &format!("{uid}\n"))
    }
}

fn append_line(path: &Path, line: &str) -> Result<(), JournalError> {
    let io_err = |source| JournalError::Io {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io_err)?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(io_err)?;
    file.write_all(line.as_bytes()).map_err(io_err)
}
