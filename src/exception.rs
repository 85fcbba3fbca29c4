//! Failure classification and the deduplicated exception record.

use crate::error::{LinkError, Result};
use crate::packet::now_nsec;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Refused/reset/timeout and friends; logged quietly, never recorded.
    Transient,
    /// Shutdown in progress; stop retrying.
    Cancelled,
    /// Anything else; logged loudly and recorded once per message.
    Novel,
}

pub fn classify(err: &LinkError) -> FailureClass {
    match err {
        LinkError::Cancelled => FailureClass::Cancelled,
        LinkError::Io(io) => match io.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::TimedOut
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
            | ErrorKind::AddrNotAvailable => FailureClass::Transient,
            _ => classify_message(&io.to_string()),
        },
        other => classify_message(&other.to_string()),
    }
}

fn classify_message(message: &str) -> FailureClass {
    let lower = message.to_lowercase();
    if lower.contains("canceled") || lower.contains("cancelled") || lower.contains("timeout") {
        FailureClass::Transient
    } else {
        FailureClass::Novel
    }
}

/// Which failure path produced an error; each has its own dedup set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ConnectFailed,
    ConnectionLost,
}

/// Most recent connect/read error plus the messages already recorded.
#[derive(Debug, Default)]
pub struct FailureTracker {
    pub last_error: Option<String>,
    failed_messages: HashSet<String>,
    lost_messages: HashSet<String>,
}

impl FailureTracker {
    /// Stores `message` as the last error and returns `true` the first time
    /// it is seen for `kind`.
    pub fn note(&mut self, kind: FailureKind, message: &str) -> bool {
        self.last_error = Some(message.to_string());
        let seen = match kind {
            FailureKind::ConnectFailed => &mut self.failed_messages,
            FailureKind::ConnectionLost => &mut self.lost_messages,
        };
        seen.insert(message.to_string())
    }
}

/// Durable record of novel failures. Without a directory entries are only
/// kept in memory.
#[derive(Debug, Default)]
pub struct ExceptionLog {
    dir: Option<PathBuf>,
    records: Mutex<Vec<String>>,
}

impl ExceptionLog {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn write(&self, source: &str, err: &LinkError) -> Result<Option<PathBuf>> {
        let text = format!("{source}: {err}\n{err:?}\n");
        self.records.lock().push(text.clone());
        let Some(dir) = &self.dir else {
            return Ok(None);
        };
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_exception_{}.txt", source.to_lowercase(), now_nsec()));
        std::fs::write(&path, text)?;
        Ok(Some(path))
    }

    pub fn records(&self) -> Vec<String> {
        self.records.lock().clone()
    }
}
