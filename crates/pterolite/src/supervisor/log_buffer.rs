//! Bounded per-process log storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Maximum number of entries retained per process.
pub const MAX_ENTRIES: usize = 1000;

/// Channel a log entry was observed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogChannel {
    Stdout,
    Stderr,
    System,
    Error,
}

/// One captured line of process output or supervisor bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub channel: LogChannel,
    pub text: String,
}

/// Bounded FIFO of log entries for one process.
///
/// Once the cap is reached the oldest entries are evicted first; the
/// newest entry is always kept.
#[derive(Debug, Default)]
pub struct LogBuffer {
    entries: VecDeque<LogEntry>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry, evicting from the front when over the cap.
    pub fn push(&mut self, channel: LogChannel, text: impl Into<String>) {
        self.entries.push_back(LogEntry {
            timestamp: Utc::now(),
            channel,
            text: text.into().trim().to_string(),
        });
        while self.entries.len() > MAX_ENTRIES {
            self.entries.pop_front();
        }
    }

    /// Snapshot of the most recent `limit` entries, oldest first.
    pub fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let skip = self.entries.len().saturating_sub(limit);
        self.entries.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
