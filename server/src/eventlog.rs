/// Activity log backing the GUI log panel.
///
/// A bounded ring of timestamped lines: task lifecycle transitions, engine
/// results, rule refreshes. The panel polls it read-only; old lines fall off
/// the back once the cap is reached.
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Lines kept before the oldest ones are dropped.
const MAX_LOG_LINES: usize = 400;

/// One log panel line.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Thread-safe bounded activity log.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Mutex<VecDeque<LogEntry>>>,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_LOG_LINES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Append a line, dropping the oldest when full.
    pub async fn push(&self, message: impl Into<String>) {
        let mut lines = self.inner.lock().await;
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogEntry {
            at: Utc::now(),
            message: message.into(),
        });
    }

    /// The most recent `limit` lines, oldest first.
    pub async fn tail(&self, limit: usize) -> Vec<LogEntry> {
        let lines = self.inner.lock().await;
        let skip = lines.len().saturating_sub(limit);
        lines.iter().skip(skip).cloned().collect()
    }

    /// Every retained line, oldest first.
    pub async fn all(&self) -> Vec<LogEntry> {
        self.inner.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}
