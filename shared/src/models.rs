/// Database models shared across the you-get-web crates.
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Download task status.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Running,
    Done,
    Error,
    Stopped,
}

impl TaskStatus {
    /// Parse the database/API representation back into the enum.
    pub fn parse(s: &str) -> Option<TaskStatus> {
        match s {
            "queued" => Some(TaskStatus::Queued),
            "running" => Some(TaskStatus::Running),
            "done" => Some(TaskStatus::Done),
            "error" => Some(TaskStatus::Error),
            "stopped" => Some(TaskStatus::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Queued => write!(f, "queued"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Done => write!(f, "done"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Stopped => write!(f, "stopped"),
        }
    }
}

/// Options a task was submitted with. Persisted as JSON in the `options`
/// column so the row survives restarts with its full submission intact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskOptions {
    /// Destination directory; the server default applies when absent.
    #[serde(default)]
    pub output_dir: Option<String>,
    /// Download every entry of a playlist URL instead of the single item.
    #[serde(default)]
    pub playlist: bool,
    /// Specific stream/format id reported by the media-info probe.
    #[serde(default)]
    pub stream_id: Option<String>,
    /// HTTP proxy used only for site metadata extraction.
    #[serde(default)]
    pub extractor_proxy: Option<String>,
    /// Merge multi-part downloads into one file when the engine supports it.
    #[serde(default = "default_merge")]
    pub merge: bool,
}

fn default_merge() -> bool {
    true
}

impl Default for TaskOptions {
    fn default() -> Self {
        TaskOptions {
            output_dir: None,
            playlist: false,
            stream_id: None,
            extractor_proxy: None,
            merge: true,
        }
    }
}

/// Download task record.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskRecord {
    pub id: i64,
    pub origin: String,
    pub options: String,
    pub priority: i64,
    pub title: Option<String>,
    pub filepath: Option<String>,
    pub status: String,
    pub failures: i64,
    pub total_size: i64,
    pub received: i64,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl TaskRecord {
    /// Decode the persisted options JSON, falling back to defaults when the
    /// column holds something unreadable.
    pub fn parsed_options(&self) -> TaskOptions {
        serde_json::from_str(&self.options).unwrap_or_default()
    }

    /// Completion percentage, capped at 100.
    pub fn percent_done(&self) -> u8 {
        percent_done(self.received, self.total_size)
    }
}

/// One available stream/format reported by the media-info probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamInfo {
    pub id: String,
    #[serde(default)]
    pub container: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
    #[serde(default)]
    pub size: Option<i64>,
}

/// Result of probing a URL with the engine before queueing it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaInfo {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub site: Option<String>,
    #[serde(default)]
    pub streams: Vec<StreamInfo>,
}

/// Completion percentage from byte counters, capped at 100.
pub fn percent_done(received: i64, total_size: i64) -> u8 {
    if total_size <= 0 {
        return 0;
    }
    let pct = received.saturating_mul(100) / total_size;
    pct.clamp(0, 100) as u8
}

/// Render a byte count the way the GUI columns expect, e.g. "3.5M".
/// Units step at 1000, matching what the engine itself prints.
pub fn human_size(bytes: i64) -> String {
    const KUNIT: f64 = 1000.0;
    // anything that would round up to 1000.0 rolls into the next unit
    const UNIT_STEP: f64 = 999.95;
    let mut num = bytes.max(0) as f64;
    let mut unit = "T";
    for candidate in ["", "K", "M", "G"] {
        if num < UNIT_STEP {
            unit = candidate;
            break;
        }
        num /= KUNIT;
    }
    format!("{:.1}{}", num, unit)
}

/// Render a bytes/second rate for the speed column, e.g. "1.2M/s".
pub fn human_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", human_size(bytes_per_sec.max(0.0) as i64))
}
