/// Unified error types for the you-get-web system.
use thiserror::Error;

/// Top-level error type for the you-get-web system.
#[derive(Debug, Error)]
pub enum WebGuiError {
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Errors raised while driving the external you-get process.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("you-get executable not found: {0}")]
    NotFound(String),

    #[error("Failed to spawn you-get: {0}")]
    SpawnFailed(String),

    #[error("you-get exited with code {code}: {detail}")]
    Exited { code: i32, detail: String },

    #[error("you-get was killed before finishing")]
    Killed,

    #[error("Probe returned invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Probe timed out after {0}s")]
    ProbeTimeout(u64),

    #[error("No media info in probe output")]
    EmptyProbe,
}

impl EngineError {
    /// Whether a failed run should count against the retry budget and be
    /// requeued rather than dropped outright.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            EngineError::Exited { .. } | EngineError::SpawnFailed(_) | EngineError::ProbeTimeout(_)
        )
    }
}

/// Result type alias for you-get-web operations.
pub type WebGuiResult<T> = Result<T, WebGuiError>;
