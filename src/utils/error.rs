use thiserror::Error;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    /// Malformed hex, text or regex pattern in a feature or replace rule
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    /// Rule definition violates an invariant (e.g. `applyTo=count` without a count)
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// Delete/enable on an unknown rule id
    #[error("Rule not found: {0}")]
    RuleNotFound(String),

    /// Detail/edit on an unknown packet id
    #[error("Packet not found: {0}")]
    PacketNotFound(u64),

    /// No working capture collaborator is configured
    #[error("Capture unavailable: {0}")]
    CaptureUnavailable(String),

    /// Capture lifecycle misuse (double start, stop while idle, ...)
    #[error("Capture error: {0}")]
    CaptureError(String),

    /// Error from export operations
    #[error("Export error: {0}")]
    ExportError(String),

    /// Error from I/O operations
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Error from JSON serialization/deserialization
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type for application
pub type AppResult<T> = Result<T, AppError>;
