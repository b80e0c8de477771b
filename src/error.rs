use std::time::Duration;
use thiserror::Error;

/// Substrings that mark a failure as resource-specific and worth one retry
/// on a fresh tab. Matched case-sensitively, except "timeout".
const TRANSIENT_MARKERS: &[&str] = &["Target closed", "Protocol error"];

/// A failure of a single capture task, or of the tab it ran on.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Navigation timeout after {0:?}")]
    Timeout(Duration),

    #[error("Target closed")]
    TargetClosed,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Pre-capture hook failed: {0}")]
    Hook(String),

    #[error("Element not found: {0}")]
    ElementNotFound(String),

    #[error("Screenshot capture failed: {0}")]
    Capture(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("pool drained")]
    PoolDrained,

    #[error("Task panicked: {0}")]
    Panicked(String),

    #[error("{0}")]
    Other(String),
}

impl CaptureError {
    /// Wraps a driver message that carries no type information.
    pub fn message(msg: impl Into<String>) -> Self {
        CaptureError::Other(msg.into())
    }

    /// Whether a fresh tab is likely to succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        match self {
            CaptureError::PoolDrained | CaptureError::Panicked(_) => false,
            other => is_transient_message(&other.to_string()),
        }
    }
}

/// Classifies a raw failure message: timeouts, closed targets and
/// protocol-level errors are transient, everything else is not.
pub fn is_transient_message(message: &str) -> bool {
    message.to_lowercase().contains("timeout")
        || TRANSIENT_MARKERS.iter().any(|marker| message.contains(marker))
}

impl From<std::io::Error> for CaptureError {
    fn from(err: std::io::Error) -> Self {
        CaptureError::Io(err.to_string())
    }
}

impl From<image::ImageError> for CaptureError {
    fn from(err: image::ImageError) -> Self {
        CaptureError::Capture(err.to_string())
    }
}

impl From<chromiumoxide::error::CdpError> for CaptureError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        match err {
            chromiumoxide::error::CdpError::Timeout => CaptureError::Protocol("request timeout".to_string()),
            other => CaptureError::message(other.to_string()),
        }
    }
}

/// Errors that stop a whole run rather than a single task.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Concurrency limit must be at least 1, got {0}")]
    InvalidConcurrency(usize),

    #[error("Browser launch failed: {0}")]
    BrowserLaunch(String),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
