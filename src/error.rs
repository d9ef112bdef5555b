use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    #[error("Invalid search term: {0}")]
    InvalidInput(String),

    #[error("Browser launch failed: {0}")]
    LaunchFailure(String),

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Screenshot capture failed: {0}")]
    CaptureFailure(String),

    #[error("Text recognition failed: {0}")]
    RecognitionFailure(String),

    #[error("Search did not finish within {0:?}")]
    Timeout(Duration),

    #[error("Search capacity unavailable")]
    Overloaded,

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

/// Stable, machine-readable error code reported alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidInput,
    LaunchFailure,
    NavigationTimeout,
    Navigation,
    CaptureFailure,
    RecognitionFailure,
    Timeout,
    Overloaded,
    Configuration,
    Io,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidInput => "invalid_input",
            ErrorKind::LaunchFailure => "launch_failure",
            ErrorKind::NavigationTimeout => "navigation_timeout",
            ErrorKind::Navigation => "navigation_failure",
            ErrorKind::CaptureFailure => "capture_failure",
            ErrorKind::RecognitionFailure => "recognition_failure",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Configuration => "configuration_error",
            ErrorKind::Io => "io_error",
            ErrorKind::Serialization => "serialization_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InvalidInput(_) => ErrorKind::InvalidInput,
            PipelineError::LaunchFailure(_) => ErrorKind::LaunchFailure,
            PipelineError::NavigationTimeout(_) => ErrorKind::NavigationTimeout,
            PipelineError::Navigation(_) => ErrorKind::Navigation,
            PipelineError::CaptureFailure(_) => ErrorKind::CaptureFailure,
            PipelineError::RecognitionFailure(_) => ErrorKind::RecognitionFailure,
            PipelineError::Timeout(_) => ErrorKind::Timeout,
            PipelineError::Overloaded => ErrorKind::Overloaded,
            PipelineError::ConfigurationError(_) => ErrorKind::Configuration,
            PipelineError::IoError(_) => ErrorKind::Io,
            PipelineError::SerializationError(_) => ErrorKind::Serialization,
        }
    }

    /// Whether a caller may reasonably repeat the same search.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::LaunchFailure(_)
                | PipelineError::NavigationTimeout(_)
                | PipelineError::Navigation(_)
                | PipelineError::Timeout(_)
                | PipelineError::Overloaded
        )
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PipelineError::InvalidInput(_) => ErrorSeverity::Low,
            PipelineError::RecognitionFailure(_) => ErrorSeverity::Low,
            PipelineError::ConfigurationError(_) => ErrorSeverity::High,
            PipelineError::LaunchFailure(_) => ErrorSeverity::High,
            PipelineError::IoError(_) => ErrorSeverity::High,
            _ => ErrorSeverity::Medium,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
}

impl From<AcquireError> for PipelineError {
    fn from(_: AcquireError) -> Self {
        PipelineError::Overloaded
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::SerializationError(err.to_string())
    }
}
