use thiserror::Error;

pub type Result<T> = std::result::Result<T, CaptureError>;

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Python not installed or not found in PATH")]
    PythonNotFound,

    #[error("Plotting library is not available")]
    CapabilityUnavailable,

    #[error("Failed to apply style '{style}': {message}")]
    Style { style: String, message: String },

    #[error("Failed to render figure: {0}")]
    Render(String),

    #[error("Failed to release figure: {0}")]
    Release(String),

    #[error("Invalid data URI: {0}")]
    InvalidDataUri(String),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Syntax error in Python code: {0}")]
    SyntaxError(String),

    #[error("Runtime error during execution: {0}")]
    RuntimeError(String),

    #[error("Execution timeout exceeded")]
    Timeout,

    #[error("Memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("Import not allowed: {0}")]
    ImportNotAllowed(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Process exited with code {0}")]
    ProcessExitCode(i32),
}

/// Who is at fault for a failed execution, as reported back to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// The user's code raised, failed to parse, or hit a resource limit
    User,
    /// The interpreter or its packages could not be set up
    Internal,
}

impl CaptureError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            CaptureError::SyntaxError(_)
            | CaptureError::RuntimeError(_)
            | CaptureError::Timeout
            | CaptureError::MemoryLimitExceeded
            | CaptureError::ImportNotAllowed(_)
            | CaptureError::ProcessExitCode(_) => ErrorCategory::User,
            _ => ErrorCategory::Internal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_errors_are_categorised() {
        assert_eq!(
            CaptureError::RuntimeError("ZeroDivisionError".into()).category(),
            ErrorCategory::User
        );
        assert_eq!(CaptureError::Timeout.category(), ErrorCategory::User);
        assert_eq!(
            CaptureError::PythonNotFound.category(),
            ErrorCategory::Internal
        );
    }

    #[test]
    fn test_category_serializes_lowercase() {
        let json = serde_json::to_string(&ErrorCategory::Internal).unwrap();
        assert_eq!(json, "\"internal\"");
    }
}
