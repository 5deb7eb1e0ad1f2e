//! Error types for the instrumentation middleware

use thiserror::Error;

/// Result type alias for instrumentation operations
pub type Result<T> = std::result::Result<T, InstrumentError>;

/// Error types that can occur while intercepting and rewriting responses
#[derive(Error, Debug, Clone)]
pub enum InstrumentError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Instrumentation failed for {path}: {message}")]
    TransformError { path: String, message: String },

    #[error("Instrumentation prefix unavailable: {0}")]
    PrefixError(String),

    #[error("Response already finalized")]
    ResponseFinalized,

    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),
}

impl From<std::io::Error> for InstrumentError {
    fn from(err: std::io::Error) -> Self {
        InstrumentError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for InstrumentError {
    fn from(err: serde_json::Error) -> Self {
        InstrumentError::ParseError(err.to_string())
    }
}

impl InstrumentError {
    /// Create a TransformError for the given request path
    pub fn transform(path: impl Into<String>, message: impl Into<String>) -> Self {
        InstrumentError::TransformError {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Whether the external collaborator failed
    ///
    /// These failures abort the response: the middleware never falls back to
    /// shipping the untransformed body.
    pub fn is_transform_failure(&self) -> bool {
        matches!(
            self,
            InstrumentError::TransformError { .. } | InstrumentError::PrefixError(_)
        )
    }

    /// Convert error to HTTP status code
    ///
    /// - Collaborator could not be reached: 502 Bad Gateway
    /// - Everything else, including transform failures: 500
    pub fn to_http_status(&self) -> u16 {
        match self {
            InstrumentError::IoError(_) => 502,

            InstrumentError::TransformError { .. } => 500,
            InstrumentError::PrefixError(_) => 500,
            InstrumentError::ConfigError(_) => 500,
            InstrumentError::ParseError(_) => 500,
            InstrumentError::ResponseFinalized => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_failures_are_flagged() {
        assert!(InstrumentError::transform("/app.js", "boom").is_transform_failure());
        assert!(InstrumentError::PrefixError("exit 1".to_string()).is_transform_failure());
        assert!(!InstrumentError::ResponseFinalized.is_transform_failure());
        assert!(!InstrumentError::ConfigError("bad".to_string()).is_transform_failure());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(InstrumentError::transform("/", "x").to_http_status(), 500);
        assert_eq!(InstrumentError::PrefixError("exit 1".to_string()).to_http_status(), 500);
        assert_eq!(InstrumentError::IoError("broken pipe".to_string()).to_http_status(), 502);
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: InstrumentError = io.into();
        assert!(matches!(err, InstrumentError::IoError(ref msg) if msg.contains("pipe closed")));
    }

    #[test]
    fn test_display_includes_path() {
        let err = InstrumentError::transform("/index.html", "syntax error");
        assert_eq!(
            err.to_string(),
            "Instrumentation failed for /index.html: syntax error"
        );
    }
}
