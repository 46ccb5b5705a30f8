//! Error types for the shaper.

use thiserror::Error;

/// Main error type for shaper operations.
#[derive(Error, Debug)]
pub enum ShaperError {
    /// A limiter entry failed validation and was skipped
    #[error("invalid limiter config: id={index}, {reason}")]
    InvalidConfig { index: usize, reason: String },

    /// Configuration file errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pacing wait was aborted by the connection context
    #[error("operation cancelled")]
    Cancelled,

    /// The transport deadline elapsed
    #[error("i/o timeout")]
    Timeout,

    /// A chunked write failed after part of the buffer was delivered
    #[error("partial write of {written} bytes: {source}")]
    PartialWrite {
        written: usize,
        #[source]
        source: Box<ShaperError>,
    },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ShaperError {
    /// Whether this failure came from a transport deadline.
    pub fn is_timeout(&self) -> bool {
        match self {
            ShaperError::Timeout => true,
            ShaperError::PartialWrite { source, .. } => source.is_timeout(),
            ShaperError::Io(e) => e.kind() == std::io::ErrorKind::TimedOut,
            _ => false,
        }
    }

    /// Whether this failure came from the connection context ending.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ShaperError::Cancelled => true,
            ShaperError::PartialWrite { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Bytes delivered before the failure, if any.
    pub fn written(&self) -> usize {
        match self {
            ShaperError::PartialWrite { written, .. } => *written,
            _ => 0,
        }
    }
}

impl From<ShaperError> for std::io::Error {
    fn from(err: ShaperError) -> Self {
        use std::io::ErrorKind;

        match err {
            ShaperError::Io(e) => e,
            ShaperError::Cancelled => std::io::Error::new(ErrorKind::Interrupted, err),
            ShaperError::Timeout => std::io::Error::new(ErrorKind::TimedOut, err),
            ShaperError::PartialWrite { .. } if err.is_timeout() => {
                std::io::Error::new(ErrorKind::TimedOut, err)
            }
            other => std::io::Error::new(ErrorKind::Other, other),
        }
    }
}

/// Result type alias for shaper operations.
pub type Result<T> = std::result::Result<T, ShaperError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_write_reports_inner_kind() {
        let err = ShaperError::PartialWrite {
            written: 10,
            source: Box::new(ShaperError::Cancelled),
        };
        assert!(err.is_cancelled());
        assert!(!err.is_timeout());
        assert_eq!(err.written(), 10);
    }

    #[test]
    fn test_into_io_error_kinds() {
        let io: std::io::Error = ShaperError::Timeout.into();
        assert_eq!(io.kind(), std::io::ErrorKind::TimedOut);

        let io: std::io::Error = ShaperError::Cancelled.into();
        assert_eq!(io.kind(), std::io::ErrorKind::Interrupted);

        let original = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let io: std::io::Error = ShaperError::Io(original).into();
        assert_eq!(io.kind(), std::io::ErrorKind::ConnectionReset);
    }

    #[test]
    fn test_invalid_config_message_carries_index() {
        let err = ShaperError::InvalidConfig {
            index: 3,
            reason: "tag/user/inbound, at least one must be set".to_string(),
        };
        assert!(err.to_string().contains("id=3"));
    }
}
