//! Error types for the ExaBGP control channel
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-10: Information Input Validation - Decode faults carry the offending input
//! - SI-11: Error Handling - Local faults are distinguishable from fatal transport faults

use thiserror::Error;

/// Errors raised by the codec and transport
#[derive(Debug, Error)]
pub enum ApiError {
    /// IO error on the underlying channel
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Inbound line is not valid JSON
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Daemon speaks an API version this codec was not written against
    #[error("Unsupported ExaBGP API version: {0}")]
    UnsupportedVersion(String),

    /// JSON is well-formed but does not match the expected message shape
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Inbound line is not valid UTF-8
    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    /// Inbound line exceeded the framing limit and was discarded
    #[error("Line exceeded {0} bytes and was discarded")]
    LineTooLong(usize),

    /// Outbound command would break line framing
    #[error("Command contains a line break: {0:?}")]
    EmbeddedNewline(String),

    /// Channel reached end-of-stream or was closed locally
    #[error("Control channel closed")]
    ChannelClosed,

    /// Outbound write did not complete in time; the channel is closed afterwards
    #[error("Write timed out after {0} ms")]
    WriteTimeout(u64),

    /// Pipe path is missing or is not a FIFO
    #[error("Invalid pipe {path}: {reason}")]
    InvalidPipe { path: String, reason: String },
}

impl ApiError {
    /// Returns true for faults that only affect a single inbound line.
    ///
    /// The decode loop drops the line and keeps reading on these.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            ApiError::Json(_)
                | ApiError::UnsupportedVersion(_)
                | ApiError::Malformed(_)
                | ApiError::InvalidUtf8
                | ApiError::LineTooLong(_)
        )
    }
}

/// Result type alias for control channel operations
pub type Result<T> = std::result::Result<T, ApiError>;
