//! Error types for announcerd
//!
//! # NIST 800-53 Rev 5 Control Mappings
//! - SI-11: Error Handling - Structured error types with contextual information
//! - AU-3: Content of Audit Records - Errors include sufficient detail for audit

use exabgp_api::ApiError;
use exabgp_types::ParseError;
use thiserror::Error;

/// Exit code for configuration faults (EX_UNAVAILABLE)
pub const EXIT_CONFIG: i32 = 69;

/// Exit code for fatal runtime faults
pub const EXIT_RUNTIME: i32 = 1;

/// Errors that can occur in announcerd
///
/// # NIST Controls
/// - SI-11(a): Generate error messages providing information necessary for corrective actions
#[derive(Debug, Error)]
pub enum AnnouncerError {
    /// Configuration file is unreadable or invalid
    /// NIST: CM-6 (Configuration Settings) - Configuration validation
    #[error("Configuration error: {0}")]
    Config(String),

    /// Control channel failure
    /// NIST: SC-8 (Transmission Integrity) - Daemon communication errors
    #[error("Control channel error: {0}")]
    Api(#[from] ApiError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Subprocess could not be spawned or timed out
    #[error("Command {command:?} failed: {reason}")]
    Shell { command: String, reason: String },

    /// FIB handler rejected or failed to program a route
    /// NIST: SC-7 (Boundary Protection) - Route programming errors
    #[error("FIB {fib} error: {reason}")]
    Fib { fib: String, reason: String },

    /// Metrics registry failure
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// Shutdown did not complete cleanly
    #[error("Shutdown error: {0}")]
    Shutdown(String),
}

impl AnnouncerError {
    pub fn fib(fib: impl Into<String>, reason: impl Into<String>) -> Self {
        AnnouncerError::Fib {
            fib: fib.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this error when it terminates the daemon.
    pub fn exit_code(&self) -> i32 {
        match self {
            AnnouncerError::Config(_) => EXIT_CONFIG,
            _ => EXIT_RUNTIME,
        }
    }
}

impl From<ParseError> for AnnouncerError {
    fn from(e: ParseError) -> Self {
        AnnouncerError::Config(e.to_string())
    }
}

/// Result type alias for announcerd operations
pub type Result<T> = std::result::Result<T, AnnouncerError>;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_exit_codes() {
        assert_eq!(AnnouncerError::Config("bad".into()).exit_code(), 69);
        assert_eq!(AnnouncerError::Api(ApiError::ChannelClosed).exit_code(), 1);
        assert_eq!(AnnouncerError::Shutdown("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_parse_error_is_config() {
        let err: AnnouncerError = "cooper/69".parse::<exabgp_types::IpPrefix>().unwrap_err().into();
        assert!(matches!(err, AnnouncerError::Config(_)));
    }

    #[test]
    fn test_display() {
        let err = AnnouncerError::fib("linux", "link-local next hop");
        assert_eq!(err.to_string(), "FIB linux error: link-local next hop");
    }
}
