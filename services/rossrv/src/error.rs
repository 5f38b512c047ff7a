//! Error handling for the RouterOS control-channel service
//!
//! This module provides error type definitions and conversions for the
//! service. The variant set mirrors the failure taxonomy of the command
//! pipeline: connection, authentication, protocol, admission, and queueing
//! failures each get their own variant so retry classification stays exact.

use errors::{ErrorCategory, RouterError, RouterErrorTrait};
use thiserror::Error;

/// RouterOS control-channel service error type
#[derive(Error, Debug, Clone)]
pub enum RosSrvError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Connection establishment and socket errors (refused/reset/closed)
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Connection lost while commands were outstanding
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Login handshake failures (missing challenge, rejected credentials)
    #[error("Authentication error: {0}")]
    AuthenticationError(String),

    /// Device-reported `!trap` replies, carrying the device's message
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// Per-command or handshake timeout
    #[error("Timeout error: {0}")]
    TimeoutError(String),

    /// No pool slot became available within the acquire deadline
    #[error("Acquire timeout: {0}")]
    AcquireTimeout(String),

    /// Device circuit breaker is open; failed fast without I/O
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Queue admission rejected (lane capacity reached)
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Submission rejected by the deduplication window
    #[error("Duplicate command: {0}")]
    DuplicateCommand(String),

    /// No device can take the work right now (all filtered or saturated)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Invalid parameters or malformed command strings
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Everything else (task join failures, closed channels)
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Result type alias for the service
pub type Result<T> = std::result::Result<T, RosSrvError>;

impl RosSrvError {
    pub fn config(msg: impl Into<String>) -> Self {
        RosSrvError::ConfigError(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        RosSrvError::ConnectionError(msg.into())
    }

    pub fn connection_lost(msg: impl Into<String>) -> Self {
        RosSrvError::ConnectionLost(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        RosSrvError::AuthenticationError(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        RosSrvError::ProtocolError(msg.into())
    }

    pub fn timeout(msg: impl Into<String>) -> Self {
        RosSrvError::TimeoutError(msg.into())
    }

    pub fn resource_exhausted(msg: impl Into<String>) -> Self {
        RosSrvError::ResourceExhausted(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        RosSrvError::ValidationError(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RosSrvError::InternalError(msg.into())
    }

    /// Whether a failed attempt with this error should be retried.
    ///
    /// Connection-class and timeout errors are transient. A `!trap` reply is
    /// normally final (the device parsed and rejected the command), except
    /// for a small set of messages that indicate momentary pressure.
    pub fn is_retryable(&self) -> bool {
        match self {
            RosSrvError::ConnectionError(_)
            | RosSrvError::ConnectionLost(_)
            | RosSrvError::TimeoutError(_) => true,
            RosSrvError::ProtocolError(msg) => {
                let msg = msg.to_lowercase();
                msg.contains("busy") || msg.contains("temporarily") || msg.contains("try again")
            },
            _ => false,
        }
    }
}

// ============================================================================
// From implementations for external error types
// ============================================================================

impl From<std::io::Error> for RosSrvError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => RosSrvError::TimeoutError(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => RosSrvError::ConnectionLost(err.to_string()),
            _ => RosSrvError::ConnectionError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for RosSrvError {
    fn from(err: serde_json::Error) -> Self {
        RosSrvError::ValidationError(format!("JSON: {err}"))
    }
}

impl From<anyhow::Error> for RosSrvError {
    fn from(err: anyhow::Error) -> Self {
        RosSrvError::ConfigError(format!("Validation: {err}"))
    }
}

// ============================================================================
// Extension trait for adding context to errors
// ============================================================================

/// Extension trait for adding context to errors
pub trait ErrorExt<T> {
    fn config_error(self, msg: &str) -> Result<T>;
    fn connection_error(self, msg: &str) -> Result<T>;
    fn protocol_error(self, msg: &str) -> Result<T>;
    fn context(self, msg: &str) -> Result<T>;
}

impl<T, E> ErrorExt<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn config_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| RosSrvError::ConfigError(format!("{msg}: {e}")))
    }

    fn connection_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| RosSrvError::ConnectionError(format!("{msg}: {e}")))
    }

    fn protocol_error(self, msg: &str) -> Result<T> {
        self.map_err(|e| RosSrvError::ProtocolError(format!("{msg}: {e}")))
    }

    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| RosSrvError::InternalError(format!("{msg}: {e}")))
    }
}

// ============================================================================
// Conversion to RouterError for API boundaries
// ============================================================================

impl From<RosSrvError> for RouterError {
    fn from(err: RosSrvError) -> Self {
        match err {
            RosSrvError::ConfigError(msg) => RouterError::Configuration(msg),
            RosSrvError::ConnectionError(msg) | RosSrvError::ConnectionLost(msg) => {
                RouterError::Communication(msg)
            },
            RosSrvError::AuthenticationError(msg) => RouterError::Authentication(msg),
            RosSrvError::ProtocolError(msg) => RouterError::Protocol {
                protocol: "routeros-api".to_string(),
                message: msg,
            },
            RosSrvError::TimeoutError(msg) | RosSrvError::AcquireTimeout(msg) => {
                RouterError::Timeout(msg)
            },
            RosSrvError::CircuitOpen(msg) => RouterError::CircuitOpen(msg),
            RosSrvError::QueueFull(msg) | RosSrvError::ResourceExhausted(msg) => {
                RouterError::ResourceExhausted(msg)
            },
            RosSrvError::DuplicateCommand(msg) => RouterError::Duplicate(msg),
            RosSrvError::ValidationError(msg) => RouterError::Validation(msg),
            RosSrvError::InternalError(msg) => RouterError::Internal(msg),
        }
    }
}

impl RouterErrorTrait for RosSrvError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::ConfigError(_) => "ROSSRV_CONFIG_ERROR",
            Self::ConnectionError(_) => "ROSSRV_CONNECTION_ERROR",
            Self::ConnectionLost(_) => "ROSSRV_CONNECTION_LOST",
            Self::AuthenticationError(_) => "ROSSRV_AUTH_ERROR",
            Self::ProtocolError(_) => "ROSSRV_PROTOCOL_ERROR",
            Self::TimeoutError(_) => "ROSSRV_TIMEOUT",
            Self::AcquireTimeout(_) => "ROSSRV_ACQUIRE_TIMEOUT",
            Self::CircuitOpen(_) => "ROSSRV_CIRCUIT_OPEN",
            Self::QueueFull(_) => "ROSSRV_QUEUE_FULL",
            Self::ResourceExhausted(_) => "ROSSRV_RESOURCE_EXHAUSTED",
            Self::DuplicateCommand(_) => "ROSSRV_DUPLICATE_COMMAND",
            Self::ValidationError(_) => "ROSSRV_VALIDATION_ERROR",
            Self::InternalError(_) => "ROSSRV_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::ConfigError(_) => ErrorCategory::Configuration,
            Self::ConnectionError(_) | Self::ConnectionLost(_) => ErrorCategory::Connection,
            Self::AuthenticationError(_) => ErrorCategory::Authentication,
            Self::ProtocolError(_) => ErrorCategory::Protocol,
            Self::TimeoutError(_) | Self::AcquireTimeout(_) => ErrorCategory::Timeout,
            Self::CircuitOpen(_) => ErrorCategory::CircuitOpen,
            Self::QueueFull(_) | Self::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
            Self::DuplicateCommand(_) => ErrorCategory::Duplicate,
            Self::ValidationError(_) => ErrorCategory::Validation,
            Self::InternalError(_) => ErrorCategory::Internal,
        }
    }

    fn is_retryable(&self) -> bool {
        RosSrvError::is_retryable(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RosSrvError::connection("refused").is_retryable());
        assert!(RosSrvError::timeout("no reply in 5s").is_retryable());
        assert!(RosSrvError::connection_lost("reset by peer").is_retryable());
        assert!(!RosSrvError::auth("bad password").is_retryable());
        assert!(!RosSrvError::AcquireTimeout("pool".into()).is_retryable());
        assert!(!RosSrvError::CircuitOpen("device 2".into()).is_retryable());
    }

    #[test]
    fn test_trap_busy_pattern_is_retryable() {
        assert!(RosSrvError::protocol("device busy, try later").is_retryable());
        assert!(RosSrvError::protocol("Temporarily unavailable").is_retryable());
        assert!(!RosSrvError::protocol("no such command").is_retryable());
    }

    #[test]
    fn test_io_error_mapping() {
        let err: RosSrvError =
            std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset").into();
        assert!(matches!(err, RosSrvError::ConnectionLost(_)));

        let err: RosSrvError =
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused").into();
        assert!(matches!(err, RosSrvError::ConnectionError(_)));
    }
}
