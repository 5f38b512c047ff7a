//! Unified error handling for RouterOS control-channel services
//!
//! This crate provides the cross-service error system: a shared error type,
//! error categories for classification, and a trait every service error
//! implements so that retry and reporting logic can stay generic.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

// ============================================================================
// ErrorInfo - API error response type
// ============================================================================

/// Standard error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error code (HTTP status or custom)
    pub code: u16,
    /// Error message
    pub message: String,
    /// Detailed error description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Field-specific errors for validation
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub field_errors: HashMap<String, Vec<String>>,
}

impl ErrorInfo {
    /// Create a new ErrorInfo with just a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: 500,
            message: message.into(),
            details: None,
            field_errors: HashMap::new(),
        }
    }

    /// Set the error code
    pub fn with_code(mut self, code: u16) -> Self {
        self.code = code;
        self
    }

    /// Add details
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Add a field error
    pub fn add_field_error(mut self, field: impl Into<String>, error: impl Into<String>) -> Self {
        self.field_errors
            .entry(field.into())
            .or_default()
            .push(error.into());
        self
    }
}

// ============================================================================
// RouterError - Main error type
// ============================================================================

/// Main error type shared by all control-channel services
#[derive(Debug, Error)]
pub enum RouterError {
    // ======================================
    // Configuration Errors
    // ======================================
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("Missing required configuration: {0}")]
    MissingConfig(String),

    // ======================================
    // Protocol & Communication Errors
    // ======================================
    #[error("Protocol error: {protocol}: {message}")]
    Protocol { protocol: String, message: String },

    #[error("Communication error: {0}")]
    Communication(String),

    #[error("Connection failed: {endpoint}: {reason}")]
    ConnectionFailed { endpoint: String, reason: String },

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Timeout waiting for response from {0}")]
    Timeout(String),

    // ======================================
    // Resource & Admission Errors
    // ======================================
    #[error("Circuit open for device {0}")]
    CircuitOpen(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Duplicate submission: {0}")]
    Duplicate(String),

    // ======================================
    // Generic Errors
    // ======================================
    #[error("Not found: {resource}")]
    NotFound { resource: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using RouterError
pub type Result<T> = std::result::Result<T, RouterError>;

// ============================================================================
// ErrorCategory - classification for retry and reporting decisions
// ============================================================================

/// Coarse error categories used by retry classification and API mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    Configuration,
    Connection,
    Authentication,
    Protocol,
    Timeout,
    CircuitOpen,
    ResourceExhausted,
    ResourceBusy,
    Duplicate,
    NotFound,
    Validation,
    Permission,
    Internal,
}

impl ErrorCategory {
    /// Whether errors of this category are worth retrying with backoff.
    ///
    /// Connection and timeout failures are transient by nature; everything
    /// else either needs operator action (config, auth) or will fail the
    /// same way again (validation, duplicate).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Connection | ErrorCategory::Timeout | ErrorCategory::ResourceBusy
        )
    }
}

// ============================================================================
// RouterErrorTrait - implemented by every service error type
// ============================================================================

/// Trait implemented by service-level error enums so generic retry and
/// reporting code can classify them without knowing the concrete type.
pub trait RouterErrorTrait: std::error::Error {
    /// Stable machine-readable error code
    fn error_code(&self) -> &'static str;

    /// Category for classification
    fn category(&self) -> ErrorCategory;

    /// Whether the error is transient and safe to retry
    fn is_retryable(&self) -> bool {
        self.category().is_retryable()
    }
}

impl RouterErrorTrait for RouterError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } | Self::MissingConfig(_) => {
                "ROUTER_CONFIG_ERROR"
            },
            Self::Protocol { .. } => "ROUTER_PROTOCOL_ERROR",
            Self::Communication(_) | Self::ConnectionFailed { .. } => "ROUTER_CONNECTION_ERROR",
            Self::Authentication(_) => "ROUTER_AUTH_ERROR",
            Self::Timeout(_) => "ROUTER_TIMEOUT",
            Self::CircuitOpen(_) => "ROUTER_CIRCUIT_OPEN",
            Self::ResourceExhausted(_) => "ROUTER_RESOURCE_EXHAUSTED",
            Self::ResourceBusy(_) => "ROUTER_RESOURCE_BUSY",
            Self::Duplicate(_) => "ROUTER_DUPLICATE",
            Self::NotFound { .. } => "ROUTER_NOT_FOUND",
            Self::AlreadyExists(_) => "ROUTER_ALREADY_EXISTS",
            Self::Validation(_) => "ROUTER_VALIDATION_ERROR",
            Self::Processing(_) => "ROUTER_PROCESSING_ERROR",
            Self::Io(_) => "ROUTER_IO_ERROR",
            Self::Serialization(_) => "ROUTER_SERIALIZATION_ERROR",
            Self::Internal(_) => "ROUTER_INTERNAL_ERROR",
        }
    }

    fn category(&self) -> ErrorCategory {
        match self {
            Self::Configuration(_) | Self::InvalidConfig { .. } | Self::MissingConfig(_) => {
                ErrorCategory::Configuration
            },
            Self::Protocol { .. } => ErrorCategory::Protocol,
            Self::Communication(_) | Self::ConnectionFailed { .. } | Self::Io(_) => {
                ErrorCategory::Connection
            },
            Self::Authentication(_) => ErrorCategory::Authentication,
            Self::Timeout(_) => ErrorCategory::Timeout,
            Self::CircuitOpen(_) => ErrorCategory::CircuitOpen,
            Self::ResourceExhausted(_) => ErrorCategory::ResourceExhausted,
            Self::ResourceBusy(_) => ErrorCategory::ResourceBusy,
            Self::Duplicate(_) => ErrorCategory::Duplicate,
            Self::NotFound { .. } => ErrorCategory::NotFound,
            Self::AlreadyExists(_) => ErrorCategory::Validation,
            Self::Validation(_) | Self::Serialization(_) => ErrorCategory::Validation,
            Self::Processing(_) | Self::Internal(_) => ErrorCategory::Internal,
        }
    }
}

impl From<RouterError> for ErrorInfo {
    fn from(err: RouterError) -> Self {
        let code = match err.category() {
            ErrorCategory::Validation | ErrorCategory::Duplicate => 400,
            ErrorCategory::Authentication => 401,
            ErrorCategory::Permission => 403,
            ErrorCategory::NotFound => 404,
            ErrorCategory::Timeout => 408,
            ErrorCategory::ResourceBusy | ErrorCategory::ResourceExhausted => 429,
            ErrorCategory::CircuitOpen => 503,
            _ => 500,
        };
        ErrorInfo::new(err.to_string())
            .with_code(code)
            .with_details(format!(
                "error_code: {}, category: {:?}, retryable: {}",
                err.error_code(),
                err.category(),
                err.is_retryable()
            ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_categories() {
        assert!(ErrorCategory::Connection.is_retryable());
        assert!(ErrorCategory::Timeout.is_retryable());
        assert!(ErrorCategory::ResourceBusy.is_retryable());
        assert!(!ErrorCategory::Authentication.is_retryable());
        assert!(!ErrorCategory::Validation.is_retryable());
        assert!(!ErrorCategory::CircuitOpen.is_retryable());
    }

    #[test]
    fn test_error_code_stability() {
        let err = RouterError::Timeout("device 3".to_string());
        assert_eq!(err.error_code(), "ROUTER_TIMEOUT");
        assert!(err.is_retryable());

        let err = RouterError::Authentication("bad credentials".to_string());
        assert_eq!(err.error_code(), "ROUTER_AUTH_ERROR");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_info_mapping() {
        let info: ErrorInfo = RouterError::NotFound {
            resource: "device 7".to_string(),
        }
        .into();
        assert_eq!(info.code, 404);
        assert!(info.message.contains("device 7"));
    }
}
