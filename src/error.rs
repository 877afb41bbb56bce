//! Error types and handling for Voltaic
//!
//! This module defines the error types used throughout the runtime. The four
//! domain kinds (access mode, configuration, conversion, communication) are
//! kept distinct so callers can decide locally whether a failure is fatal to
//! a setup call, to one element, to one task, or to nothing at all.

use thiserror::Error;

/// Result type alias for Voltaic operations
pub type Result<T> = std::result::Result<T, VoltaicError>;

/// Main error type for Voltaic
#[derive(Debug, Error)]
pub enum VoltaicError {
    /// Write to a non-writable channel or invalid read access
    #[error("Access mode error: {message}")]
    AccessMode { message: String },

    /// Invalid setup, e.g. duplicate registration in a health tree
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Raw/channel type mismatch or encode overflow
    #[error("Conversion error: {message}")]
    Conversion { message: String },

    /// Transport timeout or malformed reply
    #[error("Communication error: {message}")]
    Communication { message: String },

    /// Modbus protocol errors reported by the client library
    #[error("Modbus error: {message}")]
    Modbus { message: String },

    /// Timeout errors
    #[error("Timeout error: {message}")]
    Timeout { message: String },

    /// Validation errors
    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    /// Unknown device or channel
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// File I/O errors
    #[error("I/O error: {message}")]
    Io { message: String },

    /// Generic errors with context
    #[error("Error: {message}")]
    Generic { message: String },
}

impl VoltaicError {
    /// Create a new access mode error
    pub fn access_mode<S: Into<String>>(message: S) -> Self {
        Self::AccessMode {
            message: message.into(),
        }
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a new conversion error
    pub fn conversion<S: Into<String>>(message: S) -> Self {
        Self::Conversion {
            message: message.into(),
        }
    }

    /// Create a new communication error
    pub fn communication<S: Into<String>>(message: S) -> Self {
        Self::Communication {
            message: message.into(),
        }
    }

    /// Create a new Modbus error
    pub fn modbus<S: Into<String>>(message: S) -> Self {
        Self::Modbus {
            message: message.into(),
        }
    }

    /// Create a new timeout error
    pub fn timeout<S: Into<String>>(message: S) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a new validation error
    pub fn validation<S: Into<String>>(field: S, message: S) -> Self {
        Self::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new not-found error
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn generic<S: Into<String>>(message: S) -> Self {
        Self::Generic {
            message: message.into(),
        }
    }

    /// Whether this error stems from the field bus rather than from local
    /// state. Such errors mark a task as failed and are retried next cycle.
    pub const fn is_communication(&self) -> bool {
        matches!(
            self,
            Self::Communication { .. } | Self::Modbus { .. } | Self::Timeout { .. }
        )
    }
}

impl From<std::io::Error> for VoltaicError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_yaml::Error> for VoltaicError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for VoltaicError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}
