//! Error types for the onboarding rig
//!
//! Most failures originate in an external collaborator (device console,
//! authenticator, wifi station, packet capture); each wrapper names the
//! component it came from so a failed run can be traced back quickly.

use std::io;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the onboarding rig
#[derive(Error, Debug)]
pub enum Error {
    // === Run Protocol Errors ===
    #[error("device advertises no known direct connection method (program: {program})")]
    UnknownDirectMethod { program: String },

    #[error("direct connection method '{0}' not implemented")]
    NotImplemented(String),

    #[error("protocol violation: state '{state}' delivered out of order")]
    ProtocolViolation { state: String },

    // === Collaborator Errors ===
    #[error("device link error: {0}")]
    Device(String),

    #[error("device console closed before the run completed")]
    DeviceLinkClosed,

    #[error("authenticator error: {0}")]
    Authenticator(String),

    #[error("wifi station '{op}' failed: {message}")]
    Station { op: String, message: String },

    #[error("packet capture on '{netif}' failed: {message}")]
    Capture { netif: String, message: String },

    #[error("required tool '{name}' not found in configuration or PATH")]
    ToolNotFound { name: String },

    // === Configuration Errors ===
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid configuration file: {0}")]
    ConfigParse(String),

    #[error("failed to read file '{path}': {error}")]
    FileRead { path: String, error: String },

    // === IO Errors ===
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    // === Serialization Errors ===
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Internal Errors ===
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a device link error
    pub fn device(message: impl Into<String>) -> Self {
        Self::Device(message.into())
    }

    /// Create an authenticator error
    pub fn authenticator(message: impl Into<String>) -> Self {
        Self::Authenticator(message.into())
    }

    /// Create a wifi station error for a named operation
    pub fn station(op: &str, message: impl Into<String>) -> Self {
        Self::Station {
            op: op.to_string(),
            message: message.into(),
        }
    }

    /// Create a packet capture error for a named interface
    pub fn capture(netif: &str, message: impl Into<String>) -> Self {
        Self::Capture {
            netif: netif.to_string(),
            message: message.into(),
        }
    }
}
