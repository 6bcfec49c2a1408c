//! Error types for linktrack

use std::io;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TrackerError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Command execution failed
    #[error("Command '{cmd}' failed (code {code:?}): {stderr}")]
    CommandFailed {
        cmd: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Interface not found
    #[error("Interface not found: {0}")]
    InterfaceNotFound(String),

    /// Static mode requested but the stored configuration is absent or incomplete
    #[error("Static configuration unusable: {0}")]
    NoStaticConfig(String),

    /// DHCP negotiation failed or timed out
    #[error("DHCP failed: {0}")]
    DhcpFailed(String),

    /// The OS rejected the address/route configuration
    #[error("Failed to apply configuration: {0}")]
    ApplyFailed(String),

    /// Startup-time failure to subscribe to interface events
    #[error("Observer registration failed: {0}")]
    ObserverRegistrationFailed(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Parse error
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl From<serde_json::Error> for TrackerError {
    fn from(error: serde_json::Error) -> Self {
        TrackerError::ParseError(error.to_string())
    }
}

pub type TrackerResult<T> = Result<T, TrackerError>;
