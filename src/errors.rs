//! Error types for fanbridge

use thiserror::Error;

/// Result type alias for the configuration and IO boundary
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors raised while loading configuration or reading drive state.
///
/// Serial I/O never surfaces these; it reports [`SerialError`] values inside
/// its result structures instead.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid {class} curve: {reason}")]
    InvalidCurve { class: String, reason: String },
}

/// Failure modes of the serial transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SerialError {
    #[error("no serial ports detected")]
    NoPortsDetected,

    #[error("no port specified")]
    NoPortSpecified,

    #[error("not a USB CDC device")]
    ConsolePort,

    #[error(
        "{message} (hint: map the device into the container using --device={port} or Unraid's Device field; \
         do not bind-mount the TTY. Also map /dev/serial/by-id (ro) and optionally set FANBRIDGE_SERIAL_PORT to the by-id path)"
    )]
    PermissionDenied { port: String, message: String },

    #[error("{message}")]
    OpenFailed { port: String, message: String },

    #[error("timed out waiting for reply on {port}")]
    Timeout { port: String },

    #[error("{0}")]
    Io(String),
}

impl SerialError {
    /// Classify a failed open of `port`.
    pub fn from_open(port: &str, err: &serialport::Error) -> Self {
        let message = err.to_string();
        let permission = matches!(
            err.kind(),
            serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied)
        ) || looks_like_permission_problem(&message);

        if permission {
            SerialError::PermissionDenied {
                port: port.to_string(),
                message,
            }
        } else {
            SerialError::OpenFailed {
                port: port.to_string(),
                message,
            }
        }
    }

    /// Classify an I/O failure during an exchange on `port`.
    pub fn from_io(port: &str, err: &std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => SerialError::Timeout {
                port: port.to_string(),
            },
            std::io::ErrorKind::PermissionDenied => SerialError::PermissionDenied {
                port: port.to_string(),
                message: err.to_string(),
            },
            _ => SerialError::Io(err.to_string()),
        }
    }
}

/// Connection failure texts that point at a host setup problem
pub fn is_actionable_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["denied", "permission", "not opened", "busy", "no such device"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn looks_like_permission_problem(message: &str) -> bool {
    let lower = message.to_lowercase();
    ["permission", "denied", "operation not permitted"]
        .iter()
        .any(|needle| lower.contains(needle))
}
