//! Error types for device operations.
//!
//! Callers need to tell "could not reach the device" apart from "reached the
//! device and it refused", and both apart from a request that never left the
//! process. [`DeviceError`] keeps those cases as separate variants.

use protocol::ProtocolError;
use thiserror::Error;

/// Errors surfaced by the connectivity core.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// TCP, TLS or MQTT transport failure.
    #[error("transport error: {0}")]
    Transport(String),

    /// The device answered with a frame or code the exchange does not accept.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The request was rejected before any network I/O.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled")]
    Cancelled,

    /// The operation did not complete in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The connection belongs to a client that has been disposed.
    #[error("connection for device {0} was disposed")]
    Disposed(String),

    /// No credentials are stored for the device.
    #[error("device not found: {0}")]
    NotFound(String),

    /// A Wi-Fi provisioning step failed; the remaining steps were skipped.
    #[error("wifi provisioning step {index} ({description}) failed: {source}")]
    WifiStep {
        /// Zero-based position of the failed step.
        index: usize,
        /// Human readable step name.
        description: String,
        /// Underlying failure.
        #[source]
        source: Box<DeviceError>,
    },
}

impl DeviceError {
    /// Returns true when the error is a cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        match self {
            DeviceError::Cancelled => true,
            DeviceError::WifiStep { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// Returns true when the device could not be reached.
    pub fn is_transport(&self) -> bool {
        matches!(self, DeviceError::Transport(_) | DeviceError::Timeout(_))
    }
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => DeviceError::Timeout(err.to_string()),
            _ => DeviceError::Transport(err.to_string()),
        }
    }
}

impl From<rumqttc::ClientError> for DeviceError {
    fn from(err: rumqttc::ClientError) -> Self {
        DeviceError::Transport(err.to_string())
    }
}

impl From<rumqttc::ConnectionError> for DeviceError {
    fn from(err: rumqttc::ConnectionError) -> Self {
        match err {
            rumqttc::ConnectionError::ConnectionRefused(code) => {
                DeviceError::Protocol(ProtocolError::UnexpectedFrame(format!(
                    "connection refused: {:?}",
                    code
                )))
            }
            other => DeviceError::Transport(other.to_string()),
        }
    }
}

impl From<native_tls::Error> for DeviceError {
    fn from(err: native_tls::Error) -> Self {
        DeviceError::Transport(format!("tls: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for DeviceError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        DeviceError::Timeout(err.to_string())
    }
}

impl From<serde_json::Error> for DeviceError {
    fn from(err: serde_json::Error) -> Self {
        DeviceError::Protocol(ProtocolError::from(err))
    }
}

/// Result type alias for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;
