//! Error types for the protocol crate.

use thiserror::Error;

/// Reason a device gave for refusing a SET-PASSWORD frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetPasswordRejection {
    /// Status `0x01`: the password had the wrong format or context.
    BadFormat,
    /// Status `0x02`: the device failed internally while storing it.
    InternalError,
    /// Status `0x03`: the device is not in provisioning mode.
    PermissionDenied,
}

impl SetPasswordRejection {
    /// Returns the wire status code for this rejection.
    pub fn code(self) -> u8 {
        match self {
            SetPasswordRejection::BadFormat => 0x01,
            SetPasswordRejection::InternalError => 0x02,
            SetPasswordRejection::PermissionDenied => 0x03,
        }
    }
}

impl std::fmt::Display for SetPasswordRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self {
            SetPasswordRejection::BadFormat => "bad context or password format",
            SetPasswordRejection::InternalError => "device internal error",
            SetPasswordRejection::PermissionDenied => "permission denied (not in provisioning mode)",
        };
        f.write_str(reason)
    }
}

/// Protocol error type covering malformed or refused frames.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Remaining-length field is longer than four bytes or otherwise malformed.
    #[error("invalid remaining length encoding: {0}")]
    InvalidRemainingLength(String),

    /// Frame body exceeds the largest encodable remaining length.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual body size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// A length-prefixed string does not fit in 16 bits.
    #[error("string field too long: {0} bytes")]
    StringTooLong(usize),

    /// The stream ended in the middle of a frame.
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated {
        /// Bytes the frame header announced.
        expected: usize,
        /// Bytes received before the stream ended.
        actual: usize,
    },

    /// The device sent a reply too short to carry a password.
    #[error(
        "device did not send password: make sure it is on the dock, hold HOME for 2 seconds \
         until it beeps, then retry immediately"
    )]
    PasswordNotReady,

    /// Connection acknowledgement did not have the expected 4-byte shape.
    #[error("malformed connack: {0:02x?}")]
    MalformedConnack(Vec<u8>),

    /// Connection acknowledgement carried a non-zero return code.
    #[error("connection refused by device: return code {code:#04x}")]
    ConnackRejected {
        /// Return code from byte 3 of the acknowledgement.
        code: u8,
    },

    /// Device refused a new password with a known status.
    #[error("set password rejected: {0}")]
    SetPasswordRejected(SetPasswordRejection),

    /// Device answered a SET-PASSWORD frame with an unknown status byte.
    #[error("unparseable set password response: unknown status {0:#04x}")]
    UnknownSetPasswordStatus(u8),

    /// A frame arrived that the current exchange does not expect.
    #[error("unexpected frame: {0}")]
    UnexpectedFrame(String),

    /// Failed to deserialize a payload.
    #[error("deserialization failed: {0}")]
    Deserialization(String),
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}
