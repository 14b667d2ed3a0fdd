//! Credential frames for password retrieval and first-time provisioning.
//!
//! # Get flow
//!
//! The client writes [`DISCOVERY_FRAME`] and classifies each reply with
//! [`classify_password_reply`]:
//! - 2 bytes: device not ready, keep reading
//! - 7 bytes or fewer: the pairing gesture was not performed
//! - longer: the password starts at byte [`PASSWORD_OFFSET`]
//!
//! A reply is one complete frame, or a lone `F0 <len>` header followed by the
//! body as a reply of its own. The offset counts from the start of whichever
//! reply carries the password.
//!
//! # Set flow
//!
//! After a CONNECT/CONNACK exchange the client writes the frame from
//! [`encode_set_password`] and scans the reply for [`PASSWORD_MARKER`]; the
//! following byte is the status code.

use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::{ProtocolError, Result, SetPasswordRejection};
use crate::framing::encode_frame;

/// Fixed frame that asks a docked device for its password (`f005efcc3b2900`).
pub const DISCOVERY_FRAME: [u8; 7] = [0xF0, 0x05, 0xEF, 0xCC, 0x3B, 0x29, 0x00];

/// Fixed header for SET-PASSWORD frames.
pub const SET_PASSWORD_HEADER: u8 = 0xF0;

/// Marker preceding the password payload and the status byte in replies.
pub const PASSWORD_MARKER: [u8; 4] = [0xEF, 0xCC, 0x3B, 0x29];

/// Byte offset of the password inside a get-password reply.
pub const PASSWORD_OFFSET: usize = 9;

/// Version tag of the canonical password form.
pub const PASSWORD_VERSION_PREFIX: &str = ":1:";

/// Length of the random token in generated passwords.
pub const GENERATED_TOKEN_LENGTH: usize = 16;

/// Classification of one complete get-password reply frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PasswordReply {
    /// Device acknowledged but has not sent the password yet.
    Pending,
    /// The raw password as sent by the device (not yet normalized).
    Password(String),
}

/// Classify one reply from the get-password exchange.
pub fn classify_password_reply(frame: &[u8]) -> Result<PasswordReply> {
    match frame.len() {
        2 => Ok(PasswordReply::Pending),
        0..=7 => Err(ProtocolError::PasswordNotReady),
        _ => {
            let raw = frame.get(PASSWORD_OFFSET..).unwrap_or_default();
            let raw = trim_trailing_nul(raw);
            if raw.is_empty() {
                return Ok(PasswordReply::Pending);
            }
            Ok(PasswordReply::Password(
                String::from_utf8_lossy(raw).into_owned(),
            ))
        }
    }
}

fn trim_trailing_nul(bytes: &[u8]) -> &[u8] {
    let end = bytes
        .iter()
        .rposition(|b| *b != 0)
        .map(|pos| pos + 1)
        .unwrap_or(0);
    &bytes[..end]
}

/// Bring a retrieved password to the canonical `:1:<seconds>:<token>` form.
///
/// Passwords already tagged with `:1:` are returned unchanged. A password that
/// starts with `:` gets `:1` prepended; anything else gets `:1:`.
pub fn normalize_password(raw: &str) -> String {
    if raw.starts_with(PASSWORD_VERSION_PREFIX) {
        raw.to_string()
    } else if raw.starts_with(':') {
        format!(":1{}", raw)
    } else {
        format!("{}{}", PASSWORD_VERSION_PREFIX, raw)
    }
}

/// Generate a fresh password in canonical form for provisioning.
pub fn generate_password(unix_seconds: i64) -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_TOKEN_LENGTH)
        .map(char::from)
        .collect();
    format!("{}{}:{}", PASSWORD_VERSION_PREFIX, unix_seconds, token)
}

/// Build the SET-PASSWORD frame: `F0 <len> EF CC 3B 29 <password> 00`.
pub fn encode_set_password(password: &str) -> Result<Vec<u8>> {
    if !password.is_ascii() {
        return Err(ProtocolError::UnexpectedFrame(
            "password must be ASCII".to_string(),
        ));
    }

    let mut body = Vec::with_capacity(PASSWORD_MARKER.len() + password.len() + 1);
    body.extend_from_slice(&PASSWORD_MARKER);
    body.extend_from_slice(password.as_bytes());
    body.push(0x00);
    encode_frame(SET_PASSWORD_HEADER, &body)
}

/// Scan a SET-PASSWORD reply for the marker and interpret the status byte.
///
/// Returns `Ok(None)` while the marker or its status byte has not arrived,
/// `Ok(Some(()))` when the device accepted the password, and an error for
/// every refusal or unknown status.
pub fn parse_set_password_response(data: &[u8]) -> Result<Option<()>> {
    let Some(pos) = data
        .windows(PASSWORD_MARKER.len())
        .position(|window| window == PASSWORD_MARKER)
    else {
        return Ok(None);
    };

    let Some(status) = data.get(pos + PASSWORD_MARKER.len()) else {
        return Ok(None);
    };

    match status {
        0x00 => Ok(Some(())),
        0x01 => Err(ProtocolError::SetPasswordRejected(
            SetPasswordRejection::BadFormat,
        )),
        0x02 => Err(ProtocolError::SetPasswordRejected(
            SetPasswordRejection::InternalError,
        )),
        0x03 => Err(ProtocolError::SetPasswordRejected(
            SetPasswordRejection::PermissionDenied,
        )),
        other => Err(ProtocolError::UnknownSetPasswordStatus(*other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discovery_frame_bytes() {
        assert_eq!(hex::encode(DISCOVERY_FRAME), "f005efcc3b2900");
    }

    #[test]
    fn test_two_byte_reply_is_pending() {
        assert_eq!(
            classify_password_reply(&[0xF0, 0x18]).unwrap(),
            PasswordReply::Pending
        );
    }

    #[test]
    fn test_short_reply_is_not_ready() {
        for len in [0usize, 1, 3, 7] {
            let frame = vec![0xF0; len];
            assert!(
                matches!(
                    classify_password_reply(&frame),
                    Err(ProtocolError::PasswordNotReady)
                ),
                "len={} should be rejected",
                len
            );
        }
    }

    #[test]
    fn test_password_starts_at_offset_nine() {
        let mut frame = vec![0xF0, 0x1C, 0xEF, 0xCC, 0x3B, 0x29, 0x00, 0x00, 0x00];
        frame.extend_from_slice(b":1:1700000000:abcdef");
        frame.push(0x00);

        assert_eq!(
            classify_password_reply(&frame).unwrap(),
            PasswordReply::Password(":1:1700000000:abcdef".to_string())
        );
    }

    #[test]
    fn test_body_after_header_starts_at_offset_nine() {
        let mut body = vec![0xEF, 0xCC, 0x3B, 0x29, 0x00, 0x00, 0x00, 0x00, 0x00];
        body.extend_from_slice(b"1700000000:tok");
        body.push(0x00);

        assert_eq!(
            classify_password_reply(&body).unwrap(),
            PasswordReply::Password("1700000000:tok".to_string())
        );
    }

    #[test]
    fn test_normalize_password() {
        assert_eq!(normalize_password("abc"), ":1:abc");
        assert_eq!(normalize_password(":xyz"), ":1:xyz");
        assert_eq!(normalize_password(":1:123:tok"), ":1:123:tok");
    }

    #[test]
    fn test_generate_password_shape() {
        let password = generate_password(1_700_000_000);
        let parts: Vec<&str> = password.splitn(4, ':').collect();

        assert_eq!(parts[0], "");
        assert_eq!(parts[1], "1");
        assert_eq!(parts[2], "1700000000");
        assert_eq!(parts[3].len(), GENERATED_TOKEN_LENGTH);
        assert!(parts[3].chars().all(|c| c.is_ascii_alphanumeric()));
        assert_eq!(normalize_password(&password), password);
    }

    #[test]
    fn test_set_password_frame_layout() {
        let frame = encode_set_password(":1:1:tok").unwrap();

        assert_eq!(frame[0], SET_PASSWORD_HEADER);
        assert_eq!(frame[1] as usize, 4 + 8 + 1);
        assert_eq!(&frame[2..6], &PASSWORD_MARKER);
        assert_eq!(&frame[6..14], b":1:1:tok");
        assert_eq!(frame[14], 0x00);
        assert_eq!(frame.len(), 15);
    }

    #[test]
    fn test_set_password_rejects_non_ascii() {
        assert!(encode_set_password("pässword").is_err());
    }

    #[test]
    fn test_set_password_status_accepted() {
        let reply = [0xF0, 0x05, 0xEF, 0xCC, 0x3B, 0x29, 0x00];
        assert_eq!(parse_set_password_response(&reply).unwrap(), Some(()));
    }

    #[test]
    fn test_set_password_status_rejections() {
        let expected = [
            (0x01, SetPasswordRejection::BadFormat),
            (0x02, SetPasswordRejection::InternalError),
            (0x03, SetPasswordRejection::PermissionDenied),
        ];

        for (code, reason) in expected {
            let reply = [0xF0, 0x05, 0xEF, 0xCC, 0x3B, 0x29, code];
            match parse_set_password_response(&reply) {
                Err(ProtocolError::SetPasswordRejected(r)) => assert_eq!(r, reason),
                other => panic!("unexpected result for {:#04x}: {:?}", code, other),
            }
        }
    }

    #[test]
    fn test_set_password_unknown_status_is_failure() {
        let reply = [0xF0, 0x05, 0xEF, 0xCC, 0x3B, 0x29, 0x09];
        assert!(matches!(
            parse_set_password_response(&reply),
            Err(ProtocolError::UnknownSetPasswordStatus(0x09))
        ));
    }

    #[test]
    fn test_set_password_response_incomplete() {
        assert_eq!(parse_set_password_response(&[]).unwrap(), None);
        assert_eq!(parse_set_password_response(&[0xF0, 0x05, 0xEF]).unwrap(), None);
        assert_eq!(
            parse_set_password_response(&[0xF0, 0x05, 0xEF, 0xCC, 0x3B, 0x29]).unwrap(),
            None
        );
    }

    #[test]
    fn test_set_password_marker_found_after_noise() {
        let reply = [0x30, 0x00, 0x11, 0xEF, 0xCC, 0x3B, 0x29, 0x00];
        assert_eq!(parse_set_password_response(&reply).unwrap(), Some(()));
    }
}
