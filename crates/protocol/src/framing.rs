//! Frame codec for the MQTT-shaped provisioning frames.
//!
//! # Frame Format
//!
//! Every frame exchanged on the provisioning socket has the layout:
//! - 1 byte: fixed header (packet type in the high nibble)
//! - 1-4 bytes: remaining length, 7 data bits per byte, high bit = continuation
//! - N bytes: body
//!
//! These helpers are pure: bytes in, bytes out. Socket handling lives in the
//! service crate so the codec can be tested without a network.

use crate::error::{ProtocolError, Result};

/// Largest value a four-byte remaining-length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Maximum number of bytes in a remaining-length field.
pub const MAX_REMAINING_LENGTH_BYTES: usize = 4;

/// Fixed header for a CONNECT frame.
pub const CONNECT_HEADER: u8 = 0x10;

/// Fixed header for a CONNACK frame.
pub const CONNACK_HEADER: u8 = 0x20;

/// Fixed header for a QoS 0 PUBLISH frame.
pub const PUBLISH_HEADER: u8 = 0x30;

/// Protocol name carried in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level carried in CONNECT.
pub const PROTOCOL_LEVEL: u8 = 0x04;

/// Connect flags the device firmware expects.
pub const CONNECT_FLAGS: u8 = 0xC2;

/// Encode a remaining-length value.
///
/// Uses the 7-bits-per-byte scheme with the high bit as a continuation flag.
pub fn encode_remaining_length(mut value: usize) -> Result<Vec<u8>> {
    if value > MAX_REMAINING_LENGTH {
        return Err(ProtocolError::FrameTooLarge {
            size: value,
            max: MAX_REMAINING_LENGTH,
        });
    }

    let mut out = Vec::with_capacity(MAX_REMAINING_LENGTH_BYTES);
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
    Ok(out)
}

/// Decode a remaining-length field from the start of `data`.
///
/// Returns the value and the number of bytes consumed, or `None` when the
/// field is not complete yet.
pub fn decode_remaining_length(data: &[u8]) -> Result<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (index, byte) in data.iter().enumerate() {
        if index >= MAX_REMAINING_LENGTH_BYTES {
            return Err(ProtocolError::InvalidRemainingLength(
                "continuation bit set on fourth byte".to_string(),
            ));
        }

        value += (*byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, index + 1)));
        }
        multiplier *= 128;
    }

    if data.len() >= MAX_REMAINING_LENGTH_BYTES {
        return Err(ProtocolError::InvalidRemainingLength(
            "continuation bit set on fourth byte".to_string(),
        ));
    }

    Ok(None)
}

/// Return the total size of the first complete frame in `data`.
///
/// `None` means more bytes are needed. Used to reassemble frames that arrive
/// split across several reads.
pub fn split_frame(data: &[u8]) -> Result<Option<usize>> {
    if data.len() < 2 {
        return Ok(None);
    }

    let Some((body_len, len_bytes)) = decode_remaining_length(&data[1..])? else {
        return Ok(None);
    };

    let total = 1 + len_bytes + body_len;
    if data.len() < total {
        return Ok(None);
    }
    Ok(Some(total))
}

/// Append a 16-bit length-prefixed string.
pub fn put_string(out: &mut Vec<u8>, value: &str) -> Result<()> {
    let bytes = value.as_bytes();
    let len = u16::try_from(bytes.len()).map_err(|_| ProtocolError::StringTooLong(bytes.len()))?;
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

/// Wrap a body with a fixed header byte and its remaining length.
pub fn encode_frame(header: u8, body: &[u8]) -> Result<Vec<u8>> {
    let length = encode_remaining_length(body.len())?;
    let mut out = Vec::with_capacity(1 + length.len() + body.len());
    out.push(header);
    out.extend_from_slice(&length);
    out.extend_from_slice(body);
    Ok(out)
}

/// Build the provisioning CONNECT frame.
///
/// The device reads its identity from the fields after the client id:
/// the asset id is repeated in the second slot and the asset type fills the
/// third. Keep-alive is zero.
pub fn encode_connect(asset_id: &str, asset_type: &str) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(16 + asset_id.len() * 2 + asset_type.len());
    put_string(&mut body, PROTOCOL_NAME)?;
    body.push(PROTOCOL_LEVEL);
    body.push(CONNECT_FLAGS);
    body.extend_from_slice(&0u16.to_be_bytes());

    put_string(&mut body, asset_id)?;
    put_string(&mut body, asset_id)?;
    put_string(&mut body, asset_type)?;

    encode_frame(CONNECT_HEADER, &body)
}

/// Connection acknowledgement outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnackStatus {
    /// Return code zero.
    Accepted,
    /// Any other return code.
    Rejected(u8),
}

/// Parse a 4-byte connection acknowledgement `20 02 00 <code>`.
pub fn parse_connack(data: &[u8]) -> Result<ConnackStatus> {
    match data {
        [CONNACK_HEADER, 0x02, 0x00, 0x00] => Ok(ConnackStatus::Accepted),
        [CONNACK_HEADER, 0x02, 0x00, code] => Ok(ConnackStatus::Rejected(*code)),
        other => Err(ProtocolError::MalformedConnack(other.to_vec())),
    }
}

/// Build a QoS 0 PUBLISH frame (no packet identifier).
pub fn encode_publish(topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let mut body = Vec::with_capacity(2 + topic.len() + payload.len());
    put_string(&mut body, topic)?;
    body.extend_from_slice(payload);
    encode_frame(PUBLISH_HEADER, &body)
}
