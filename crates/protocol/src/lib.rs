//! # Roomlink Protocol Library
//!
//! Pure codecs for the wire formats spoken by robot vacuums on a local network.
//!
//! ## Overview
//!
//! - **Framing**: the MQTT-shaped binary frames used on the provisioning socket
//!   (remaining-length codec, hand-built CONNECT, CONNACK, QoS 0 PUBLISH)
//! - **Credentials**: the password discovery frame, reply classification,
//!   SET-PASSWORD frame and status parsing, password normalization
//! - **Discovery**: the UDP discovery payload and the descriptor devices reply with
//!
//! Nothing in this crate performs I/O. The `roomlink` crate owns the sockets
//! and feeds bytes through these functions.
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::credentials::{classify_password_reply, normalize_password, PasswordReply};
//! use protocol::framing::split_frame;
//!
//! let mut reply = vec![0xF0, 0x0E, 0xEF, 0xCC, 0x3B, 0x29, 0x00, 0x00, 0x00];
//! reply.extend_from_slice(b"secret");
//! reply.push(0x00);
//!
//! let len = split_frame(&reply).unwrap().unwrap();
//! match classify_password_reply(&reply[..len]).unwrap() {
//!     PasswordReply::Password(raw) => assert_eq!(normalize_password(&raw), ":1:secret"),
//!     PasswordReply::Pending => unreachable!(),
//! }
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codec for the provisioning socket
//! - [`credentials`]: Password retrieval and SET-PASSWORD frames
//! - [`discovery`]: Discovery payload and device descriptor
//! - [`error`]: Error types

pub mod credentials;
pub mod discovery;
pub mod error;
pub mod framing;

pub use credentials::{
    classify_password_reply, encode_set_password, generate_password, normalize_password,
    parse_set_password_response, PasswordReply, DISCOVERY_FRAME, PASSWORD_MARKER,
};
pub use discovery::{DeviceDescriptor, DISCOVERY_PAYLOAD, DISCOVERY_PORT};
pub use error::{ProtocolError, Result, SetPasswordRejection};
pub use framing::{
    encode_connect, encode_frame, encode_publish, encode_remaining_length, parse_connack,
    split_frame, ConnackStatus, MAX_REMAINING_LENGTH,
};
