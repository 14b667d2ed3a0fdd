//! Credential protocol client.
//!
//! Retrieves a docked device's password and sets a new one during first-time
//! provisioning. Both exchanges run over a raw TLS socket using the frames from
//! [`protocol::credentials`]; they do not go through the MQTT session.
//!
//! The exchanges are generic over the byte stream so they can run against an
//! in-memory device in tests.

use std::time::Duration;

use chrono::{Datelike, Local, Offset, TimeZone, Utc};
use protocol::credentials::{
    classify_password_reply, encode_set_password, normalize_password,
    parse_set_password_response, PasswordReply, DISCOVERY_FRAME,
};
use protocol::framing::{
    decode_remaining_length, encode_connect, encode_publish, parse_connack, split_frame,
    ConnackStatus,
};
use protocol::ProtocolError;
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_native_tls::TlsStream;
use tokio_util::sync::CancellationToken;

use crate::config::ProvisioningConfig;
use crate::error::{DeviceError, Result};

/// Topic the auxiliary time messages are published on.
pub const WIFICTL_TOPIC: &str = "wifictl";

/// Timezone sent when the caller does not provide one.
pub const DEFAULT_TIMEZONE: &str = "UTC";

const READ_CHUNK: usize = 1024;

/// Length of a read carrying only a reply header.
const HEADER_REPLY_LEN: usize = 2;

/// Standard offset of `tz` from UTC in minutes, ignoring daylight saving.
///
/// Daylight saving only ever moves clocks forward from the standard offset,
/// so the smaller of the January and July offsets is the standard one.
pub(crate) fn base_offset_minutes<Tz: TimeZone>(tz: &Tz, year: i32) -> i32 {
    let seconds = [1, 7]
        .into_iter()
        .filter_map(|month| tz.with_ymd_and_hms(year, month, 1, 0, 0, 0).earliest())
        .map(|at| at.offset().fix().local_minus_utc())
        .min()
        .unwrap_or(0);
    seconds / 60
}

/// Standard offset of the local timezone in minutes.
pub(crate) fn local_base_offset_minutes() -> i32 {
    base_offset_minutes(&Local, Local::now().year())
}

/// Parameters for provisioning a new password.
#[derive(Clone)]
pub struct SetPasswordRequest {
    /// Written into the client id and second identity slot of the CONNECT frame.
    pub asset_id: String,
    /// Written into the third identity slot of the CONNECT frame.
    pub asset_type: String,
    /// New password, ASCII.
    pub password: String,
    /// IANA timezone name sent before the password.
    pub timezone: Option<String>,
    /// Current time as unix seconds.
    pub utc_time: i64,
    /// Standard local offset from UTC in minutes, without daylight saving.
    pub utc_offset_minutes: i32,
}

impl SetPasswordRequest {
    /// Request for a device identified by `blid`, stamped with the local clock.
    ///
    /// The blid fills both identity slots of the CONNECT frame.
    pub fn new(blid: impl Into<String>, password: impl Into<String>) -> Self {
        let blid = blid.into();
        Self {
            asset_id: blid.clone(),
            asset_type: blid,
            password: password.into(),
            timezone: None,
            utc_time: Utc::now().timestamp(),
            utc_offset_minutes: local_base_offset_minutes(),
        }
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    fn auxiliary_messages(&self) -> [serde_json::Value; 3] {
        [
            json!({"state": {"utctime": self.utc_time}}),
            json!({"state": {"localtimeoffset": self.utc_offset_minutes}}),
            json!({"state": {"timezone": self.timezone.as_deref().unwrap_or(DEFAULT_TIMEZONE)}}),
        ]
    }
}

impl std::fmt::Debug for SetPasswordRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SetPasswordRequest")
            .field("asset_id", &self.asset_id)
            .field("asset_type", &self.asset_type)
            .field("password", &"<redacted>")
            .field("timezone", &self.timezone)
            .finish()
    }
}

/// Reads one byte chunk, honouring the read timeout and cancellation.
async fn read_some<S>(
    stream: &mut S,
    buf: &mut [u8],
    read_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<usize>
where
    S: AsyncRead + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeviceError::Cancelled),
        read = tokio::time::timeout(read_timeout, stream.read(buf)) => match read {
            Ok(result) => Ok(result?),
            Err(_) => Err(DeviceError::Timeout(format!(
                "no reply from device within {}s",
                read_timeout.as_secs()
            ))),
        },
    }
}

async fn write_frame<S>(stream: &mut S, frame: &[u8], cancel: &CancellationToken) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeviceError::Cancelled),
        written = async {
            stream.write_all(frame).await?;
            stream.flush().await
        } => Ok(written?),
    }
}

/// Reassembles frames that arrive split across reads.
#[derive(Debug, Default)]
struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    async fn next_frame<S>(
        &mut self,
        stream: &mut S,
        read_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>>
    where
        S: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            if let Some(len) = split_frame(&self.buf)? {
                return Ok(self.buf.drain(..len).collect());
            }

            let n = read_some(stream, &mut chunk, read_timeout, cancel).await?;
            if n == 0 {
                return Err(self.closed_error());
            }
            tracing::debug!(bytes = n, "Received bytes from device");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    fn closed_error(&self) -> DeviceError {
        if self.buf.is_empty() {
            return DeviceError::Transport("connection closed by device".to_string());
        }
        let expected = self
            .buf
            .get(1..)
            .and_then(|rest| decode_remaining_length(rest).ok().flatten())
            .map(|(body, len_bytes)| 1 + len_bytes + body)
            .unwrap_or(self.buf.len() + 1);
        DeviceError::Protocol(ProtocolError::Truncated {
            expected,
            actual: self.buf.len(),
        })
    }
}

/// Splits the get-password reply stream into the replies the device sends.
///
/// A reply is either one complete frame, or a read holding only the 2-byte
/// `F0 <len>` header. The header read is a reply of its own and the body that
/// follows it is classified by itself, so its password offset counts from the
/// body. Partial reads of a frame or body are reassembled.
#[derive(Debug, Default)]
struct PasswordReplies {
    frames: FrameReader,
    header: Option<Vec<u8>>,
    body_len: Option<usize>,
}

impl PasswordReplies {
    /// Next reply already sitting in the buffer, if any.
    fn next_buffered(&mut self) -> Result<Option<Vec<u8>>> {
        if let Some(header) = self.header.take() {
            let announced = decode_remaining_length(&header[1..])?.map_or(0, |(len, _)| len);
            if announced > 0 {
                self.body_len = Some(announced);
            }
            return Ok(Some(header));
        }

        let buf = &mut self.frames.buf;
        let len = match self.body_len {
            Some(len) if buf.len() >= len => {
                self.body_len = None;
                len
            }
            Some(_) => return Ok(None),
            None => match split_frame(buf)? {
                Some(len) => len,
                None => return Ok(None),
            },
        };
        Ok(Some(buf.drain(..len).collect()))
    }

    async fn fill<S>(
        &mut self,
        stream: &mut S,
        read_timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>
    where
        S: AsyncRead + Unpin,
    {
        let mut chunk = [0u8; READ_CHUNK];
        let n = read_some(stream, &mut chunk, read_timeout, cancel).await?;
        if n == 0 {
            return Err(self.closed_error());
        }
        tracing::debug!(bytes = n, "Received bytes from device");

        let starts_reply = self.frames.buf.is_empty() && self.body_len.is_none();
        if starts_reply && n == HEADER_REPLY_LEN {
            self.header = Some(chunk[..n].to_vec());
        } else {
            self.frames.buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn closed_error(&self) -> DeviceError {
        match self.body_len {
            Some(expected) => DeviceError::Protocol(ProtocolError::Truncated {
                expected,
                actual: self.frames.buf.len(),
            }),
            None => self.frames.closed_error(),
        }
    }
}

/// Runs the get-password exchange over an established stream.
///
/// Returns the password in canonical `:1:` form.
pub async fn get_password_over<S>(
    stream: &mut S,
    read_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<String>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    tracing::debug!(frame = %hex::encode(DISCOVERY_FRAME), "Sending password request");
    write_frame(stream, &DISCOVERY_FRAME, cancel).await?;

    let mut replies = PasswordReplies::default();
    loop {
        while let Some(reply) = replies.next_buffered()? {
            match classify_password_reply(&reply)? {
                PasswordReply::Pending => {
                    tracing::debug!(len = reply.len(), "Device acknowledged, waiting for password");
                }
                PasswordReply::Password(raw) => return Ok(normalize_password(&raw)),
            }
        }
        replies.fill(stream, read_timeout, cancel).await?;
    }
}

/// Runs the set-password exchange over an established stream.
pub async fn set_password_over<S>(
    stream: &mut S,
    request: &SetPasswordRequest,
    read_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let connect = encode_connect(&request.asset_id, &request.asset_type)?;
    tracing::debug!(asset_id = %request.asset_id, "Sending provisioning CONNECT");
    write_frame(stream, &connect, cancel).await?;

    let mut reader = FrameReader::default();
    let connack = reader.next_frame(stream, read_timeout, cancel).await?;
    match parse_connack(&connack)? {
        ConnackStatus::Accepted => tracing::debug!("Provisioning CONNECT accepted"),
        ConnackStatus::Rejected(code) => {
            return Err(ProtocolError::ConnackRejected { code }.into());
        }
    }

    for message in request.auxiliary_messages() {
        let body = serde_json::to_vec(&message)?;
        let frame = encode_publish(WIFICTL_TOPIC, &body)?;
        tracing::debug!(topic = WIFICTL_TOPIC, payload = %message, "Sending time message");
        write_frame(stream, &frame, cancel).await?;
    }

    let frame = encode_set_password(&request.password)?;
    tracing::debug!("Sending SET-PASSWORD frame");
    write_frame(stream, &frame, cancel).await?;

    // Whatever the device already sent after the CONNACK is part of the reply.
    let mut reply = std::mem::take(&mut reader.buf);
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        if parse_set_password_response(&reply)?.is_some() {
            return Ok(());
        }

        let n = read_some(stream, &mut chunk, read_timeout, cancel).await?;
        if n == 0 {
            return Err(ProtocolError::UnexpectedFrame(format!(
                "connection closed before set password status ({} bytes received)",
                reply.len()
            ))
            .into());
        }
        reply.extend_from_slice(&chunk[..n]);
    }
}

/// Client for the credential exchanges on a device's provisioning socket.
#[derive(Debug, Clone)]
pub struct CredentialClient {
    read_timeout: Duration,
    connect_timeout: Duration,
}

impl CredentialClient {
    pub fn new(read_timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            read_timeout,
            connect_timeout,
        }
    }

    /// Client using the provisioning read timeout for both connect and reads.
    pub fn from_config(settings: &ProvisioningConfig) -> Self {
        let timeout = Duration::from_secs(settings.read_timeout_secs);
        Self::new(timeout, timeout)
    }

    /// Opens a TLS connection that accepts the device's self-signed certificate.
    pub async fn connect(
        &self,
        ip: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<TlsStream<TcpStream>> {
        tracing::info!(ip = %ip, port, "Connecting to device provisioning socket");

        let connector = tokio_native_tls::TlsConnector::from(crate::tls::device_connector()?);

        let handshake = async {
            let tcp = TcpStream::connect((ip, port)).await?;
            tcp.set_nodelay(true)?;
            Ok::<_, DeviceError>(connector.connect(ip, tcp).await?)
        };

        let stream = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            result = tokio::time::timeout(self.connect_timeout, handshake) => match result {
                Ok(stream) => stream?,
                Err(_) => {
                    return Err(DeviceError::Timeout(format!(
                        "connecting to {}:{} took longer than {}s",
                        ip,
                        port,
                        self.connect_timeout.as_secs()
                    )))
                }
            },
        };

        tracing::debug!(ip = %ip, port, "TLS connection established");
        Ok(stream)
    }

    /// Retrieves the password from a docked device after the pairing gesture.
    pub async fn get_password(
        &self,
        ip: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let mut stream = self.connect(ip, port, cancel).await?;
        let result = get_password_over(&mut stream, self.read_timeout, cancel).await;
        let _ = stream.shutdown().await;

        match &result {
            Ok(_) => tracing::info!(ip = %ip, port, "Retrieved device password"),
            Err(e) if e.is_cancelled() => tracing::debug!(ip = %ip, "Password retrieval cancelled"),
            Err(e) => tracing::warn!(ip = %ip, port, error = %e, "Password retrieval failed"),
        }
        result
    }

    /// Sets a new password on a device hosting its own access point.
    pub async fn set_password(
        &self,
        ip: &str,
        port: u16,
        request: &SetPasswordRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream = self.connect(ip, port, cancel).await?;
        let result = set_password_over(&mut stream, request, self.read_timeout, cancel).await;
        let _ = stream.shutdown().await;

        match &result {
            Ok(()) => tracing::info!(ip = %ip, asset_id = %request.asset_id, "Device accepted new password"),
            Err(e) if e.is_cancelled() => tracing::debug!(ip = %ip, "Set password cancelled"),
            Err(e) => tracing::warn!(ip = %ip, error = %e, "Set password failed"),
        }
        result
    }
}
