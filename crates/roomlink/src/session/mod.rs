//! Device session module.
//!
//! A session is one live MQTT connection to one device. The traits here are the
//! seam between the connection lifecycle ([`ConnectionManager`]) and everything
//! that publishes or listens on it, so publishers, the status synchronizer and
//! the Wi-Fi sequencer can run against an in-memory session in tests.

pub mod manager;
pub mod mqtt;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rumqttc::QoS;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Boxed future returned by the session traits.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A message received from a device.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    /// When the message was taken off the wire.
    pub received_at: DateTime<Utc>,
}

impl InboundMessage {
    /// Creates a message stamped with the current time.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            received_at: Utc::now(),
        }
    }

    /// Payload as text, replacing invalid UTF-8.
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// Topic filter and QoS for a subscription request.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionOptions {
    pub topic: String,
    pub qos: QoS,
}

/// Lifecycle of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    /// Torn down for good; no further sessions are opened.
    Disposed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// A live, connected session with one device.
pub trait DeviceSession: Send + Sync {
    /// Publishes a payload at QoS 0 without the retain flag.
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<()>>;

    /// Subscribes to a topic filter.
    fn subscribe<'a>(&'a self, options: &'a SubscriptionOptions) -> BoxFuture<'a, Result<()>>;

    /// Returns a receiver for every message the device sends on this session.
    ///
    /// The receiver reports `Closed` once the session has dropped.
    fn messages(&self) -> broadcast::Receiver<InboundMessage>;

    /// Returns whether the underlying connection is still up.
    fn is_connected(&self) -> bool;
}

/// Hands out the live session for one device, connecting if needed.
pub trait SessionProvider: Send + Sync {
    /// Returns the current session, establishing it first when there is none.
    fn get_session<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Arc<dyn DeviceSession>>>;
}

pub use manager::ConnectionManager;
pub use mqtt::MqttSession;
