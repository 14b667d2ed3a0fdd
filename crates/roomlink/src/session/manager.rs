//! Connection manager owning the lazily-established session for one device.
//!
//! The first [`SessionProvider::get_session`] call connects; later calls reuse
//! the session while it stays up and reconnect once it has dropped. There is
//! no retry inside the manager: a failed attempt is returned to the caller.
//! Once [`ConnectionManager::dispose`] has run the manager never dials again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    Transport,
};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::mqtt::{drive_event_loop, MqttSession};
use super::{BoxFuture, ConnectionState, DeviceSession, SessionProvider, SubscriptionOptions};
use crate::config::MqttConfig;
use crate::devices::DeviceIdentity;
use crate::error::{DeviceError, Result};
use crate::tls::device_connector;

/// Owns at most one live MQTT session for one device identity.
pub struct ConnectionManager {
    identity: DeviceIdentity,
    settings: MqttConfig,
    /// Serializes connection attempts so only one session is ever established.
    gate: Mutex<()>,
    current: RwLock<Option<Arc<MqttSession>>>,
    connecting: AtomicBool,
    disposed: AtomicBool,
}

/// Marks a connection attempt in progress until dropped.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn enter(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ConnectionManager {
    /// Creates a manager for the given device. Does not connect.
    pub fn new(identity: DeviceIdentity, settings: MqttConfig) -> Self {
        Self {
            identity,
            settings,
            gate: Mutex::new(()),
            current: RwLock::new(None),
            connecting: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// The identity this manager connects with.
    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        if self.is_disposed() {
            return ConnectionState::Disposed;
        }
        if self.connecting.load(Ordering::SeqCst) {
            return ConnectionState::Connecting;
        }
        if self.is_connected() {
            ConnectionState::Connected
        } else {
            ConnectionState::Disconnected
        }
    }

    /// Returns whether a live session exists.
    pub fn is_connected(&self) -> bool {
        self.live_session().is_some()
    }

    /// Returns whether [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Builds subscription options for a topic filter. No I/O.
    pub fn create_subscription(&self, topic: impl Into<String>) -> SubscriptionOptions {
        SubscriptionOptions {
            topic: topic.into(),
            qos: QoS::AtLeastOnce,
        }
    }

    /// Disconnects the current session, if any, and stops its driver task.
    pub async fn close(&self) {
        let _guard = self.gate.lock().await;
        let session = self
            .current
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(session) = session {
            session.close().await;
            tracing::info!(blid = %self.identity.blid, "Connection closed");
        }
    }

    /// Closes the current session and refuses every later
    /// [`get_session`](SessionProvider::get_session) call.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        self.close().await;
        tracing::debug!(blid = %self.identity.blid, "Connection manager disposed");
    }

    fn disposed_error(&self) -> DeviceError {
        DeviceError::Disposed(self.identity.blid.clone())
    }

    fn live_session(&self) -> Option<Arc<MqttSession>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|s| s.is_connected())
            .cloned()
    }

    fn mqtt_options(&self) -> Result<MqttOptions> {
        let identity = &self.identity;
        let mut options = MqttOptions::new(&identity.blid, &identity.ip, identity.port);
        options
            .set_credentials(&identity.blid, &identity.password)
            .set_keep_alive(Duration::from_secs(self.settings.keep_alive_secs))
            .set_clean_session(true)
            .set_transport(Transport::tls_with_config(
                TlsConfiguration::NativeConnector(device_connector()?),
            ));
        Ok(options)
    }

    async fn connect(&self, cancel: &CancellationToken) -> Result<Arc<MqttSession>> {
        let identity = &self.identity;
        tracing::info!(
            blid = %identity.blid,
            ip = %identity.ip,
            port = identity.port,
            "Connecting to device"
        );

        let (client, mut event_loop) =
            AsyncClient::new(self.mqtt_options()?, self.settings.channel_capacity);
        let timeout = Duration::from_secs(self.settings.connect_timeout_secs);

        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(blid = %identity.blid, "Connection attempt cancelled");
                return Err(DeviceError::Cancelled);
            }
            result = tokio::time::timeout(timeout, wait_for_connack(&mut event_loop)) => {
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::error!(blid = %identity.blid, error = %e, "Connection failed");
                        return Err(e);
                    }
                    Err(_) => {
                        tracing::error!(blid = %identity.blid, "Connection timed out");
                        return Err(DeviceError::Timeout(format!(
                            "no connection acknowledgement from {}:{} within {}s",
                            identity.ip, identity.port, self.settings.connect_timeout_secs
                        )));
                    }
                }
            }
        }

        let session = MqttSession::new(&identity.blid, client, self.settings.channel_capacity);
        tokio::spawn(drive_event_loop(event_loop, Arc::clone(&session)));

        tracing::info!(blid = %identity.blid, "Connected to device");
        Ok(session)
    }
}

async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<()> {
    loop {
        match event_loop.poll().await? {
            Event::Incoming(Packet::ConnAck(ack)) => {
                if ack.code == ConnectReturnCode::Success {
                    return Ok(());
                }
                return Err(DeviceError::from(rumqttc::ConnectionError::ConnectionRefused(
                    ack.code,
                )));
            }
            other => {
                tracing::trace!(event = ?other, "Event before connection acknowledgement");
            }
        }
    }
}

impl SessionProvider for ConnectionManager {
    fn get_session<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Arc<dyn DeviceSession>>> {
        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            if self.is_disposed() {
                return Err(self.disposed_error());
            }
            if let Some(session) = self.live_session() {
                return Ok(session as Arc<dyn DeviceSession>);
            }

            let _guard = tokio::select! {
                _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
                guard = self.gate.lock() => guard,
            };

            if self.is_disposed() {
                return Err(self.disposed_error());
            }
            // Another caller may have connected while we waited on the gate.
            if let Some(session) = self.live_session() {
                return Ok(session as Arc<dyn DeviceSession>);
            }

            let session = {
                let _connecting = ConnectingGuard::enter(&self.connecting);
                self.connect(cancel).await?
            };
            if self.is_disposed() {
                session.close().await;
                return Err(self.disposed_error());
            }
            *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::clone(&session));
            Ok(session as Arc<dyn DeviceSession>)
        })
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .finish()
    }
}
