//! MQTT session with a device using rumqttc.
//!
//! The transport is configured by the connection manager with the shared
//! device connector from [`crate::tls`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use super::{BoxFuture, DeviceSession, InboundMessage, SubscriptionOptions};
use crate::error::{DeviceError, Result};

/// One connected MQTT session with a device.
///
/// The event loop runs in a separate driver task (see [`drive_event_loop`]).
/// Inbound publishes are fanned out on a broadcast channel whose sender is
/// dropped when the driver stops, so receivers observe the disconnect.
pub struct MqttSession {
    blid: String,
    client: AsyncClient,
    inbound: Mutex<Option<broadcast::Sender<InboundMessage>>>,
    connected: AtomicBool,
    shutdown: CancellationToken,
}

impl MqttSession {
    /// Wraps a client whose event loop has already received a successful CONNACK.
    pub fn new(blid: impl Into<String>, client: AsyncClient, capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Arc::new(Self {
            blid: blid.into(),
            client,
            inbound: Mutex::new(Some(tx)),
            connected: AtomicBool::new(true),
            shutdown: CancellationToken::new(),
        })
    }

    /// The device this session belongs to.
    pub fn blid(&self) -> &str {
        &self.blid
    }

    fn forward(&self, message: InboundMessage) {
        let guard = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(tx) = guard.as_ref() {
            // No receivers is fine: nobody is listening yet.
            let _ = tx.send(message);
        }
    }

    fn mark_closed(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Sends DISCONNECT and stops the driver task.
    pub async fn close(&self) {
        if self.connected.load(Ordering::SeqCst) {
            if let Err(e) = self.client.disconnect().await {
                tracing::debug!(blid = %self.blid, error = %e, "Disconnect request failed");
            }
        }
        self.shutdown.cancel();
        self.mark_closed();
    }
}

impl DeviceSession for MqttSession {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(DeviceError::Transport("session is disconnected".to_string()));
            }
            tracing::debug!(blid = %self.blid, topic = %topic, bytes = payload.len(), "Publishing");
            self.client
                .publish(topic, QoS::AtMostOnce, false, payload)
                .await?;
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, options: &'a SubscriptionOptions) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if !self.is_connected() {
                return Err(DeviceError::Transport("session is disconnected".to_string()));
            }
            self.client.subscribe(options.topic.as_str(), options.qos).await?;
            tracing::info!(blid = %self.blid, topic = %options.topic, "Subscribed");
            Ok(())
        })
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        let guard = self.inbound.lock().unwrap_or_else(|e| e.into_inner());
        match guard.as_ref() {
            Some(tx) => tx.subscribe(),
            None => {
                // Receiver on a channel whose sender is already gone reports Closed.
                let (_, rx) = broadcast::channel(1);
                rx
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// Polls the event loop until the connection fails or the session is closed.
///
/// Runs as a spawned task per session. Every inbound publish is forwarded to
/// the session's broadcast channel in arrival order.
pub async fn drive_event_loop(mut event_loop: EventLoop, session: Arc<MqttSession>) {
    let shutdown = session.shutdown.clone();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::debug!(blid = %session.blid, "Event loop driver stopped");
                break;
            }
            event = event_loop.poll() => match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    tracing::trace!(
                        blid = %session.blid,
                        topic = %publish.topic,
                        bytes = publish.payload.len(),
                        "Inbound publish"
                    );
                    session.forward(InboundMessage::new(publish.topic, publish.payload.to_vec()));
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    tracing::info!(blid = %session.blid, "Device closed the session");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    if !shutdown.is_cancelled() {
                        tracing::warn!(blid = %session.blid, error = %e, "Session dropped");
                    }
                    break;
                }
            }
        }
    }

    session.mark_closed();
}
