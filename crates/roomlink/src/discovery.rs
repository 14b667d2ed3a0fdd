//! UDP broadcast discovery of devices on the local network.
//!
//! The client broadcasts the discovery payload a few times while listening for
//! JSON descriptors. The listening window ending is the normal way a discovery
//! run finishes.

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use protocol::{DeviceDescriptor, DISCOVERY_PAYLOAD};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::error::{DeviceError, Result};

/// Largest datagram accepted from a device.
const MAX_DATAGRAM: usize = 4096;

/// Collects unique descriptors from raw datagrams.
#[derive(Debug, Default)]
pub struct DiscoveryCollector {
    seen: HashSet<String>,
    devices: Vec<DeviceDescriptor>,
}

impl DiscoveryCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one datagram. Returns true when it produced a new device.
    ///
    /// Echoes of the discovery payload and malformed datagrams are skipped.
    /// A descriptor without an `ip` takes the sender's address.
    pub fn offer(&mut self, data: &[u8], from: SocketAddr) -> bool {
        if data == DISCOVERY_PAYLOAD {
            tracing::trace!(from = %from, "Ignoring discovery broadcast echo");
            return false;
        }

        let mut descriptor = match DeviceDescriptor::from_datagram(data) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                tracing::warn!(
                    from = %from,
                    error = %e,
                    datagram = %String::from_utf8_lossy(data),
                    "Skipping malformed discovery reply"
                );
                return false;
            }
        };

        if descriptor.ip.is_empty() {
            descriptor.ip = from.ip().to_string();
        }
        if !self.seen.insert(descriptor.ip.clone()) {
            return false;
        }

        tracing::info!(
            name = %descriptor.robot_name,
            hostname = %descriptor.hostname,
            ip = %descriptor.ip,
            sku = %descriptor.sku,
            "Discovered device"
        );
        self.devices.push(descriptor);
        true
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Devices in the order they first answered.
    pub fn into_devices(self) -> Vec<DeviceDescriptor> {
        self.devices
    }
}

/// Broadcast discovery client.
#[derive(Debug, Clone)]
pub struct DiscoveryClient {
    settings: DiscoveryConfig,
}

impl DiscoveryClient {
    pub fn new(settings: DiscoveryConfig) -> Self {
        Self { settings }
    }

    fn target(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.settings.broadcast_address.parse().map_err(|_| {
            DeviceError::Validation(format!(
                "invalid broadcast address: {}",
                self.settings.broadcast_address
            ))
        })?;
        Ok(SocketAddr::new(ip, self.settings.port))
    }

    /// Discover devices for `timeout` and return every unique descriptor seen.
    ///
    /// Running out of time is the expected outcome and returns whatever was
    /// collected. Cancellation returns [`DeviceError::Cancelled`].
    pub async fn discover(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceDescriptor>> {
        let target = self.target()?;
        let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)).await?;
        socket.set_broadcast(true)?;

        tracing::info!(target = %target, timeout_secs = timeout.as_secs(), "Starting discovery");

        let (sent, collected) = tokio::join!(
            self.send_broadcasts(&socket, target, cancel),
            receive_replies(&socket, timeout, cancel),
        );
        let collector = collected?;

        if sent == 0 && self.settings.attempts > 0 {
            return Err(DeviceError::Transport(format!(
                "could not send discovery broadcast to {}",
                target
            )));
        }

        tracing::info!(count = collector.len(), "Discovery completed");
        Ok(collector.into_devices())
    }

    /// Sends the payload `attempts` times; returns how many sends succeeded.
    async fn send_broadcasts(
        &self,
        socket: &UdpSocket,
        target: SocketAddr,
        cancel: &CancellationToken,
    ) -> u32 {
        let interval = Duration::from_millis(self.settings.send_interval_ms);
        let mut sent = 0;

        for attempt in 1..=self.settings.attempts {
            match socket.send_to(DISCOVERY_PAYLOAD, target).await {
                Ok(_) => {
                    sent += 1;
                    tracing::debug!(attempt, "Discovery broadcast sent");
                }
                Err(e) => tracing::warn!(attempt, error = %e, "Discovery broadcast failed"),
            }

            if attempt < self.settings.attempts {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }
        sent
    }
}

async fn receive_replies(
    socket: &UdpSocket,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<DiscoveryCollector> {
    let deadline = tokio::time::Instant::now() + timeout;
    let mut collector = DiscoveryCollector::new();
    let mut buf = vec![0u8; MAX_DATAGRAM];

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!("Discovery cancelled");
                return Err(DeviceError::Cancelled);
            }
            _ = tokio::time::sleep_until(deadline) => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, from)) => {
                    collector.offer(&buf[..len], from);
                }
                Err(e) => tracing::warn!(error = %e, "Discovery receive failed"),
            },
        }
    }

    Ok(collector)
}
