//! Per-device client bundles.
//!
//! The registry hands out one [`DeviceClient`] per blid. A bundle is reused as
//! long as the stored identity is unchanged; any change in address or
//! credentials disposes the old bundle and builds a new one.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::store::CredentialStore;
use super::DeviceIdentity;
use crate::config::MqttConfig;
use crate::control::{CommandPublisher, SettingsPublisher};
use crate::error::{DeviceError, Result};
use crate::session::{ConnectionManager, ConnectionState, SessionProvider};
use crate::status::{DeviceSubscriber, StatusSubscription, StatusSynchronizer};

/// Connection, publishers and status subscription for one device.
pub struct DeviceClient {
    identity: DeviceIdentity,
    connection: Arc<ConnectionManager>,
    commands: CommandPublisher,
    settings: SettingsPublisher,
    subscriber: DeviceSubscriber,
    status: Arc<StatusSynchronizer>,
    last_used: StdMutex<DateTime<Utc>>,
}

impl DeviceClient {
    /// Assembles a bundle around a fresh, unconnected connection manager.
    pub fn new(
        identity: DeviceIdentity,
        mqtt: &MqttConfig,
        status: Arc<StatusSynchronizer>,
    ) -> Self {
        let connection = Arc::new(ConnectionManager::new(identity.clone(), mqtt.clone()));
        let provider: Arc<dyn SessionProvider> = connection.clone();
        let subscriber = DeviceSubscriber::new(
            provider.clone(),
            connection.create_subscription(mqtt.subscription_topic.clone()),
        );

        Self {
            identity,
            commands: CommandPublisher::new(provider.clone()),
            settings: SettingsPublisher::new(provider),
            subscriber,
            connection,
            status,
            last_used: StdMutex::new(Utc::now()),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn blid(&self) -> &str {
        &self.identity.blid
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn commands(&self) -> &CommandPublisher {
        &self.commands
    }

    pub fn settings(&self) -> &SettingsPublisher {
        &self.settings
    }

    /// Raw topic subscriber bound to this device's connection.
    pub fn subscriber(&self) -> &DeviceSubscriber {
        &self.subscriber
    }

    /// When the registry last handed this bundle out.
    pub fn last_used(&self) -> DateTime<Utc> {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(|e| e.into_inner()) = Utc::now();
    }

    /// Last merged status plus live updates for this device.
    pub async fn subscribe_status(&self, cancel: &CancellationToken) -> Result<StatusSubscription> {
        self.status
            .get_subscription(&self.identity.blid, &self.subscriber, cancel)
            .await
    }

    async fn dispose(&self) {
        self.status.forget(&self.identity.blid).await;
        self.connection.dispose().await;
    }
}

impl std::fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClient")
            .field("identity", &self.identity)
            .field("state", &self.state())
            .field("last_used", &self.last_used())
            .finish()
    }
}

/// Lookup-or-create cache of device bundles keyed by blid.
pub struct DeviceRegistry<S: CredentialStore> {
    store: S,
    mqtt: MqttConfig,
    status: Arc<StatusSynchronizer>,
    clients: Mutex<HashMap<String, Arc<DeviceClient>>>,
}

impl<S: CredentialStore> DeviceRegistry<S> {
    pub fn new(store: S, mqtt: MqttConfig) -> Self {
        let status = Arc::new(StatusSynchronizer::new(mqtt.channel_capacity));
        Self {
            store,
            mqtt,
            status,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The credential store identities are resolved from.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Shared synchronizer used by every bundle.
    pub fn status(&self) -> &Arc<StatusSynchronizer> {
        &self.status
    }

    /// Returns the bundle for `blid`, building or rebuilding it as needed.
    ///
    /// A missing credential surfaces as [`DeviceError::NotFound`].
    pub async fn get_client(
        &self,
        blid: &str,
        cancel: &CancellationToken,
    ) -> Result<Arc<DeviceClient>> {
        let identity = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            identity = self.store.lookup(blid) => identity?,
        };

        let mut clients = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            guard = self.clients.lock() => guard,
        };

        if let Some(existing) = clients.get(blid) {
            if existing.identity == identity {
                existing.touch();
                return Ok(Arc::clone(existing));
            }
        }

        if let Some(stale) = clients.remove(blid) {
            tracing::info!(blid = %blid, "Device identity changed, replacing client");
            stale.dispose().await;
        }

        let client = Arc::new(DeviceClient::new(
            identity,
            &self.mqtt,
            Arc::clone(&self.status),
        ));
        clients.insert(blid.to_string(), Arc::clone(&client));
        tracing::debug!(blid = %blid, "Created device client");
        Ok(client)
    }

    /// Disposes and evicts the bundle for `blid`. Returns whether one existed.
    pub async fn remove_client(&self, blid: &str) -> bool {
        let removed = self.clients.lock().await.remove(blid);
        match removed {
            Some(client) => {
                client.dispose().await;
                tracing::info!(blid = %blid, "Removed device client");
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    pub async fn contains(&self, blid: &str) -> bool {
        self.clients.lock().await.contains_key(blid)
    }

    /// Disposes every bundle.
    pub async fn clear(&self) {
        let drained: Vec<_> = self.clients.lock().await.drain().collect();
        for (_, client) in drained {
            client.dispose().await;
        }
    }
}
