//! # Roomlink Library
//!
//! Local-network connectivity and control for robot vacuums that speak an
//! MQTT-based telemetry protocol plus a proprietary provisioning handshake.
//!
//! ## Overview
//!
//! - **Discovery**: UDP broadcast discovery of devices on the LAN
//! - **Credentials**: password retrieval and first-time password provisioning
//!   over a raw TLS socket
//! - **Sessions**: one lazily-connected MQTT session per device
//! - **Control**: typed commands and settings published on the device's topics
//! - **Status**: deep-merged shadow state fanned out to any number of consumers
//! - **Wi-Fi**: the ordered provisioning sequence run over the device's own
//!   access point
//! - **Devices**: a registry caching one client bundle per device identity
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       Device Registry                        │
//! │  ┌──────────────────────────────────────────────────────┐    │
//! │  │ DeviceClient (per blid)                              │    │
//! │  │  ConnectionManager ─► Command / Settings publishers  │    │
//! │  │         │                                            │    │
//! │  │         └──────────► DeviceSubscriber ─► Status      │    │
//! │  │                                         Synchronizer │    │
//! │  └──────────────────────────────────────────────────────┘    │
//! └──────────────────────────────────────────────────────────────┘
//!   DiscoveryClient      CredentialClient      WifiProvisioner
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use roomlink::{Config, DeviceRegistry, StaticCredentialStore};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let store = StaticCredentialStore::with_identities([config.device_identity()]);
//!     let registry = DeviceRegistry::new(store, config.mqtt.clone());
//!
//!     let cancel = CancellationToken::new();
//!     let client = registry.get_client(&config.device.blid, &cancel).await?;
//!     client.commands().execute_named("dock", &cancel).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`credentials`]: Credential protocol client
//! - [`discovery`]: Broadcast discovery client
//! - [`session`]: Session traits and the MQTT connection manager
//! - [`control`]: Command and setting publishers
//! - [`status`]: Topic subscriptions and the shadow-state synchronizer
//! - [`tls`]: TLS connector shared by device connections
//! - [`wifi`]: Wi-Fi provisioning sequence
//! - [`devices`]: Device identity, credential store and client registry
//! - [`error`]: Error types

pub mod config;
pub mod control;
pub mod credentials;
pub mod devices;
pub mod discovery;
pub mod error;
pub mod session;
pub mod status;
pub mod tls;
pub mod wifi;

#[cfg(test)]
mod testing;

// Re-export protocol for convenience
pub use protocol;

pub use config::Config;
pub use control::{BatchMode, BatchReport, Command, CommandPublisher, Setting, SettingsPublisher};
pub use credentials::{CredentialClient, SetPasswordRequest};
pub use devices::{
    CredentialStore, DeviceClient, DeviceIdentity, DeviceRegistry, StaticCredentialStore,
};
pub use discovery::{DiscoveryClient, DiscoveryCollector};
pub use error::{DeviceError, Result};
pub use session::{
    ConnectionManager, ConnectionState, DeviceSession, InboundMessage, SessionProvider,
    SubscriptionOptions,
};
pub use status::{DeviceSubscriber, StatusSubscription, StatusSynchronizer, StatusUpdate};
pub use wifi::{WifiProvisioner, WifiRequest, WifiStep};
