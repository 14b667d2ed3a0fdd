//! Device identity, credential lookup and the per-device client registry.

pub mod registry;
pub mod store;

/// Address and credentials of one device.
///
/// Two identities are equal only when every field matches. The registry uses
/// that to decide whether a cached client can be reused.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    /// Stable device identifier, also the MQTT client id and username.
    pub blid: String,
    pub ip: String,
    pub port: u16,
    pub password: String,
}

impl DeviceIdentity {
    pub fn new(
        blid: impl Into<String>,
        ip: impl Into<String>,
        port: u16,
        password: impl Into<String>,
    ) -> Self {
        Self {
            blid: blid.into(),
            ip: ip.into(),
            port,
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for DeviceIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceIdentity")
            .field("blid", &self.blid)
            .field("ip", &self.ip)
            .field("port", &self.port)
            .field("password", &"<redacted>")
            .finish()
    }
}

pub use registry::{DeviceClient, DeviceRegistry};
pub use store::{CredentialStore, StaticCredentialStore};
