//! Credential lookup by device id.
//!
//! Persisting credentials is the job of whoever embeds this crate. The
//! registry only needs a way to resolve a blid to a [`DeviceIdentity`].

use std::collections::HashMap;
use std::sync::RwLock;

use super::DeviceIdentity;
use crate::error::{DeviceError, Result};

/// Resolves a device id to its current address and credentials.
#[allow(async_fn_in_trait)]
pub trait CredentialStore: Send + Sync {
    /// Looks up the identity stored for `blid`.
    ///
    /// Returns [`DeviceError::NotFound`] when nothing is stored.
    async fn lookup(&self, blid: &str) -> Result<DeviceIdentity>;
}

/// In-memory credential store.
#[derive(Debug, Default)]
pub struct StaticCredentialStore {
    identities: RwLock<HashMap<String, DeviceIdentity>>,
}

impl StaticCredentialStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding the given identities.
    pub fn with_identities(identities: impl IntoIterator<Item = DeviceIdentity>) -> Self {
        let store = Self::new();
        for identity in identities {
            store.insert(identity);
        }
        store
    }

    /// Adds or replaces the identity for its blid.
    ///
    /// Returns the identity that was stored before, if any.
    pub fn insert(&self, identity: DeviceIdentity) -> Option<DeviceIdentity> {
        self.identities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(identity.blid.clone(), identity)
    }

    /// Removes the identity for `blid`.
    pub fn remove(&self, blid: &str) -> Option<DeviceIdentity> {
        self.identities
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(blid)
    }

    /// Number of stored identities.
    pub fn len(&self) -> usize {
        self.identities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Returns true if no identities are stored.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CredentialStore for StaticCredentialStore {
    async fn lookup(&self, blid: &str) -> Result<DeviceIdentity> {
        self.identities
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(blid)
            .cloned()
            .ok_or_else(|| DeviceError::NotFound(blid.to_string()))
    }
}
