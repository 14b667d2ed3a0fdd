//! Topic subscription for one device.

use std::sync::Arc;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{DeviceError, Result};
use crate::session::{DeviceSession, InboundMessage, SessionProvider, SubscriptionOptions};

/// Subscribes to a device's topics over its session.
#[derive(Clone)]
pub struct DeviceSubscriber {
    provider: Arc<dyn SessionProvider>,
    options: SubscriptionOptions,
}

impl DeviceSubscriber {
    pub fn new(provider: Arc<dyn SessionProvider>, options: SubscriptionOptions) -> Self {
        Self { provider, options }
    }

    /// The topic filter this subscriber uses.
    pub fn topic(&self) -> &str {
        &self.options.topic
    }

    /// Subscribes and returns the session plus a receiver for its messages.
    ///
    /// The receiver is created before the subscribe request so that nothing
    /// the device sends in reply is missed.
    pub async fn subscribe(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Arc<dyn DeviceSession>, broadcast::Receiver<InboundMessage>)> {
        let session = self.provider.get_session(cancel).await?;
        let messages = session.messages();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
            result = session.subscribe(&self.options) => result?,
        }

        Ok((session, messages))
    }

    /// Topic-relay mode: the raw message stream without any merging.
    pub async fn subscribe_raw(
        &self,
        cancel: &CancellationToken,
    ) -> Result<broadcast::Receiver<InboundMessage>> {
        let (_, messages) = self.subscribe(cancel).await?;
        Ok(messages)
    }
}
