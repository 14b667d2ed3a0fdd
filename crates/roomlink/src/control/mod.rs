//! Command and setting publishers.
//!
//! Both publishers are stateless: every call asks the session provider for the
//! live session, serializes a typed payload and publishes it at QoS 0.

pub mod commands;
pub mod settings;

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::error::{DeviceError, Result};
use crate::session::DeviceSession;

/// Serializes `payload` to JSON and publishes it, aborting on cancellation.
pub(crate) async fn publish_json<T: Serialize>(
    session: &dyn DeviceSession,
    topic: &str,
    payload: &T,
    cancel: &CancellationToken,
) -> Result<()> {
    let body = serde_json::to_vec(payload)?;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(DeviceError::Cancelled),
        result = session.publish(topic, body) => result,
    }
}

pub use commands::{
    BatchMode, BatchReport, Command, CommandPayload, CommandPublisher, CommandResult,
    COMMAND_TOPIC,
};
pub use settings::{
    ChargingLightPattern, CleaningPasses, PadWetness, Setting, SettingPayload, SettingsPublisher,
    SETTINGS_TOPIC,
};
