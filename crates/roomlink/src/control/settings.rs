//! Setting publisher for the `delta` topic.
//!
//! Each setting is a desired-state fragment `{"state": {<key>: <value>}}`.
//! Values are validated before a session is requested.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use super::publish_json;
use crate::error::{DeviceError, Result};
use crate::session::SessionProvider;

/// Topic settings are published to.
pub const SETTINGS_TOPIC: &str = "delta";

pub const CHILD_LOCK_KEY: &str = "childLock";
pub const BIN_PAUSE_KEY: &str = "binPause";
pub const TWO_PASS_KEY: &str = "twoPass";
pub const NO_AUTO_PASSES_KEY: &str = "noAutoPasses";
pub const RANK_OVERLAP_KEY: &str = "rankOverlap";
pub const PAD_WETNESS_KEY: &str = "padWetness";
pub const CHARGING_LIGHT_KEY: &str = "chrgLrPtrn";

/// Largest accepted rank overlap percentage.
pub const MAX_RANK_OVERLAP: u8 = 100;

/// Cleaning pass strategy, sent as two boolean deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleaningPasses {
    OnePass,
    TwoPass,
    /// Let the device choose based on room size.
    RoomSizeClean,
}

impl CleaningPasses {
    /// Values for `twoPass` and `noAutoPasses`.
    pub fn flags(self) -> (bool, bool) {
        match self {
            CleaningPasses::OnePass => (false, true),
            CleaningPasses::TwoPass => (true, true),
            CleaningPasses::RoomSizeClean => (false, false),
        }
    }

    /// Maps the numeric form (1, 2, 3) used by user-facing surfaces.
    pub fn from_number(value: u8) -> Result<Self> {
        match value {
            1 => Ok(CleaningPasses::OnePass),
            2 => Ok(CleaningPasses::TwoPass),
            3 => Ok(CleaningPasses::RoomSizeClean),
            other => Err(DeviceError::Validation(format!(
                "cleaning passes must be 1, 2 or 3, got {}",
                other
            ))),
        }
    }
}

/// Mopping pad wetness level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PadWetness {
    Eco = 1,
    Standard = 2,
    Ultra = 3,
}

impl PadWetness {
    pub fn from_number(value: u8) -> Result<Self> {
        match value {
            1 => Ok(PadWetness::Eco),
            2 => Ok(PadWetness::Standard),
            3 => Ok(PadWetness::Ultra),
            other => Err(DeviceError::Validation(format!(
                "pad wetness must be between 1 and 3, got {}",
                other
            ))),
        }
    }
}

/// Dock light behavior while charging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChargingLightPattern {
    DockingAndCharging = 0,
    DockingOnly = 1,
    NoLights = 2,
}

impl ChargingLightPattern {
    pub fn from_number(value: u8) -> Result<Self> {
        match value {
            0 => Ok(ChargingLightPattern::DockingAndCharging),
            1 => Ok(ChargingLightPattern::DockingOnly),
            2 => Ok(ChargingLightPattern::NoLights),
            other => Err(DeviceError::Validation(format!(
                "charging light pattern must be between 0 and 2, got {}",
                other
            ))),
        }
    }
}

/// A single setting change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setting {
    ChildLock(bool),
    BinPause(bool),
    CleaningPasses(CleaningPasses),
    /// Overlap between cleaning ranks, in percent.
    RankOverlap(u8),
    PadWetness(PadWetness),
    ChargingLight(ChargingLightPattern),
}

impl Setting {
    /// Checks value ranges. Called before any I/O.
    pub fn validate(&self) -> Result<()> {
        if let Setting::RankOverlap(value) = self {
            if *value > MAX_RANK_OVERLAP {
                return Err(DeviceError::Validation(format!(
                    "rank overlap must be between 0 and {}, got {}",
                    MAX_RANK_OVERLAP, value
                )));
            }
        }
        Ok(())
    }

    /// Key/value deltas in publish order.
    pub fn deltas(&self) -> Vec<(&'static str, Value)> {
        match *self {
            Setting::ChildLock(enable) => vec![(CHILD_LOCK_KEY, json!(enable))],
            Setting::BinPause(enable) => vec![(BIN_PAUSE_KEY, json!(enable))],
            Setting::CleaningPasses(passes) => {
                let (two_pass, no_auto_passes) = passes.flags();
                vec![
                    (TWO_PASS_KEY, json!(two_pass)),
                    (NO_AUTO_PASSES_KEY, json!(no_auto_passes)),
                ]
            }
            Setting::RankOverlap(value) => vec![(RANK_OVERLAP_KEY, json!(value))],
            Setting::PadWetness(level) => {
                let level = level as u8;
                vec![(
                    PAD_WETNESS_KEY,
                    json!({"disposable": level, "reusable": level}),
                )]
            }
            Setting::ChargingLight(pattern) => vec![(CHARGING_LIGHT_KEY, json!(pattern as u8))],
        }
    }
}

/// JSON body published on the `delta` topic.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingPayload {
    pub state: serde_json::Map<String, Value>,
}

impl SettingPayload {
    pub fn new(key: &str, value: Value) -> Self {
        let mut state = serde_json::Map::new();
        state.insert(key.to_string(), value);
        Self { state }
    }
}

/// Publishes setting changes to one device.
#[derive(Clone)]
pub struct SettingsPublisher {
    provider: Arc<dyn SessionProvider>,
}

impl SettingsPublisher {
    pub fn new(provider: Arc<dyn SessionProvider>) -> Self {
        Self { provider }
    }

    /// Validates and publishes a setting.
    ///
    /// Multi-key settings are sent as consecutive deltas on the same session.
    pub async fn apply(&self, setting: Setting, cancel: &CancellationToken) -> Result<()> {
        setting.validate()?;

        let session = self.provider.get_session(cancel).await?;
        for (key, value) in setting.deltas() {
            tracing::info!(setting = key, value = %value, "Publishing setting");
            publish_json(
                session.as_ref(),
                SETTINGS_TOPIC,
                &SettingPayload::new(key, value),
                cancel,
            )
            .await?;
        }
        tracing::info!(setting = ?setting, "Setting applied");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingProvider;

    fn bodies(provider: &RecordingProvider) -> Vec<Value> {
        provider
            .session
            .published()
            .into_iter()
            .map(|(topic, body)| {
                assert_eq!(topic, "delta");
                serde_json::from_slice(&body).unwrap()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_child_lock_payload() {
        let provider = RecordingProvider::new();
        let publisher = SettingsPublisher::new(provider.clone());

        publisher
            .apply(Setting::ChildLock(true), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bodies(&provider), [json!({"state": {"childLock": true}})]);
    }

    #[tokio::test]
    async fn test_cleaning_passes_sends_two_deltas() {
        let provider = RecordingProvider::new();
        let publisher = SettingsPublisher::new(provider.clone());

        publisher
            .apply(
                Setting::CleaningPasses(CleaningPasses::OnePass),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            bodies(&provider),
            [
                json!({"state": {"twoPass": false}}),
                json!({"state": {"noAutoPasses": true}}),
            ]
        );
    }

    #[test]
    fn test_cleaning_pass_flags() {
        assert_eq!(CleaningPasses::OnePass.flags(), (false, true));
        assert_eq!(CleaningPasses::TwoPass.flags(), (true, true));
        assert_eq!(CleaningPasses::RoomSizeClean.flags(), (false, false));
        assert!(CleaningPasses::from_number(4).is_err());
    }

    #[tokio::test]
    async fn test_pad_wetness_payload() {
        let provider = RecordingProvider::new();
        let publisher = SettingsPublisher::new(provider.clone());

        publisher
            .apply(
                Setting::PadWetness(PadWetness::Ultra),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            bodies(&provider),
            [json!({"state": {"padWetness": {"disposable": 3, "reusable": 3}}})]
        );
    }

    #[tokio::test]
    async fn test_charging_light_payload() {
        let provider = RecordingProvider::new();
        let publisher = SettingsPublisher::new(provider.clone());

        publisher
            .apply(
                Setting::ChargingLight(ChargingLightPattern::NoLights),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(bodies(&provider), [json!({"state": {"chrgLrPtrn": 2}})]);
    }

    #[tokio::test]
    async fn test_rank_overlap_out_of_range_rejected_before_connect() {
        let provider = RecordingProvider::new();
        let publisher = SettingsPublisher::new(provider.clone());

        let result = publisher
            .apply(Setting::RankOverlap(101), &CancellationToken::new())
            .await;

        assert!(matches!(result, Err(DeviceError::Validation(_))));
        assert_eq!(provider.session_requests(), 0);

        publisher
            .apply(Setting::RankOverlap(100), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(bodies(&provider), [json!({"state": {"rankOverlap": 100}})]);
    }

    #[test]
    fn test_numeric_ranges() {
        assert!(PadWetness::from_number(0).is_err());
        assert_eq!(PadWetness::from_number(2).unwrap(), PadWetness::Standard);
        assert!(ChargingLightPattern::from_number(3).is_err());
        assert_eq!(
            ChargingLightPattern::from_number(1).unwrap(),
            ChargingLightPattern::DockingOnly
        );
    }
}
