//! Wi-Fi provisioning over the device's own access point.
//!
//! The sequence is a fixed pipeline of state messages. Steps run in order with
//! a pause in between; the first failing step aborts the rest.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::config::{MqttConfig, ProvisioningConfig};
use crate::control::publish_json;
use crate::control::SETTINGS_TOPIC;
use crate::credentials::WIFICTL_TOPIC;
use crate::devices::DeviceIdentity;
use crate::error::{DeviceError, Result};
use crate::session::{ConnectionManager, DeviceSession, SessionProvider};

/// Security mode sent with the credentials (WPA2-PSK).
pub const WPA2_PSK: u8 = 7;

/// First firmware generation that expects hex-encoded credentials.
pub const HEX_CREDENTIALS_FIRMWARE: u32 = 3;

/// What to configure on the device.
#[derive(Clone)]
pub struct WifiRequest {
    pub ssid: String,
    pub password: String,
    pub robot_name: Option<String>,
    /// IANA timezone name, e.g. `Europe/Paris`.
    pub timezone: Option<String>,
    /// Country code, e.g. `US`.
    pub country: Option<String>,
    /// Firmware major version, selects the credential encoding.
    pub firmware_version: u32,
}

impl WifiRequest {
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            ssid: ssid.into(),
            password: password.into(),
            robot_name: None,
            timezone: None,
            country: None,
            firmware_version: HEX_CREDENTIALS_FIRMWARE,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.ssid.is_empty() {
            return Err(DeviceError::Validation("ssid must not be empty".to_string()));
        }
        if self.firmware_version < 2 {
            return Err(DeviceError::Validation(format!(
                "unsupported firmware version {}",
                self.firmware_version
            )));
        }
        Ok(())
    }

    fn credentials(&self) -> WifiCredentials {
        let (ssid, pass) = if self.firmware_version >= HEX_CREDENTIALS_FIRMWARE {
            (hex::encode(&self.ssid), hex::encode(&self.password))
        } else {
            (self.ssid.clone(), self.password.clone())
        };
        WifiCredentials {
            sec: WPA2_PSK,
            ssid,
            pass,
        }
    }
}

impl std::fmt::Debug for WifiRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiRequest")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("robot_name", &self.robot_name)
            .field("timezone", &self.timezone)
            .field("country", &self.country)
            .field("firmware_version", &self.firmware_version)
            .finish()
    }
}

/// The `wlcfg` object.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct WifiCredentials {
    pub sec: u8,
    pub ssid: String,
    pub pass: String,
}

impl std::fmt::Debug for WifiCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WifiCredentials")
            .field("sec", &self.sec)
            .field("ssid", &self.ssid)
            .field("pass", &"<redacted>")
            .finish()
    }
}

/// One provisioning step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WifiStep {
    DeactivateWifi,
    SetUtcTime(i64),
    /// Offset in minutes.
    SetLocalTimeOffset(i32),
    SetTimezone(String),
    SetCountry(String),
    SetRobotName(String),
    SetCredentials(WifiCredentials),
    CheckSsid,
    ActivateWifi,
    GetNetworkInfo,
    DisableAccessPoint,
}

impl WifiStep {
    pub fn topic(&self) -> &'static str {
        match self {
            WifiStep::SetTimezone(_) | WifiStep::SetCountry(_) | WifiStep::SetRobotName(_) => {
                SETTINGS_TOPIC
            }
            _ => WIFICTL_TOPIC,
        }
    }

    /// The `{"state": {...}}` message for this step.
    pub fn payload(&self) -> Value {
        let state = match self {
            WifiStep::DeactivateWifi => json!({"wactivate": false}),
            WifiStep::SetUtcTime(secs) => json!({"utctime": secs}),
            WifiStep::SetLocalTimeOffset(minutes) => json!({"localtimeoffset": minutes}),
            WifiStep::SetTimezone(tz) => json!({"timezone": tz}),
            WifiStep::SetCountry(country) => json!({"country": country}),
            WifiStep::SetRobotName(name) => json!({"name": name}),
            WifiStep::SetCredentials(credentials) => json!({"wlcfg": credentials}),
            WifiStep::CheckSsid => json!({"chkssid": true}),
            WifiStep::ActivateWifi => json!({"wactivate": true}),
            WifiStep::GetNetworkInfo => json!({"get": "netinfo"}),
            WifiStep::DisableAccessPoint => json!({"uap": false}),
        };
        json!({ "state": state })
    }

    pub fn description(&self) -> String {
        match self {
            WifiStep::DeactivateWifi => "Deactivate Wi-Fi".to_string(),
            WifiStep::SetUtcTime(secs) => format!("Set UTC time: {}", secs),
            WifiStep::SetLocalTimeOffset(minutes) => {
                format!("Set local time offset: {} minutes", minutes)
            }
            WifiStep::SetTimezone(tz) => format!("Set timezone: {}", tz),
            WifiStep::SetCountry(country) => format!("Set country: {}", country),
            WifiStep::SetRobotName(name) => format!("Set robot name: {}", name),
            WifiStep::SetCredentials(_) => "Set Wi-Fi credentials".to_string(),
            WifiStep::CheckSsid => "Check SSID".to_string(),
            WifiStep::ActivateWifi => "Activate Wi-Fi".to_string(),
            WifiStep::GetNetworkInfo => "Get network info".to_string(),
            WifiStep::DisableAccessPoint => "Disable access point mode".to_string(),
        }
    }
}

/// Builds the sequence stamped with the current time and standard local offset.
pub fn build_sequence(request: &WifiRequest) -> Result<Vec<WifiStep>> {
    build_sequence_at(
        request,
        Utc::now().timestamp(),
        crate::credentials::local_base_offset_minutes(),
    )
}

/// Builds the sequence for a given time and UTC offset in minutes.
pub fn build_sequence_at(
    request: &WifiRequest,
    utc_time: i64,
    utc_offset_minutes: i32,
) -> Result<Vec<WifiStep>> {
    request.validate()?;

    let non_empty = |value: &Option<String>| value.clone().filter(|v| !v.is_empty());

    let mut steps = vec![
        WifiStep::DeactivateWifi,
        WifiStep::SetUtcTime(utc_time),
        WifiStep::SetLocalTimeOffset(utc_offset_minutes),
    ];
    if let Some(tz) = non_empty(&request.timezone) {
        steps.push(WifiStep::SetTimezone(tz));
    }
    if let Some(country) = non_empty(&request.country) {
        steps.push(WifiStep::SetCountry(country));
    }
    if let Some(name) = non_empty(&request.robot_name) {
        steps.push(WifiStep::SetRobotName(name));
    }
    steps.extend([
        WifiStep::SetCredentials(request.credentials()),
        WifiStep::CheckSsid,
        WifiStep::ActivateWifi,
        WifiStep::GetNetworkInfo,
        WifiStep::DisableAccessPoint,
    ]);
    Ok(steps)
}

/// Publishes each step in order, pausing `step_delay` between steps.
pub async fn execute_sequence(
    session: &dyn DeviceSession,
    steps: &[WifiStep],
    step_delay: Duration,
    cancel: &CancellationToken,
) -> Result<()> {
    for (index, step) in steps.iter().enumerate() {
        if index > 0 {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
                _ = tokio::time::sleep(step_delay) => {}
            }
        }

        tracing::info!(step = index + 1, total = steps.len(), "{}", step.description());
        publish_json(session, step.topic(), &step.payload(), cancel)
            .await
            .map_err(|source| DeviceError::WifiStep {
                index,
                description: step.description(),
                source: Box::new(source),
            })?;
    }
    Ok(())
}

/// Configures Wi-Fi on a device reachable on its own access point.
pub struct WifiProvisioner {
    provisioning: ProvisioningConfig,
    mqtt: MqttConfig,
}

impl WifiProvisioner {
    pub fn new(provisioning: ProvisioningConfig, mqtt: MqttConfig) -> Self {
        Self { provisioning, mqtt }
    }

    /// Connects to the access-point address with the device's credentials,
    /// runs the sequence and always disconnects afterwards.
    pub async fn configure(
        &self,
        identity: &DeviceIdentity,
        request: &WifiRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let steps = build_sequence(request)?;
        let ap_identity = DeviceIdentity::new(
            identity.blid.clone(),
            self.provisioning.ap_address.clone(),
            self.provisioning.ap_port,
            identity.password.clone(),
        );

        tracing::info!(
            blid = %identity.blid,
            ap = %self.provisioning.ap_address,
            ssid = %request.ssid,
            "Starting Wi-Fi configuration"
        );

        let manager = ConnectionManager::new(ap_identity, self.mqtt.clone());
        let result = async {
            let session = manager.get_session(cancel).await?;
            execute_sequence(
                session.as_ref(),
                &steps,
                Duration::from_millis(self.provisioning.step_delay_ms),
                cancel,
            )
            .await
        }
        .await;
        manager.close().await;

        match &result {
            Ok(()) => tracing::info!(blid = %identity.blid, "Wi-Fi configuration sent"),
            Err(e) if e.is_cancelled() => tracing::debug!("Wi-Fi configuration cancelled"),
            Err(e) => tracing::error!(blid = %identity.blid, error = %e, "Wi-Fi configuration failed"),
        }
        result
    }
}
