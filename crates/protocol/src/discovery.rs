//! UDP discovery wire types.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Payload broadcast to ask devices on the LAN to announce themselves.
pub const DISCOVERY_PAYLOAD: &[u8] = b"irobotmcs";

/// UDP port devices listen on for discovery broadcasts.
pub const DISCOVERY_PORT: u16 = 5678;

/// Descriptor a device sends back in answer to a discovery broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DeviceDescriptor {
    /// Network hostname, `Roomba-<BLID>` or `iRobot-<BLID>`.
    #[serde(default)]
    pub hostname: String,
    /// User-facing name of the robot.
    #[serde(default, rename = "robotname")]
    pub robot_name: String,
    /// LAN address the device answered from.
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub mac: String,
    /// Firmware version string, e.g. `v2.4.6-3` or `3.20.7`.
    #[serde(default, rename = "sw")]
    pub software_version: String,
    #[serde(default)]
    pub sku: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nc: Option<i64>,
    /// Cloud protocol the device speaks (`mqtt` on current firmware).
    #[serde(default, rename = "proto")]
    pub protocol_version: String,
    /// Capability flags advertised by the firmware.
    #[serde(default, rename = "cap", skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<HashMap<String, i64>>,
}

impl DeviceDescriptor {
    /// Parse a descriptor from a raw discovery datagram.
    pub fn from_datagram(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    /// Device identifier taken from the hostname suffix after the first `-`.
    ///
    /// Empty when the hostname has no dash.
    pub fn blid(&self) -> &str {
        self.hostname
            .split_once('-')
            .map(|(_, blid)| blid)
            .unwrap_or("")
    }

    /// Major firmware version, if the software version string carries one.
    ///
    /// Accepts both `v2.4.6-3` and `3.20.7` style strings.
    pub fn firmware_major(&self) -> Option<u32> {
        self.software_version
            .trim_start_matches(['v', 'V'])
            .split(|c: char| !c.is_ascii_digit())
            .next()
            .and_then(|major| major.parse().ok())
    }
}
