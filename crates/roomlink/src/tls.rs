//! TLS settings shared by every connection to a device.
//!
//! Devices present a self-signed certificate and only speak TLS 1.2 with an
//! RSA key exchange and a CBC cipher. Both the credential socket and the MQTT
//! session therefore go through the platform TLS stack with certificate and
//! hostname checks turned off.

use crate::error::Result;

/// Connector accepting the device's self-signed certificate over TLS 1.2.
pub fn device_connector() -> Result<native_tls::TlsConnector> {
    let connector = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .danger_accept_invalid_hostnames(true)
        .min_protocol_version(Some(native_tls::Protocol::Tlsv12))
        .max_protocol_version(Some(native_tls::Protocol::Tlsv12))
        .build()?;
    Ok(connector)
}
