//! Integration tests for the device-facing flows.
//!
//! These tests drive the public API against in-process fakes:
//! - Discovery against a loopback UDP responder
//! - Credential exchanges against an in-memory device stream
//! - Registry bundles built from a configuration file

use std::sync::Arc;
use std::time::Duration;

use protocol::framing::split_frame;
use protocol::{ProtocolError, DISCOVERY_FRAME, DISCOVERY_PAYLOAD};
use roomlink::config::{Config, DiscoveryConfig};
use roomlink::credentials::{get_password_over, set_password_over};
use roomlink::status::merge::apply_update;
use roomlink::{
    DeviceError, DeviceRegistry, DiscoveryClient, SetPasswordRequest, StaticCredentialStore,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const DESCRIPTOR: &str = r#"{"ver":"3","hostname":"Roomba-3143C50021234567","robotname":"Kitchen","ip":"192.168.1.42","mac":"70:66:55:01:02:03","sw":"v2.4.16-126","sku":"R981040","nc":0,"proto":"mqtt","cap":{"pose":1}}"#;

// =============================================================================
// Discovery
// =============================================================================

/// Answers every discovery request with an echo, a malformed reply and the same
/// descriptor twice.
async fn spawn_responder() -> u16 {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = socket.local_addr().unwrap().port();

    tokio::spawn(async move {
        let mut buf = [0u8; 64];
        loop {
            let Ok((len, from)) = socket.recv_from(&mut buf).await else {
                return;
            };
            if &buf[..len] != DISCOVERY_PAYLOAD {
                continue;
            }
            let _ = socket.send_to(DISCOVERY_PAYLOAD, from).await;
            let _ = socket.send_to(b"{\"hostname\":", from).await;
            let _ = socket.send_to(DESCRIPTOR.as_bytes(), from).await;
            let _ = socket.send_to(DESCRIPTOR.as_bytes(), from).await;
        }
    });

    port
}

#[tokio::test]
async fn test_discovery_over_loopback_dedupes_and_skips_noise() {
    let port = spawn_responder().await;
    let client = DiscoveryClient::new(DiscoveryConfig {
        port,
        broadcast_address: "127.0.0.1".to_string(),
        attempts: 3,
        send_interval_ms: 10,
        timeout_secs: 1,
    });

    let devices = client
        .discover(Duration::from_millis(400), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(devices.len(), 1);
    assert_eq!(devices[0].robot_name, "Kitchen");
    assert_eq!(devices[0].blid(), "3143C50021234567");
    assert_eq!(devices[0].firmware_major(), Some(2));
}

#[tokio::test]
async fn test_discovery_timeout_without_replies_is_empty() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let client = DiscoveryClient::new(DiscoveryConfig {
        port: silent.local_addr().unwrap().port(),
        broadcast_address: "127.0.0.1".to_string(),
        attempts: 1,
        send_interval_ms: 10,
        timeout_secs: 1,
    });

    let devices = client
        .discover(Duration::from_millis(100), &CancellationToken::new())
        .await
        .unwrap();
    assert!(devices.is_empty());
}

// =============================================================================
// Credential exchanges
// =============================================================================

async fn read_frame(device: &mut DuplexStream) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    while split_frame(&buf).unwrap().is_none() {
        device.read_exact(&mut byte).await.unwrap();
        buf.push(byte[0]);
    }
    buf
}

#[tokio::test]
async fn test_get_password_from_fake_device() {
    let (mut client, mut device) = duplex(512);

    tokio::spawn(async move {
        let request = read_frame(&mut device).await;
        assert_eq!(request, DISCOVERY_FRAME);

        // Header on its own, then the body byte by byte.
        let mut body = vec![0xEF, 0xCC, 0x3B, 0x29, 0x00, 0x00, 0x00, 0x00, 0x00];
        body.extend_from_slice(b":1700000000:abcd");
        body.push(0x00);
        device.write_all(&[0xF0, body.len() as u8]).await.unwrap();
        device.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        for byte in body {
            device.write_all(&[byte]).await.unwrap();
        }
        device
    });

    let password = get_password_over(&mut client, Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(password, ":1:1700000000:abcd");
}

#[tokio::test]
async fn test_set_password_against_fake_device() {
    let (mut client, mut device) = duplex(1024);

    let fake = tokio::spawn(async move {
        let connect = read_frame(&mut device).await;
        device.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

        let mut topics = Vec::new();
        for _ in 0..3 {
            let publish = read_frame(&mut device).await;
            let topic_len = u16::from_be_bytes([publish[2], publish[3]]) as usize;
            topics.push(String::from_utf8(publish[4..4 + topic_len].to_vec()).unwrap());
        }

        let set = read_frame(&mut device).await;
        // Status arrives split from its marker.
        device.write_all(&[0xF0, 0x05, 0xEF, 0xCC]).await.unwrap();
        device.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        device.write_all(&[0x3B, 0x29, 0x00]).await.unwrap();
        (connect, topics, set)
    });

    let request = SetPasswordRequest::new("BLID", ":1:1700000000:abcdefghijklmnop");
    set_password_over(
        &mut client,
        &request,
        Duration::from_secs(2),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let (connect, topics, set) = fake.await.unwrap();
    assert_eq!(connect[0], 0x10);
    assert_eq!(topics, ["wifictl", "wifictl", "wifictl"]);
    assert_eq!(&set[..2], &[0xF0, 0x23]);
    assert_eq!(set.last(), Some(&0x00));
}

#[tokio::test]
async fn test_set_password_permission_denied() {
    let (mut client, mut device) = duplex(1024);

    tokio::spawn(async move {
        read_frame(&mut device).await;
        device.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();
        for _ in 0..4 {
            read_frame(&mut device).await;
        }
        device
            .write_all(&[0xF0, 0x05, 0xEF, 0xCC, 0x3B, 0x29, 0x03])
            .await
            .unwrap();
        device
    });

    let err = set_password_over(
        &mut client,
        &SetPasswordRequest::new("BLID", "pw"),
        Duration::from_secs(2),
        &CancellationToken::new(),
    )
    .await
    .unwrap_err();

    assert!(matches!(
        err,
        DeviceError::Protocol(ProtocolError::SetPasswordRejected(_))
    ));
    assert!(!err.is_transport());
    assert!(!err.is_cancelled());
}

// =============================================================================
// Configuration and registry
// =============================================================================

#[tokio::test]
async fn test_registry_from_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("config.toml");
    std::fs::write(
        &path,
        r#"
[device]
ip = "10.0.0.7"
blid = "ABC123"
password = ":1:1700000000:token"

[mqtt]
channel_capacity = 8
"#,
    )
    .unwrap();

    let config = Config::load(&path).unwrap();
    config.validate().unwrap();
    assert_eq!(config.device.port, 8883);

    let store = StaticCredentialStore::with_identities([config.device_identity()]);
    let registry = DeviceRegistry::new(store, config.mqtt.clone());
    let cancel = CancellationToken::new();

    let first = registry.get_client("ABC123", &cancel).await.unwrap();
    let second = registry.get_client("ABC123", &cancel).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(first.identity().ip, "10.0.0.7");
    assert!(!first.connection().is_connected());

    assert!(registry.remove_client("ABC123").await);
    let third = registry.get_client("ABC123", &cancel).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
}

#[test]
fn test_merge_sequence_builds_full_snapshot() {
    let updates = [
        json!({"state": {"reported": {"batPct": 100, "cleanMissionStatus": {"phase": "charge"}}}}),
        json!({"state": {"reported": {"cleanMissionStatus": {"phase": "run", "mssnM": 1}}}}),
        json!({"state": {"reported": {"lastCommand": {"command": "start"}, "batPct": 98}}}),
    ];

    let snapshot = updates
        .iter()
        .fold(json!({}), |snapshot, update| apply_update(&snapshot, update).unwrap());

    assert_eq!(
        snapshot,
        json!({
            "batPct": 98,
            "cleanMissionStatus": {"phase": "run", "mssnM": 1},
            "lastCommand": {"command": "start"}
        })
    );
}
