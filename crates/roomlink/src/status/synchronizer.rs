//! Shadow-state synchronizer.
//!
//! One worker task per device owns the merge: it reads the device's inbound
//! messages in arrival order, merges each into the cached snapshot, swaps the
//! snapshot atomically and fans the new value out to every subscriber. The
//! per-device gate is held only while the underlying subscribe runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::merge;
use super::subscriber::DeviceSubscriber;
use crate::error::{DeviceError, Result};
use crate::session::InboundMessage;

/// Point-in-time view of a device's merged state.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    /// Contents of `state.reported`, merged across every update so far.
    pub snapshot: Arc<Value>,
    /// Receipt time of the message that produced this snapshot; `None` before
    /// the first message.
    pub timestamp: Option<DateTime<Utc>>,
}

impl Default for StatusUpdate {
    fn default() -> Self {
        Self {
            snapshot: Arc::new(Value::Object(serde_json::Map::new())),
            timestamp: None,
        }
    }
}

/// Handed to each caller of [`StatusSynchronizer::get_subscription`].
#[derive(Debug)]
pub struct StatusSubscription {
    /// Last known snapshot at the time of subscribing.
    pub last: StatusUpdate,
    /// Every snapshot produced after subscribing. A consumer that falls
    /// behind gets `Lagged` and continues from the newest retained value.
    pub updates: broadcast::Receiver<StatusUpdate>,
}

struct DeviceStatus {
    /// Gate plus "subscribed" marker: a running worker means subscribed.
    worker: Mutex<Option<JoinHandle<()>>>,
    last: watch::Sender<StatusUpdate>,
    updates: broadcast::Sender<StatusUpdate>,
}

impl DeviceStatus {
    fn new(capacity: usize) -> Self {
        let (last, _) = watch::channel(StatusUpdate::default());
        let (updates, _) = broadcast::channel(capacity.max(1));
        Self {
            worker: Mutex::new(None),
            last,
            updates,
        }
    }

    fn apply(&self, blid: &str, message: &InboundMessage) {
        let payload: Value = match serde_json::from_slice(&message.payload) {
            Ok(value @ Value::Object(_)) => value,
            Ok(_) => {
                tracing::warn!(blid = %blid, topic = %message.topic, "Skipping non-object status payload");
                return;
            }
            Err(e) => {
                tracing::warn!(blid = %blid, topic = %message.topic, error = %e, "Skipping unparseable status payload");
                return;
            }
        };

        let current = Arc::clone(&self.last.borrow().snapshot);
        let Some(merged) = merge::apply_update(&current, &payload) else {
            tracing::warn!(blid = %blid, topic = %message.topic, "Status payload replaced the reported envelope, skipping");
            return;
        };

        let update = StatusUpdate {
            snapshot: Arc::new(merged),
            timestamp: Some(message.received_at),
        };
        self.last.send_replace(update.clone());
        // No receivers just means nobody is watching right now.
        let _ = self.updates.send(update);
    }
}

/// Merges device telemetry into per-device snapshots and fans them out.
pub struct StatusSynchronizer {
    devices: DashMap<String, Arc<DeviceStatus>>,
    capacity: usize,
}

impl StatusSynchronizer {
    /// Creates a synchronizer whose per-device fan-out keeps `capacity` updates.
    pub fn new(capacity: usize) -> Self {
        Self {
            devices: DashMap::new(),
            capacity,
        }
    }

    /// Returns the last snapshot and a live update stream for `blid`.
    ///
    /// The first caller for a device performs the real subscribe through
    /// `subscriber`; concurrent and later callers share it. After the device's
    /// session drops, the next call subscribes again.
    pub async fn get_subscription(
        &self,
        blid: &str,
        subscriber: &DeviceSubscriber,
        cancel: &CancellationToken,
    ) -> Result<StatusSubscription> {
        let status = Arc::clone(
            &*self
                .devices
                .entry(blid.to_string())
                .or_insert_with(|| Arc::new(DeviceStatus::new(self.capacity))),
        );

        {
            let mut worker = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DeviceError::Cancelled),
                guard = status.worker.lock() => guard,
            };

            let running = worker.as_ref().is_some_and(|handle| !handle.is_finished());
            if !running {
                let (_, messages) = subscriber.subscribe(cancel).await?;
                *worker = Some(tokio::spawn(run_worker(
                    blid.to_string(),
                    messages,
                    Arc::clone(&status),
                )));
                tracing::info!(blid = %blid, topic = %subscriber.topic(), "Subscribed to device status");
            }
        }

        let updates = status.updates.subscribe();
        let last = status.last.borrow().clone();
        Ok(StatusSubscription { last, updates })
    }

    /// Last known snapshot for `blid`, if it was ever subscribed.
    pub fn last(&self, blid: &str) -> Option<StatusUpdate> {
        self.devices
            .get(blid)
            .map(|status| status.last.borrow().clone())
    }

    /// Returns whether a worker is currently running for `blid`.
    pub async fn is_subscribed(&self, blid: &str) -> bool {
        let Some(status) = self.devices.get(blid).map(|s| Arc::clone(&*s)) else {
            return false;
        };
        let worker = status.worker.lock().await;
        worker.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Number of live update receivers for `blid`.
    pub fn subscriber_count(&self, blid: &str) -> usize {
        self.devices
            .get(blid)
            .map(|status| status.updates.receiver_count())
            .unwrap_or(0)
    }

    /// Stops the worker for `blid` and drops its cached state.
    pub async fn forget(&self, blid: &str) {
        if let Some((_, status)) = self.devices.remove(blid) {
            if let Some(handle) = status.worker.lock().await.take() {
                handle.abort();
            }
            tracing::debug!(blid = %blid, "Dropped device status state");
        }
    }
}

async fn run_worker(
    blid: String,
    mut messages: broadcast::Receiver<InboundMessage>,
    status: Arc<DeviceStatus>,
) {
    loop {
        match messages.recv().await {
            Ok(message) => status.apply(&blid, &message),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(blid = %blid, skipped, "Status worker fell behind the session");
            }
            Err(broadcast::error::RecvError::Closed) => {
                tracing::info!(blid = %blid, "Device session closed, status worker stopping");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rumqttc::QoS;
    use serde_json::json;

    use super::*;
    use crate::session::SubscriptionOptions;
    use crate::testing::RecordingProvider;

    fn subscriber(provider: &Arc<RecordingProvider>) -> DeviceSubscriber {
        DeviceSubscriber::new(
            provider.clone(),
            SubscriptionOptions {
                topic: "#".to_string(),
                qos: QoS::AtLeastOnce,
            },
        )
    }

    async fn next(rx: &mut broadcast::Receiver<StatusUpdate>) -> StatusUpdate {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for update")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn test_first_subscription_starts_empty() {
        let provider = RecordingProvider::new();
        let sync = StatusSynchronizer::new(16);

        let sub = sync
            .get_subscription("BLID", &subscriber(&provider), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(*sub.last.snapshot, json!({}));
        assert!(sub.last.timestamp.is_none());
        assert!(sync.is_subscribed("BLID").await);
    }

    #[tokio::test]
    async fn test_updates_merge_and_fan_out() {
        let provider = RecordingProvider::new();
        let sync = StatusSynchronizer::new(16);
        let cancel = CancellationToken::new();

        let mut first = sync
            .get_subscription("BLID", &subscriber(&provider), &cancel)
            .await
            .unwrap();
        let mut second = sync
            .get_subscription("BLID", &subscriber(&provider), &cancel)
            .await
            .unwrap();

        provider.session.push(
            "$aws/things/BLID/shadow/update",
            r#"{"state":{"reported":{"batPct":90,"bin":{"present":true}}}}"#,
        );
        provider.session.push(
            "$aws/things/BLID/shadow/update",
            r#"{"state":{"reported":{"bin":{"full":false}}}}"#,
        );

        next(&mut first.updates).await;
        let merged = next(&mut first.updates).await;
        assert_eq!(
            *merged.snapshot,
            json!({"batPct": 90, "bin": {"present": true, "full": false}})
        );
        assert!(merged.timestamp.is_some());

        next(&mut second.updates).await;
        assert_eq!(next(&mut second.updates).await, merged);

        let late = sync
            .get_subscription("BLID", &subscriber(&provider), &cancel)
            .await
            .unwrap();
        assert_eq!(late.last, merged);
        assert_eq!(provider.session.subscriptions().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_subscribe_once() {
        let provider = RecordingProvider::new();
        provider
            .session
            .set_subscribe_delay(Duration::from_millis(50));
        let sync = StatusSynchronizer::new(16);
        let cancel = CancellationToken::new();
        let sub = subscriber(&provider);

        let (a, b, c) = tokio::join!(
            sync.get_subscription("BLID", &sub, &cancel),
            sync.get_subscription("BLID", &sub, &cancel),
            sync.get_subscription("BLID", &sub, &cancel),
        );

        assert!(a.is_ok() && b.is_ok() && c.is_ok());
        assert_eq!(provider.session.subscriptions(), ["#"]);
        assert_eq!(sync.subscriber_count("BLID"), 3);
    }

    #[tokio::test]
    async fn test_malformed_payloads_are_skipped() {
        let provider = RecordingProvider::new();
        let sync = StatusSynchronizer::new(16);

        let mut sub = sync
            .get_subscription("BLID", &subscriber(&provider), &CancellationToken::new())
            .await
            .unwrap();

        provider.session.push("wifistat", "not json");
        provider.session.push("wifistat", "[1,2,3]");
        provider
            .session
            .push("wifistat", r#"{"state":{"reported":{"signal":{"rssi":-50}}}}"#);

        let update = next(&mut sub.updates).await;
        assert_eq!(*update.snapshot, json!({"signal": {"rssi": -50}}));
    }

    #[tokio::test]
    async fn test_resubscribes_after_session_drop() {
        let provider = RecordingProvider::new();
        let sync = StatusSynchronizer::new(16);
        let cancel = CancellationToken::new();

        sync.get_subscription("BLID", &subscriber(&provider), &cancel)
            .await
            .unwrap();
        provider.session.disconnect();

        for _ in 0..50 {
            if !sync.is_subscribed("BLID").await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!sync.is_subscribed("BLID").await);

        provider.session.reconnect();
        sync.get_subscription("BLID", &subscriber(&provider), &cancel)
            .await
            .unwrap();

        assert_eq!(provider.session.subscriptions().len(), 2);
        assert!(sync.is_subscribed("BLID").await);
    }

    #[tokio::test]
    async fn test_slow_consumer_does_not_block_ingestion() {
        let provider = RecordingProvider::new();
        let sync = StatusSynchronizer::new(2);

        let mut slow = sync
            .get_subscription("BLID", &subscriber(&provider), &CancellationToken::new())
            .await
            .unwrap();

        for pct in 1..=6 {
            provider.session.push(
                "update",
                &format!(r#"{{"state":{{"reported":{{"batPct":{}}}}}}}"#, pct),
            );
        }

        for _ in 0..50 {
            if sync.last("BLID").map(|u| u.snapshot["batPct"] == json!(6)) == Some(true) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(sync.last("BLID").unwrap().snapshot["batPct"], json!(6));

        assert!(matches!(
            slow.updates.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        let newest = next(&mut slow.updates).await;
        assert_eq!(newest.snapshot["batPct"], json!(5));
    }

    #[tokio::test]
    async fn test_forget_stops_worker() {
        let provider = RecordingProvider::new();
        let sync = StatusSynchronizer::new(16);

        sync.get_subscription("BLID", &subscriber(&provider), &CancellationToken::new())
            .await
            .unwrap();
        sync.forget("BLID").await;

        assert!(!sync.is_subscribed("BLID").await);
        assert!(sync.last("BLID").is_none());
    }

    #[tokio::test]
    async fn test_cancelled_subscription() {
        let provider = RecordingProvider::new();
        let sync = StatusSynchronizer::new(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = sync
            .get_subscription("BLID", &subscriber(&provider), &cancel)
            .await;
        assert!(matches!(result, Err(DeviceError::Cancelled)));
        assert!(provider.session.subscriptions().is_empty());
    }
}
