//! In-memory session doubles for unit tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::error::{DeviceError, Result};
use crate::session::{
    BoxFuture, DeviceSession, InboundMessage, SessionProvider, SubscriptionOptions,
};

/// Session that records publishes and subscriptions.
pub struct RecordingSession {
    published: Mutex<Vec<(String, Vec<u8>)>>,
    subscriptions: Mutex<Vec<String>>,
    inbound: Mutex<Option<broadcast::Sender<InboundMessage>>>,
    fail_publishes: AtomicBool,
    fail_after: Mutex<Option<usize>>,
    subscribe_delay: Mutex<Duration>,
}

impl RecordingSession {
    pub fn new() -> Arc<Self> {
        let (tx, _) = broadcast::channel(64);
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            subscriptions: Mutex::new(Vec::new()),
            inbound: Mutex::new(Some(tx)),
            fail_publishes: AtomicBool::new(false),
            fail_after: Mutex::new(None),
            subscribe_delay: Mutex::new(Duration::ZERO),
        })
    }

    pub fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publishes.store(fail, Ordering::SeqCst);
    }

    /// Lets `count` publishes through, then fails every later one.
    pub fn fail_after(&self, count: usize) {
        *self.fail_after.lock().unwrap() = Some(count);
    }

    pub fn set_subscribe_delay(&self, delay: Duration) {
        *self.subscribe_delay.lock().unwrap() = delay;
    }

    /// Delivers a message as if the device had sent it.
    pub fn push(&self, topic: &str, payload: &str) {
        if let Some(tx) = self.inbound.lock().unwrap().as_ref() {
            let _ = tx.send(InboundMessage::new(topic, payload.as_bytes().to_vec()));
        }
    }

    /// Simulates the connection dropping.
    pub fn disconnect(&self) {
        self.inbound.lock().unwrap().take();
    }

    /// Brings the session back up after [`disconnect`](Self::disconnect).
    pub fn reconnect(&self) {
        let (tx, _) = broadcast::channel(64);
        *self.inbound.lock().unwrap() = Some(tx);
    }
}

impl DeviceSession for RecordingSession {
    fn publish<'a>(&'a self, topic: &'a str, payload: Vec<u8>) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_publishes.load(Ordering::SeqCst) {
                return Err(DeviceError::Transport("publish refused".to_string()));
            }
            let mut published = self.published.lock().unwrap();
            if let Some(limit) = *self.fail_after.lock().unwrap() {
                if published.len() >= limit {
                    return Err(DeviceError::Transport("publish refused".to_string()));
                }
            }
            published.push((topic.to_string(), payload));
            Ok(())
        })
    }

    fn subscribe<'a>(&'a self, options: &'a SubscriptionOptions) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let delay = *self.subscribe_delay.lock().unwrap();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.subscriptions
                .lock()
                .unwrap()
                .push(options.topic.clone());
            Ok(())
        })
    }

    fn messages(&self) -> broadcast::Receiver<InboundMessage> {
        match self.inbound.lock().unwrap().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn is_connected(&self) -> bool {
        self.inbound.lock().unwrap().is_some()
    }
}

/// Provider handing out one shared [`RecordingSession`].
pub struct RecordingProvider {
    pub session: Arc<RecordingSession>,
    requests: AtomicUsize,
}

impl RecordingProvider {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            session: RecordingSession::new(),
            requests: AtomicUsize::new(0),
        })
    }

    /// Number of `get_session` calls so far.
    pub fn session_requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl SessionProvider for RecordingProvider {
    fn get_session<'a>(
        &'a self,
        cancel: &'a CancellationToken,
    ) -> BoxFuture<'a, Result<Arc<dyn DeviceSession>>> {
        Box::pin(async move {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Err(DeviceError::Cancelled);
            }
            Ok(Arc::clone(&self.session) as Arc<dyn DeviceSession>)
        })
    }
}
