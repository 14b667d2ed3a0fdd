//! Device telemetry: raw topic subscriptions and merged shadow state.

pub mod merge;
pub mod subscriber;
pub mod synchronizer;

pub use subscriber::DeviceSubscriber;
pub use synchronizer::{StatusSubscription, StatusSynchronizer, StatusUpdate};
