//! Streaming generation lifecycle: the broker, fan-out, and persistence
//! throttling.

pub mod broker;

pub use broker::{StreamBroker, StreamSubscription, ThrottleConfig, INTERRUPTED_NOTICE};
