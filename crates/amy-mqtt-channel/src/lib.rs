//! MQTT channel for the AMY telemetry listeners.
//!
//! Provides a typed MQTT abstraction for the ingest service:
//! - `Channel` trait for publish/subscribe (mockable in tests)
//! - `MqttChannel` over rumqttc with username/password auth
//! - `MockChannel` for testing without a broker
//! - family-specific subscription helpers

pub mod channel;
pub mod config;
pub mod error;
pub mod mock;

// Re-exports for convenience.
pub use channel::{Channel, MqttChannel};
pub use config::MqttConfig;
pub use error::{MqttError, MqttResult};
pub use mock::MockChannel;
