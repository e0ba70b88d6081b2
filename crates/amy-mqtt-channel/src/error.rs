//! MQTT channel error types.

use thiserror::Error;

/// Errors that can occur during MQTT operations.
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("subscribe error: {0}")]
    Subscribe(String),

    #[error("invalid QoS level {0}")]
    InvalidQos(u8),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("{0}")]
    Other(String),
}

/// Convenience alias for MQTT results.
pub type MqttResult<T> = Result<T, MqttError>;
