use serde::Deserialize;

/// MQTT connection configuration, loadable from TOML or environment.
#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    /// Broker hostname.
    pub host: String,
    /// Broker port (default 1883).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Broker username.
    #[serde(default)]
    pub username: String,
    /// Broker password.
    #[serde(default)]
    pub password: String,
    /// Keep-alive interval in seconds.
    #[serde(default = "default_keepalive")]
    pub keepalive_s: u16,
    /// Subscription QoS level (0, 1 or 2; default 1).
    #[serde(default = "default_qos")]
    pub qos: u8,
    /// Broker connect timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_s: u64,
}

fn default_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

fn default_qos() -> u8 {
    1
}

fn default_connect_timeout() -> u64 {
    10
}

impl MqttConfig {
    /// Load MQTT settings from `AMY_MQTT_*` environment variables.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("AMY_MQTT_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("AMY_MQTT_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_port),
            username: std::env::var("AMY_MQTT_USERNAME").unwrap_or_default(),
            password: std::env::var("AMY_MQTT_PASSWORD").unwrap_or_default(),
            keepalive_s: std::env::var("AMY_MQTT_KEEPALIVE_S")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_keepalive),
            qos: std::env::var("AMY_MQTT_QOS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(default_qos),
            connect_timeout_s: default_connect_timeout(),
        }
    }
}
