use serde::{Deserialize, Serialize};

/// Device family a reading originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceFamily {
    /// AVA4 BLE gateway itself (status/heartbeat traffic).
    Ava4Gateway,
    /// A BLE medical instrument relayed through an AVA4 gateway.
    Ava4SubDevice,
    /// Kati smartwatch, identified by IMEI.
    KatiWatch,
    /// Qube-Vital hospital kiosk, identifies patients by citizen ID.
    QubeVital,
}

impl DeviceFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceFamily::Ava4Gateway => "ava4_gateway",
            DeviceFamily::Ava4SubDevice => "ava4_sub_device",
            DeviceFamily::KatiWatch => "kati_watch",
            DeviceFamily::QubeVital => "qube_vital",
        }
    }
}

/// The identity a reading arrived under.
///
/// `id` is the lookup key for patient resolution: the BLE sub-device MAC
/// for AVA4 medical readings, the IMEI for Kati, the gateway MAC for
/// AVA4/Qube status traffic. AVA4 sub-device readings also carry the
/// enclosing gateway MAC so the resolver can fall back to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub family: DeviceFamily,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, family: DeviceFamily) -> Self {
        Self {
            id: id.into(),
            family,
            gateway: None,
        }
    }

    pub fn with_gateway(id: impl Into<String>, family: DeviceFamily, gateway: &str) -> Self {
        Self {
            id: id.into(),
            family,
            gateway: Some(gateway.to_string()),
        }
    }
}
