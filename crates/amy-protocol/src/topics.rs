//! MQTT topic constants and family classification.
//!
//! Topic layout (fixed by the device firmware, not configurable):
//! ```text
//! ESP32_BLE_GW_TX          AVA4 gateway status
//! dusun_sub                AVA4 medical sub-device reports
//! dusun_pub                historical alias of dusun_sub
//! iMEDE_watch/<subtopic>   Kati watch (VitalSign, AP55, hb, location,
//!                          sleepdata, sos, fallDown, onlineTrigger)
//! CM4_BLE_GW_TX            Qube-Vital kiosk
//! ```

use crate::identity::DeviceFamily;

pub const AVA4_STATUS: &str = "ESP32_BLE_GW_TX";
pub const AVA4_MEDICAL: &str = "dusun_sub";
/// Older AVA4 firmware published medical reports here; both are accepted.
pub const AVA4_MEDICAL_LEGACY: &str = "dusun_pub";
pub const KATI_PREFIX: &str = "iMEDE_watch/";
pub const KATI_WILDCARD: &str = "iMEDE_watch/#";
pub const QUBE_STATUS: &str = "CM4_BLE_GW_TX";

/// Subscription filters per listener worker.
pub fn ava4_subscriptions() -> [&'static str; 3] {
    [AVA4_STATUS, AVA4_MEDICAL, AVA4_MEDICAL_LEGACY]
}

pub fn kati_subscriptions() -> [&'static str; 1] {
    [KATI_WILDCARD]
}

pub fn qube_subscriptions() -> [&'static str; 1] {
    [QUBE_STATUS]
}

/// Classify a concrete topic into the device family that publishes on it.
pub fn classify(topic: &str) -> Option<DeviceFamily> {
    match topic {
        AVA4_STATUS => Some(DeviceFamily::Ava4Gateway),
        AVA4_MEDICAL | AVA4_MEDICAL_LEGACY => Some(DeviceFamily::Ava4SubDevice),
        QUBE_STATUS => Some(DeviceFamily::QubeVital),
        other if other.starts_with(KATI_PREFIX) => Some(DeviceFamily::KatiWatch),
        _ => None,
    }
}

/// Final segment of a Kati topic (`iMEDE_watch/AP55` → `AP55`).
pub fn kati_subtopic(topic: &str) -> Option<&str> {
    topic.strip_prefix(KATI_PREFIX).filter(|s| !s.is_empty())
}
