//! Payload codec — wire JSON in, canonical readings out.
//!
//! Pure and side-effect free: no I/O, no clock. Family routing comes
//! from the topic; each family module turns its own JSON dialect into
//! `CanonicalReading`s.

pub mod ava4;
pub mod kati;
pub mod qube;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::identity::DeviceFamily;
use crate::reading::{CanonicalReading, Reading};
use crate::topics;

/// Typed parse failure. Out-of-range values are NOT parse failures —
/// see [`range_warning`].
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("malformed json: {0}")]
    MalformedJson(String),

    #[error("missing required field: {0}")]
    MissingField(String),

    #[error("unsupported attribute: {0}")]
    UnsupportedAttribute(String),

    #[error("unsupported topic: {0}")]
    UnsupportedTopic(String),
}

impl ParseError {
    /// Stable failure-kind label used in flow events and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ParseError::MalformedJson(_) => "malformed_json",
            ParseError::MissingField(_) => "missing_required_field",
            ParseError::UnsupportedAttribute(_) => "unsupported_attribute",
            ParseError::UnsupportedTopic(_) => "unsupported_topic",
        }
    }
}

/// Parse one MQTT message into canonical readings.
///
/// Batch topics (AVA4 `device_list`, Kati `AP55`) yield several readings
/// in payload order. An empty vec means the message was valid but carries
/// nothing to process (e.g. Kati `onlineTrigger` with `status="online"`).
pub fn parse(topic: &str, payload: &[u8]) -> Result<Vec<CanonicalReading>, ParseError> {
    let family =
        topics::classify(topic).ok_or_else(|| ParseError::UnsupportedTopic(topic.to_string()))?;

    match family {
        DeviceFamily::Ava4Gateway => ava4::parse_status(payload),
        DeviceFamily::Ava4SubDevice => ava4::parse_medical(payload),
        DeviceFamily::KatiWatch => kati::parse(topic, payload),
        DeviceFamily::QubeVital => qube::parse(payload),
    }
}

/// Soft plausibility check. Out-of-range readings are accepted and
/// stored; the listener emits a warning flow event alongside.
pub fn range_warning(reading: &Reading) -> Option<String> {
    match reading {
        Reading::BloodPressure {
            systolic,
            diastolic,
            ..
        } => {
            if !(50.0..=260.0).contains(systolic) {
                Some(format!("systolic {systolic} outside 50-260"))
            } else if !(30.0..=200.0).contains(diastolic) {
                Some(format!("diastolic {diastolic} outside 30-200"))
            } else {
                None
            }
        }
        Reading::Spo2 { spo2, .. } if !(50.0..=100.0).contains(spo2) => {
            Some(format!("spo2 {spo2} outside 50-100"))
        }
        Reading::BodyTemperature { value_c, .. } if !(30.0..=45.0).contains(value_c) => {
            Some(format!("temperature {value_c} outside 30-45"))
        }
        Reading::Weight { value_kg, .. } if !(1.0..=400.0).contains(value_kg) => {
            Some(format!("weight {value_kg} outside 1-400"))
        }
        _ => None,
    }
}

/// Epoch-seconds → UTC, rejecting values chrono cannot represent.
pub(crate) fn ts_from_epoch(secs: i64) -> Result<DateTime<Utc>, ParseError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| ParseError::MalformedJson(format!("timestamp {secs} out of range")))
}
