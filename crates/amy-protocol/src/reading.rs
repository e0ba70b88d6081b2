//! Canonical medical observations shared by every device family.
//!
//! A `CanonicalReading` is what the payload codec hands to the rest of
//! the pipeline: one medical observation plus the identity it arrived
//! under. The codec is pure — `device_ts` is whatever the device supplied
//! (the writer substitutes the server clock when a device omits it).

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::DeviceIdentity;

/// Fasting state attached to a glucose reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlucoseMarker {
    Fasting,
    AfterMeal,
    Unknown,
}

impl GlucoseMarker {
    /// Map the loosely formatted marker strings the meters send.
    pub fn from_device_str(s: &str) -> Self {
        let lower = s.to_ascii_lowercase();
        if lower.contains("fast") {
            GlucoseMarker::Fasting
        } else if lower.contains("after") || lower.contains("pp") {
            GlucoseMarker::AfterMeal
        } else {
            GlucoseMarker::Unknown
        }
    }
}

/// Measurement site of a thermometer reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureSite {
    Head,
    Armpit,
    Other,
}

impl TemperatureSite {
    pub fn from_device_str(s: &str) -> Self {
        let lower = s.to_ascii_lowercase();
        if lower.contains("head") {
            TemperatureSite::Head
        } else if lower.contains("arm") {
            TemperatureSite::Armpit
        } else {
            TemperatureSite::Other
        }
    }
}

/// Sleep phase for one decoded sleep segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepPhase {
    Awake,
    Light,
    Deep,
    Rem,
}

/// One run of consecutive minutes in the same sleep phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepSegment {
    pub phase: SleepPhase,
    pub duration_s: u64,
}

/// GPS fix attached to watch readings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
}

/// Emergency alert classes, ordered by urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    Sos,
    Fall,
    LowBattery,
    NotWorn,
    Offline,
}

/// Sex recorded on Qube-Vital demographic payloads ("1" male, "0" female).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gender {
    Male,
    Female,
    Unknown,
}

impl Gender {
    pub fn from_device_str(s: &str) -> Self {
        match s.trim() {
            "1" => Gender::Male,
            "0" => Gender::Female,
            _ => Gender::Unknown,
        }
    }
}

/// Demographic side channel carried on Qube-Vital messages.
///
/// Only the Qube resolve path consumes it (auto-provisioning).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatientHint {
    pub citizen_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_th: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name_en: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub birth_date: Option<NaiveDate>,
    pub gender: Gender,
}

/// The canonical reading sum type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reading {
    BloodPressure {
        systolic: f64,
        diastolic: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pulse: Option<f64>,
    },
    BloodSugar {
        value: f64,
        marker: GlucoseMarker,
    },
    Spo2 {
        spo2: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        pulse: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        perfusion_index: Option<f64>,
    },
    BodyTemperature {
        value_c: f64,
        site: TemperatureSite,
    },
    Weight {
        value_kg: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        impedance_ohm: Option<f64>,
    },
    UricAcid {
        value: f64,
    },
    Cholesterol {
        value: f64,
    },
    HeartRate {
        bpm: f64,
    },
    StepCount {
        steps: u64,
    },
    SleepSummary {
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
        segments: Vec<SleepSegment>,
    },
    Location {
        #[serde(skip_serializing_if = "Option::is_none")]
        gps: Option<GeoLocation>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cell: Option<serde_json::Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        wifi_raw: Option<String>,
    },
    Emergency {
        // `kind` is taken by the enum tag; the alert class serializes as `alert`.
        #[serde(rename = "alert")]
        kind: EmergencyKind,
        #[serde(skip_serializing_if = "Option::is_none")]
        location: Option<GeoLocation>,
    },
    Heartbeat {
        #[serde(skip_serializing_if = "Option::is_none")]
        battery_pct: Option<f64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        gsm_signal: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        satellites: Option<i64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        working_mode: Option<i64>,
    },
}

/// Fieldless mirror of `Reading`, used for collection routing and
/// snapshot field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingKind {
    BloodPressure,
    BloodSugar,
    Spo2,
    BodyTemperature,
    Weight,
    UricAcid,
    Cholesterol,
    HeartRate,
    StepCount,
    SleepSummary,
    Location,
    Emergency,
    Heartbeat,
}

impl ReadingKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingKind::BloodPressure => "blood_pressure",
            ReadingKind::BloodSugar => "blood_sugar",
            ReadingKind::Spo2 => "spo2",
            ReadingKind::BodyTemperature => "body_temperature",
            ReadingKind::Weight => "weight",
            ReadingKind::UricAcid => "uric_acid",
            ReadingKind::Cholesterol => "cholesterol",
            ReadingKind::HeartRate => "heart_rate",
            ReadingKind::StepCount => "step_count",
            ReadingKind::SleepSummary => "sleep_summary",
            ReadingKind::Location => "location",
            ReadingKind::Emergency => "emergency",
            ReadingKind::Heartbeat => "heartbeat",
        }
    }

    /// History collection this kind appends to. Heartbeats are status
    /// traffic and have no history collection.
    pub fn history_collection(&self) -> Option<&'static str> {
        match self {
            ReadingKind::BloodPressure => Some("blood_pressure_histories"),
            ReadingKind::BloodSugar => Some("blood_sugar_histories"),
            ReadingKind::Spo2 => Some("spo2_histories"),
            ReadingKind::BodyTemperature => Some("temperature_histories"),
            ReadingKind::Weight => Some("body_data_histories"),
            ReadingKind::UricAcid => Some("uric_acid_histories"),
            ReadingKind::Cholesterol => Some("cholesterol_histories"),
            ReadingKind::HeartRate => Some("heart_rate_histories"),
            ReadingKind::StepCount => Some("step_histories"),
            ReadingKind::SleepSummary => Some("sleep_data_histories"),
            ReadingKind::Location => Some("location_histories"),
            ReadingKind::Emergency => Some("emergency_alarm"),
            ReadingKind::Heartbeat => None,
        }
    }

    /// Snapshot field on the patient document (`last_<kind>`), if this
    /// kind keeps one.
    pub fn snapshot_field(&self) -> Option<String> {
        match self {
            ReadingKind::Heartbeat => None,
            other => Some(format!("last_{}", other.as_str())),
        }
    }
}

/// One parsed observation with its provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalReading {
    #[serde(flatten)]
    pub reading: Reading,
    /// Device-supplied timestamp. `None` when the payload carried no
    /// usable clock (some emergency frames); the writer substitutes
    /// the server clock at store time.
    pub device_ts: Option<DateTime<Utc>>,
    pub device: DeviceIdentity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<PatientHint>,
}

impl CanonicalReading {
    pub fn kind(&self) -> ReadingKind {
        match self.reading {
            Reading::BloodPressure { .. } => ReadingKind::BloodPressure,
            Reading::BloodSugar { .. } => ReadingKind::BloodSugar,
            Reading::Spo2 { .. } => ReadingKind::Spo2,
            Reading::BodyTemperature { .. } => ReadingKind::BodyTemperature,
            Reading::Weight { .. } => ReadingKind::Weight,
            Reading::UricAcid { .. } => ReadingKind::UricAcid,
            Reading::Cholesterol { .. } => ReadingKind::Cholesterol,
            Reading::HeartRate { .. } => ReadingKind::HeartRate,
            Reading::StepCount { .. } => ReadingKind::StepCount,
            Reading::SleepSummary { .. } => ReadingKind::SleepSummary,
            Reading::Location { .. } => ReadingKind::Location,
            Reading::Emergency { .. } => ReadingKind::Emergency,
            Reading::Heartbeat { .. } => ReadingKind::Heartbeat,
        }
    }

    pub fn is_emergency(&self) -> bool {
        matches!(self.reading, Reading::Emergency { .. })
    }

    pub fn is_heartbeat(&self) -> bool {
        matches!(self.reading, Reading::Heartbeat { .. })
    }

    pub fn emergency_kind(&self) -> Option<EmergencyKind> {
        match self.reading {
            Reading::Emergency { kind, .. } => Some(kind),
            _ => None,
        }
    }
}
