//! AVA4 gateway payloads.
//!
//! The gateway publishes its own status on `ESP32_BLE_GW_TX` and relays
//! BLE sub-device reports on `dusun_sub` (alias `dusun_pub`). Medical
//! reports carry a `data.attribute` naming the instrument and a
//! `data.value.device_list` array with one entry per measurement.

use serde::Deserialize;
use serde_json::Value;

use crate::identity::{DeviceFamily, DeviceIdentity};
use crate::reading::{CanonicalReading, GlucoseMarker, Reading, TemperatureSite};

use super::{ParseError, ts_from_epoch};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    time: Option<i64>,
    mac: Option<String>,
    #[serde(rename = "deviceCode")]
    device_code: Option<String>,
    data: Option<Data>,
}

#[derive(Debug, Deserialize)]
struct Data {
    attribute: Option<String>,
    mac: Option<String>,
    value: Option<DataValue>,
}

#[derive(Debug, Deserialize)]
struct DataValue {
    device_list: Option<Vec<Value>>,
}

fn envelope(payload: &[u8]) -> Result<Envelope, ParseError> {
    serde_json::from_slice(payload).map_err(|e| ParseError::MalformedJson(e.to_string()))
}

/// Gateway status topic: `HB_Msg` and `reportMsg` become heartbeat
/// readings carrying the gateway identity only.
pub fn parse_status(payload: &[u8]) -> Result<Vec<CanonicalReading>, ParseError> {
    let env = envelope(payload)?;
    match env.msg_type.as_str() {
        "HB_Msg" | "reportMsg" => {
            let mac = env
                .mac
                .or(env.device_code)
                .ok_or_else(|| ParseError::MissingField("mac".into()))?;
            let device_ts = env.time.map(ts_from_epoch).transpose()?;
            Ok(vec![CanonicalReading {
                reading: Reading::Heartbeat {
                    battery_pct: None,
                    gsm_signal: None,
                    satellites: None,
                    working_mode: None,
                },
                device_ts,
                device: DeviceIdentity::new(mac, DeviceFamily::Ava4Gateway),
                location: None,
                hint: None,
            }])
        }
        other => Err(ParseError::UnsupportedAttribute(format!("type {other}"))),
    }
}

/// Medical report topic: dispatch on `data.attribute`, one reading per
/// `device_list` entry.
pub fn parse_medical(payload: &[u8]) -> Result<Vec<CanonicalReading>, ParseError> {
    let env = envelope(payload)?;

    // Some gateways also heartbeat on the medical topic.
    if env.msg_type == "HB_Msg" || env.msg_type == "reportMsg" {
        return parse_status(payload);
    }
    if env.msg_type != "reportAttribute" {
        return Err(ParseError::UnsupportedAttribute(format!(
            "type {}",
            env.msg_type
        )));
    }

    let gateway_mac = env
        .mac
        .clone()
        .or(env.device_code.clone())
        .ok_or_else(|| ParseError::MissingField("mac".into()))?;
    let data = env
        .data
        .ok_or_else(|| ParseError::MissingField("data".into()))?;
    let attribute = data
        .attribute
        .clone()
        .ok_or_else(|| ParseError::MissingField("data.attribute".into()))?;
    let fallback_mac = data.mac.clone().unwrap_or_else(|| gateway_mac.clone());
    let entries = data
        .value
        .and_then(|v| v.device_list)
        .ok_or_else(|| ParseError::MissingField("data.value.device_list".into()))?;

    // Tolerate bad entries as long as at least one parses; gateways
    // occasionally pad device_list with partial scans.
    let mut readings = Vec::with_capacity(entries.len());
    let mut last_err = None;
    for entry in &entries {
        match parse_entry(&attribute, entry) {
            Ok((reading, scan_time, ble_addr)) => {
                let device_ts = match scan_time.or(env.time) {
                    Some(secs) => Some(ts_from_epoch(secs)?),
                    None => None,
                };
                let sub_mac = ble_addr.unwrap_or_else(|| fallback_mac.clone());
                readings.push(CanonicalReading {
                    reading,
                    device_ts,
                    device: DeviceIdentity::with_gateway(
                        sub_mac,
                        DeviceFamily::Ava4SubDevice,
                        &gateway_mac,
                    ),
                    location: None,
                    hint: None,
                });
            }
            Err(e) => last_err = Some(e),
        }
    }

    if readings.is_empty() {
        return Err(
            last_err.unwrap_or_else(|| ParseError::MissingField("device_list entries".into()))
        );
    }
    Ok(readings)
}

#[derive(Debug, Deserialize)]
struct BpEntry {
    scan_time: Option<i64>,
    ble_addr: Option<String>,
    bp_high: f64,
    bp_low: f64,
    #[serde(rename = "PR")]
    pr: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GlucoseEntry {
    scan_time: Option<i64>,
    ble_addr: Option<String>,
    blood_glucose: f64,
    marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Spo2Entry {
    scan_time: Option<i64>,
    ble_addr: Option<String>,
    spo2: f64,
    pulse: Option<f64>,
    pi: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TempEntry {
    scan_time: Option<i64>,
    ble_addr: Option<String>,
    temp: f64,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WeightEntry {
    scan_time: Option<i64>,
    ble_addr: Option<String>,
    weight: f64,
    resistance: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct UricAcidEntry {
    scan_time: Option<i64>,
    ble_addr: Option<String>,
    uric_acid: f64,
}

#[derive(Debug, Deserialize)]
struct CholesterolEntry {
    scan_time: Option<i64>,
    ble_addr: Option<String>,
    cholesterol: f64,
}

fn field_err(e: serde_json::Error) -> ParseError {
    ParseError::MissingField(e.to_string())
}

/// Fixed attribute table. Unknown attributes are reported, not fatal to
/// the listener.
fn parse_entry(
    attribute: &str,
    entry: &Value,
) -> Result<(Reading, Option<i64>, Option<String>), ParseError> {
    match attribute {
        "BP_BIOLIGTH" => {
            let e: BpEntry = serde_json::from_value(entry.clone()).map_err(field_err)?;
            Ok((
                Reading::BloodPressure {
                    systolic: e.bp_high,
                    diastolic: e.bp_low,
                    pulse: e.pr,
                },
                e.scan_time,
                e.ble_addr,
            ))
        }
        "Contour_Elite" | "AccuChek_Instant" => {
            let e: GlucoseEntry = serde_json::from_value(entry.clone()).map_err(field_err)?;
            Ok((
                Reading::BloodSugar {
                    value: e.blood_glucose,
                    marker: e
                        .marker
                        .as_deref()
                        .map(GlucoseMarker::from_device_str)
                        .unwrap_or(GlucoseMarker::Unknown),
                },
                e.scan_time,
                e.ble_addr,
            ))
        }
        "Oximeter JUMPER" => {
            let e: Spo2Entry = serde_json::from_value(entry.clone()).map_err(field_err)?;
            Ok((
                Reading::Spo2 {
                    spo2: e.spo2,
                    pulse: e.pulse,
                    perfusion_index: e.pi,
                },
                e.scan_time,
                e.ble_addr,
            ))
        }
        "IR_TEMO_JUMPER" => {
            let e: TempEntry = serde_json::from_value(entry.clone()).map_err(field_err)?;
            Ok((
                Reading::BodyTemperature {
                    value_c: e.temp,
                    site: e
                        .mode
                        .as_deref()
                        .map(TemperatureSite::from_device_str)
                        .unwrap_or(TemperatureSite::Other),
                },
                e.scan_time,
                e.ble_addr,
            ))
        }
        "BodyScale_JUMPER" => {
            let e: WeightEntry = serde_json::from_value(entry.clone()).map_err(field_err)?;
            Ok((
                Reading::Weight {
                    value_kg: e.weight,
                    impedance_ohm: e.resistance,
                },
                e.scan_time,
                e.ble_addr,
            ))
        }
        "MGSS_REF_UA" => {
            let e: UricAcidEntry = serde_json::from_value(entry.clone()).map_err(field_err)?;
            Ok((Reading::UricAcid { value: e.uric_acid }, e.scan_time, e.ble_addr))
        }
        "MGSS_REF_CHOL" => {
            let e: CholesterolEntry = serde_json::from_value(entry.clone()).map_err(field_err)?;
            Ok((
                Reading::Cholesterol {
                    value: e.cholesterol,
                },
                e.scan_time,
                e.ble_addr,
            ))
        }
        other => Err(ParseError::UnsupportedAttribute(other.to_string())),
    }
}
