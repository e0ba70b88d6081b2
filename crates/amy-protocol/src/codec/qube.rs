//! Qube-Vital kiosk payloads (`CM4_BLE_GW_TX`).
//!
//! The kiosk identifies patients by Thai citizen ID and sends the
//! demographics it captured at the desk alongside each measurement.
//! Those travel as a `PatientHint` side channel; only the Qube resolve
//! path (auto-provisioning) consumes them.

use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::Value;

use crate::identity::{DeviceFamily, DeviceIdentity};
use crate::reading::{
    CanonicalReading, Gender, GlucoseMarker, PatientHint, Reading, TemperatureSite,
};

use super::{ParseError, ts_from_epoch};

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    msg_type: String,
    time: Option<i64>,
    mac: Option<String>,
    #[serde(rename = "IMEI")]
    imei: Option<String>,
    data: Option<Data>,
}

#[derive(Debug, Deserialize)]
struct Data {
    attribute: Option<String>,
    citiz: Option<String>,
    #[serde(rename = "nameTH")]
    name_th: Option<String>,
    #[serde(rename = "nameEN")]
    name_en: Option<String>,
    brith: Option<String>,
    gender: Option<String>,
    value: Option<Value>,
}

pub fn parse(payload: &[u8]) -> Result<Vec<CanonicalReading>, ParseError> {
    let env: Envelope =
        serde_json::from_slice(payload).map_err(|e| ParseError::MalformedJson(e.to_string()))?;

    let mac = env
        .mac
        .clone()
        .or(env.imei.clone())
        .ok_or_else(|| ParseError::MissingField("mac".into()))?;
    let device = DeviceIdentity::new(mac, DeviceFamily::QubeVital);
    let device_ts = env.time.map(ts_from_epoch).transpose()?;

    match env.msg_type.as_str() {
        "HB_Msg" => Ok(vec![CanonicalReading {
            reading: Reading::Heartbeat {
                battery_pct: None,
                gsm_signal: None,
                satellites: None,
                working_mode: None,
            },
            device_ts,
            device,
            location: None,
            hint: None,
        }]),
        "reportAttribute" => {
            let data = env
                .data
                .ok_or_else(|| ParseError::MissingField("data".into()))?;
            let attribute = data
                .attribute
                .clone()
                .ok_or_else(|| ParseError::MissingField("data.attribute".into()))?;
            let value = data
                .value
                .clone()
                .ok_or_else(|| ParseError::MissingField("data.value".into()))?;
            let reading = parse_value(&attribute, &value)?;
            let hint = hint_of(&data);

            Ok(vec![CanonicalReading {
                reading,
                device_ts,
                device,
                location: None,
                hint,
            }])
        }
        other => Err(ParseError::UnsupportedAttribute(format!("type {other}"))),
    }
}

/// `brith` is `YYYYMMDD`; kiosks have shipped garbage here, so a bad
/// date degrades to no birth date rather than rejecting the vital sign.
fn hint_of(data: &Data) -> Option<PatientHint> {
    let citizen_id = data.citiz.clone()?;
    Some(PatientHint {
        citizen_id,
        name_th: data.name_th.clone(),
        name_en: data.name_en.clone(),
        birth_date: data
            .brith
            .as_deref()
            .and_then(|raw| NaiveDate::parse_from_str(raw, "%Y%m%d").ok()),
        gender: data
            .gender
            .as_deref()
            .map(Gender::from_device_str)
            .unwrap_or(Gender::Unknown),
    })
}

#[derive(Debug, Deserialize)]
struct BpValue {
    bp_high: f64,
    bp_low: f64,
    pr: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GlucoseValue {
    blood_glucose: f64,
    marker: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WeightValue {
    weight: f64,
    resistance: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct TempValue {
    #[serde(rename = "Temp")]
    temp: f64,
    mode: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Spo2Value {
    spo2: f64,
    pulse: Option<f64>,
    pi: Option<f64>,
}

fn field_err(e: serde_json::Error) -> ParseError {
    ParseError::MissingField(e.to_string())
}

fn parse_value(attribute: &str, value: &Value) -> Result<Reading, ParseError> {
    match attribute {
        "WBP_JUMPER" => {
            let v: BpValue = serde_json::from_value(value.clone()).map_err(field_err)?;
            Ok(Reading::BloodPressure {
                systolic: v.bp_high,
                diastolic: v.bp_low,
                pulse: v.pr,
            })
        }
        "CONTOUR" => {
            let v: GlucoseValue = serde_json::from_value(value.clone()).map_err(field_err)?;
            Ok(Reading::BloodSugar {
                value: v.blood_glucose,
                marker: v
                    .marker
                    .as_deref()
                    .map(GlucoseMarker::from_device_str)
                    .unwrap_or(GlucoseMarker::Unknown),
            })
        }
        "BodyScale_JUMPER" => {
            let v: WeightValue = serde_json::from_value(value.clone()).map_err(field_err)?;
            Ok(Reading::Weight {
                value_kg: v.weight,
                impedance_ohm: v.resistance,
            })
        }
        "TEMO_Jumper" => {
            let v: TempValue = serde_json::from_value(value.clone()).map_err(field_err)?;
            Ok(Reading::BodyTemperature {
                value_c: v.temp,
                site: v
                    .mode
                    .as_deref()
                    .map(TemperatureSite::from_device_str)
                    .unwrap_or(TemperatureSite::Other),
            })
        }
        "Oximeter_JUMPER" => {
            let v: Spo2Value = serde_json::from_value(value.clone()).map_err(field_err)?;
            Ok(Reading::Spo2 {
                spo2: v.spo2,
                pulse: v.pulse,
                perfusion_index: v.pi,
            })
        }
        other => Err(ParseError::UnsupportedAttribute(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ReadingKind;

    const BP_REPORT: &str = r#"{
        "from":"HV01","to":"CLOUD","time":1836942771,
        "mac":"e4:5f:01:aa:bb:cc","IMEI":"520000000000001",
        "type":"reportAttribute",
        "data":{
            "attribute":"WBP_JUMPER",
            "citiz":"3570300400000",
            "nameTH":"สมชาย ใจดี","nameEN":"Somchai Jaidee",
            "brith":"19600101","gender":"1",
            "value":{"bp_high":120,"bp_low":78,"pr":70}}}"#;

    #[test]
    fn blood_pressure_with_hint() {
        let readings = parse(BP_REPORT.as_bytes()).unwrap();
        assert_eq!(readings.len(), 1);

        let r = &readings[0];
        assert_eq!(r.kind(), ReadingKind::BloodPressure);
        assert_eq!(r.device.family, DeviceFamily::QubeVital);
        assert_eq!(r.device.id, "e4:5f:01:aa:bb:cc");

        let hint = r.hint.as_ref().unwrap();
        assert_eq!(hint.citizen_id, "3570300400000");
        assert_eq!(hint.name_en.as_deref(), Some("Somchai Jaidee"));
        assert_eq!(hint.gender, Gender::Male);
        assert_eq!(
            hint.birth_date,
            NaiveDate::from_ymd_opt(1960, 1, 1)
        );
    }

    #[test]
    fn temperature_report() {
        let payload = r#"{
            "mac":"e4:5f:01:aa:bb:cc","type":"reportAttribute","time":1836942771,
            "data":{"attribute":"TEMO_Jumper","citiz":"1100500999999",
                "value":{"Temp":36.9,"mode":"Head"}}}"#;
        let readings = parse(payload.as_bytes()).unwrap();
        match readings[0].reading {
            Reading::BodyTemperature { value_c, site } => {
                assert_eq!(value_c, 36.9);
                assert_eq!(site, TemperatureSite::Head);
            }
            ref other => panic!("wrong reading: {other:?}"),
        }
    }

    #[test]
    fn bad_birth_date_degrades() {
        let payload = r#"{
            "mac":"m","type":"reportAttribute","time":1836942771,
            "data":{"attribute":"CONTOUR","citiz":"123","brith":"not-a-date",
                "value":{"blood_glucose":104,"marker":"fasting"}}}"#;
        let readings = parse(payload.as_bytes()).unwrap();
        let hint = readings[0].hint.as_ref().unwrap();
        assert!(hint.birth_date.is_none());
        assert!(matches!(
            readings[0].reading,
            Reading::BloodSugar {
                marker: GlucoseMarker::Fasting,
                ..
            }
        ));
    }

    #[test]
    fn missing_citiz_means_no_hint() {
        let payload = r#"{
            "mac":"m","type":"reportAttribute","time":1836942771,
            "data":{"attribute":"Oximeter_JUMPER","value":{"spo2":97,"pulse":66}}}"#;
        let readings = parse(payload.as_bytes()).unwrap();
        assert!(readings[0].hint.is_none());
    }

    #[test]
    fn kiosk_heartbeat() {
        let payload = r#"{"type":"HB_Msg","mac":"e4:5f:01:aa:bb:cc","time":1836942000}"#;
        let readings = parse(payload.as_bytes()).unwrap();
        assert!(readings[0].is_heartbeat());
    }

    #[test]
    fn unknown_attribute_reported() {
        let payload = r#"{
            "mac":"m","type":"reportAttribute",
            "data":{"attribute":"XRAY","value":{}}}"#;
        let err = parse(payload.as_bytes()).unwrap_err();
        assert_eq!(err.kind(), "unsupported_attribute");
    }
}
