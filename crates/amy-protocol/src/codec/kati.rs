//! Kati Watch payloads (`iMEDE_watch/<subtopic>`).
//!
//! Subtopics are matched case-insensitively on the final segment; the
//! firmware is known to publish both `sos` and `SOS`. One envelope
//! struct covers every subtopic — the watch reuses field names across
//! message types and omits whatever does not apply.

use chrono::{DateTime, Duration, NaiveDateTime, NaiveTime, Utc};
use serde::Deserialize;

use crate::identity::{DeviceFamily, DeviceIdentity};
use crate::reading::{
    CanonicalReading, EmergencyKind, GeoLocation, Reading, SleepPhase, SleepSegment,
    TemperatureSite,
};
use crate::topics;

use super::{ParseError, ts_from_epoch};

/// Timestamp format of the `timeStamps` field. The firmware does not
/// state a timezone; treated as UTC.
const TIMESTAMP_FMT: &str = "%d/%m/%Y %H:%M:%S";

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "IMEI")]
    imei: String,
    #[serde(rename = "timeStamps")]
    time_stamps: Option<String>,
    #[serde(rename = "heartRate")]
    heart_rate: Option<f64>,
    #[serde(rename = "bloodPressure")]
    blood_pressure: Option<BloodPressure>,
    #[serde(rename = "bodyTemperature")]
    body_temperature: Option<f64>,
    #[serde(rename = "spO2")]
    spo2: Option<f64>,
    battery: Option<f64>,
    #[serde(rename = "signalGSM")]
    signal_gsm: Option<i64>,
    satellites: Option<i64>,
    #[serde(rename = "workingMode")]
    working_mode: Option<i64>,
    step: Option<u64>,
    location: Option<Location>,
    status: Option<String>,
    sleep: Option<Sleep>,
    data: Option<Vec<VitalEntry>>,
}

#[derive(Debug, Deserialize)]
struct BloodPressure {
    bp_sys: f64,
    bp_dia: f64,
}

#[derive(Debug, Deserialize)]
struct Location {
    #[serde(rename = "GPS")]
    gps: Option<Gps>,
    #[serde(rename = "WiFi")]
    wifi: Option<String>,
    #[serde(rename = "LBS")]
    lbs: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct Gps {
    latitude: f64,
    longitude: f64,
    speed: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct Sleep {
    #[serde(rename = "timeStamps")]
    time_stamps: Option<String>,
    time: String,
    data: String,
    num: usize,
}

#[derive(Debug, Deserialize)]
struct VitalEntry {
    timestamp: i64,
    #[serde(rename = "heartRate")]
    heart_rate: Option<f64>,
    #[serde(rename = "bloodPressure")]
    blood_pressure: Option<BloodPressure>,
    #[serde(rename = "bodyTemperature")]
    body_temperature: Option<f64>,
    #[serde(rename = "spO2")]
    spo2: Option<f64>,
}

pub fn parse(topic: &str, payload: &[u8]) -> Result<Vec<CanonicalReading>, ParseError> {
    let subtopic = topics::kati_subtopic(topic)
        .ok_or_else(|| ParseError::UnsupportedTopic(topic.to_string()))?;
    let env: Envelope =
        serde_json::from_slice(payload).map_err(|e| ParseError::MalformedJson(e.to_string()))?;

    match subtopic.to_ascii_lowercase().as_str() {
        "vitalsign" => vital_sign(&env),
        "ap55" => ap55(&env),
        "hb" => heartbeat(&env),
        "location" => location(&env),
        "sleepdata" => sleep_summary(&env),
        "sos" => emergency(&env, EmergencyKind::Sos),
        "falldown" => emergency(&env, EmergencyKind::Fall),
        "onlinetrigger" => online_trigger(&env),
        _ => Err(ParseError::UnsupportedTopic(topic.to_string())),
    }
}

fn identity(env: &Envelope) -> DeviceIdentity {
    DeviceIdentity::new(env.imei.clone(), DeviceFamily::KatiWatch)
}

fn parse_time_stamps(raw: &str) -> Result<DateTime<Utc>, ParseError> {
    NaiveDateTime::parse_from_str(raw, TIMESTAMP_FMT)
        .map(|dt| dt.and_utc())
        .map_err(|_| ParseError::MalformedJson(format!("bad timeStamps {raw:?}")))
}

fn gps_of(env: &Envelope) -> Option<GeoLocation> {
    env.location.as_ref().and_then(|l| l.gps.as_ref()).map(|g| GeoLocation {
        lat: g.latitude,
        lon: g.longitude,
        speed: g.speed,
    })
}

/// One `VitalSign` message fans out to up to four readings sharing the
/// message timestamp and IMEI.
fn vital_sign(env: &Envelope) -> Result<Vec<CanonicalReading>, ParseError> {
    let raw_ts = env
        .time_stamps
        .as_deref()
        .ok_or_else(|| ParseError::MissingField("timeStamps".into()))?;
    let device_ts = Some(parse_time_stamps(raw_ts)?);
    let device = identity(env);
    let gps = gps_of(env);

    let mut readings = Vec::new();
    let mut push = |reading: Reading| {
        readings.push(CanonicalReading {
            reading,
            device_ts,
            device: device.clone(),
            location: gps,
            hint: None,
        });
    };

    if let Some(bpm) = env.heart_rate {
        push(Reading::HeartRate { bpm });
    }
    if let Some(bp) = &env.blood_pressure {
        push(Reading::BloodPressure {
            systolic: bp.bp_sys,
            diastolic: bp.bp_dia,
            pulse: None,
        });
    }
    if let Some(value_c) = env.body_temperature {
        push(Reading::BodyTemperature {
            value_c,
            site: TemperatureSite::Other,
        });
    }
    if let Some(spo2) = env.spo2 {
        push(Reading::Spo2 {
            spo2,
            pulse: None,
            perfusion_index: None,
        });
    }

    if readings.is_empty() {
        return Err(ParseError::MissingField("vital sign values".into()));
    }
    Ok(readings)
}

/// AP55 batch: one vitals tuple per `data[]` entry, each with its own
/// epoch timestamp, expanded to one reading per present field.
fn ap55(env: &Envelope) -> Result<Vec<CanonicalReading>, ParseError> {
    let entries = env
        .data
        .as_ref()
        .filter(|d| !d.is_empty())
        .ok_or_else(|| ParseError::MissingField("data".into()))?;
    let device = identity(env);

    let mut readings = Vec::new();
    for entry in entries {
        let device_ts = Some(ts_from_epoch(entry.timestamp)?);
        let mut push = |reading: Reading| {
            readings.push(CanonicalReading {
                reading,
                device_ts,
                device: device.clone(),
                location: None,
                hint: None,
            });
        };

        if let Some(bpm) = entry.heart_rate {
            push(Reading::HeartRate { bpm });
        }
        if let Some(bp) = &entry.blood_pressure {
            push(Reading::BloodPressure {
                systolic: bp.bp_sys,
                diastolic: bp.bp_dia,
                pulse: None,
            });
        }
        if let Some(spo2) = entry.spo2 {
            push(Reading::Spo2 {
                spo2,
                pulse: None,
                perfusion_index: None,
            });
        }
        if let Some(value_c) = entry.body_temperature {
            push(Reading::BodyTemperature {
                value_c,
                site: TemperatureSite::Other,
            });
        }
    }

    if readings.is_empty() {
        return Err(ParseError::MissingField("data entries".into()));
    }
    Ok(readings)
}

/// `hb` status ping; carries an extra step counter when the watch has
/// accumulated steps since the last ping.
fn heartbeat(env: &Envelope) -> Result<Vec<CanonicalReading>, ParseError> {
    let device = identity(env);
    let device_ts = env
        .time_stamps
        .as_deref()
        .map(parse_time_stamps)
        .transpose()?;

    let mut readings = vec![CanonicalReading {
        reading: Reading::Heartbeat {
            battery_pct: env.battery,
            gsm_signal: env.signal_gsm,
            satellites: env.satellites,
            working_mode: env.working_mode,
        },
        device_ts,
        device: device.clone(),
        location: None,
        hint: None,
    }];

    if let Some(steps) = env.step {
        readings.push(CanonicalReading {
            reading: Reading::StepCount { steps },
            device_ts,
            device,
            location: None,
            hint: None,
        });
    }
    Ok(readings)
}

fn location(env: &Envelope) -> Result<Vec<CanonicalReading>, ParseError> {
    let loc = env
        .location
        .as_ref()
        .ok_or_else(|| ParseError::MissingField("location".into()))?;
    let device_ts = env
        .time_stamps
        .as_deref()
        .map(parse_time_stamps)
        .transpose()?;
    let gps = gps_of(env);

    Ok(vec![CanonicalReading {
        reading: Reading::Location {
            gps,
            cell: loc.lbs.clone(),
            wifi_raw: loc.wifi.clone(),
        },
        device_ts,
        device: identity(env),
        location: gps,
        hint: None,
    }])
}

fn emergency(env: &Envelope, kind: EmergencyKind) -> Result<Vec<CanonicalReading>, ParseError> {
    let device_ts = env
        .time_stamps
        .as_deref()
        .map(parse_time_stamps)
        .transpose()?;
    let gps = gps_of(env);

    Ok(vec![CanonicalReading {
        reading: Reading::Emergency {
            kind,
            location: gps,
        },
        device_ts,
        device: identity(env),
        location: gps,
        hint: None,
    }])
}

/// `onlineTrigger` only matters when the watch went offline; the online
/// edge is dropped (empty result).
fn online_trigger(env: &Envelope) -> Result<Vec<CanonicalReading>, ParseError> {
    match env.status.as_deref() {
        Some("offline") => emergency(env, EmergencyKind::Offline),
        _ => Ok(Vec::new()),
    }
}

/// Decode the per-minute sleep string into phase segments.
///
/// `sleep.time` is the `HHMM@HHMM` window; `sleep.data` has one digit
/// per minute ('0' awake, '1' light, '2' deep, '3' rem); `sleep.num`
/// must equal the digit count.
fn sleep_summary(env: &Envelope) -> Result<Vec<CanonicalReading>, ParseError> {
    let sleep = env
        .sleep
        .as_ref()
        .ok_or_else(|| ParseError::MissingField("sleep".into()))?;

    if sleep.num != sleep.data.len() {
        return Err(ParseError::MalformedJson(format!(
            "sleep.num {} != data length {}",
            sleep.num,
            sleep.data.len()
        )));
    }

    let raw_ts = sleep
        .time_stamps
        .as_deref()
        .or(env.time_stamps.as_deref())
        .ok_or_else(|| ParseError::MissingField("sleep.timeStamps".into()))?;
    let reported_at = parse_time_stamps(raw_ts)?;

    let (start_raw, end_raw) = sleep
        .time
        .split_once('@')
        .ok_or_else(|| ParseError::MalformedJson(format!("bad sleep.time {:?}", sleep.time)))?;
    let start_time = parse_hhmm(start_raw)?;
    let end_time = parse_hhmm(end_raw)?;

    // The window ends on the reporting date; a start later in the day
    // than the end means the night began on the previous date.
    let end_ts = reported_at
        .date_naive()
        .and_time(end_time)
        .and_utc();
    let start_naive = reported_at.date_naive().and_time(start_time);
    let start_ts = if start_time > end_time {
        (start_naive - Duration::days(1)).and_utc()
    } else {
        start_naive.and_utc()
    };

    let mut segments: Vec<SleepSegment> = Vec::new();
    for c in sleep.data.chars() {
        let phase = match c {
            '0' => SleepPhase::Awake,
            '1' => SleepPhase::Light,
            '2' => SleepPhase::Deep,
            '3' => SleepPhase::Rem,
            other => {
                return Err(ParseError::MalformedJson(format!(
                    "unknown sleep phase digit {other:?}"
                )));
            }
        };
        match segments.last_mut() {
            Some(last) if last.phase == phase => last.duration_s += 60,
            _ => segments.push(SleepSegment {
                phase,
                duration_s: 60,
            }),
        }
    }

    if segments.is_empty() {
        return Err(ParseError::MissingField("sleep.data".into()));
    }

    Ok(vec![CanonicalReading {
        reading: Reading::SleepSummary {
            start_ts,
            end_ts,
            segments,
        },
        device_ts: Some(end_ts),
        device: identity(env),
        location: None,
        hint: None,
    }])
}

fn parse_hhmm(raw: &str) -> Result<NaiveTime, ParseError> {
    NaiveTime::parse_from_str(raw, "%H%M")
        .map_err(|_| ParseError::MalformedJson(format!("bad HHMM time {raw:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::ReadingKind;

    fn parse_sub(subtopic: &str, payload: &str) -> Result<Vec<CanonicalReading>, ParseError> {
        parse(&format!("iMEDE_watch/{subtopic}"), payload.as_bytes())
    }

    #[test]
    fn vital_sign_fans_out() {
        let payload = r#"{
            "IMEI":"865067123456789",
            "heartRate":72,
            "bloodPressure":{"bp_sys":122,"bp_dia":74},
            "bodyTemperature":36.6,
            "spO2":97,
            "location":{"GPS":{"latitude":13.7563,"longitude":100.5018}},
            "timeStamps":"16/06/2025 12:30:45"}"#;
        let readings = parse_sub("VitalSign", payload).unwrap();
        assert_eq!(readings.len(), 4);

        let kinds: Vec<ReadingKind> = readings.iter().map(CanonicalReading::kind).collect();
        assert_eq!(
            kinds,
            vec![
                ReadingKind::HeartRate,
                ReadingKind::BloodPressure,
                ReadingKind::BodyTemperature,
                ReadingKind::Spo2,
            ]
        );

        for r in &readings {
            assert_eq!(r.device.id, "865067123456789");
            assert_eq!(r.location.unwrap().lat, 13.7563);
            // 16 Jun 2025 12:30:45 UTC
            assert_eq!(r.device_ts.unwrap().timestamp(), 1_750_077_045);
        }
    }

    #[test]
    fn ap55_batch_expands_per_entry() {
        let payload = r#"{
            "IMEI":"865067123456789",
            "timeStamps":"31/01/2025 13:47:36",
            "num_datas":2,
            "data":[
                {"timestamp":1738331256,"heartRate":70,"bloodPressure":{"bp_sys":118,"bp_dia":76},"spO2":96,"bodyTemperature":36.4},
                {"timestamp":1738331316,"heartRate":74,"bloodPressure":{"bp_sys":121,"bp_dia":79},"spO2":97,"bodyTemperature":36.5}
            ]}"#;
        let readings = parse_sub("AP55", payload).unwrap();
        assert_eq!(readings.len(), 8);
        assert_eq!(readings[0].device_ts.unwrap().timestamp(), 1_738_331_256);
        assert_eq!(readings[4].device_ts.unwrap().timestamp(), 1_738_331_316);
    }

    #[test]
    fn hb_with_steps() {
        let payload = r#"{
            "IMEI":"865067123456789",
            "battery":58,"signalGSM":80,"satellites":4,"workingMode":2,
            "step":4213,
            "timeStamps":"16/06/2025 06:00:00"}"#;
        let readings = parse_sub("hb", payload).unwrap();
        assert_eq!(readings.len(), 2);
        assert!(readings[0].is_heartbeat());
        assert!(matches!(
            readings[1].reading,
            Reading::StepCount { steps: 4213 }
        ));
    }

    #[test]
    fn hb_without_steps() {
        let payload = r#"{"IMEI":"865067123456789","battery":90}"#;
        let readings = parse_sub("hb", payload).unwrap();
        assert_eq!(readings.len(), 1);
        assert!(readings[0].is_heartbeat());
    }

    #[test]
    fn sos_is_case_insensitive() {
        let payload = r#"{
            "IMEI":"865067123456789","status":"SOS",
            "location":{"GPS":{"latitude":13.75,"longitude":100.5}}}"#;
        for sub in ["sos", "SOS"] {
            let readings = parse_sub(sub, payload).unwrap();
            assert_eq!(readings.len(), 1);
            assert_eq!(readings[0].emergency_kind(), Some(EmergencyKind::Sos));
            assert!(readings[0].location.is_some());
            // No timestamp on SOS frames — the writer will stamp it.
            assert!(readings[0].device_ts.is_none());
        }
    }

    #[test]
    fn fall_down() {
        let payload = r#"{"IMEI":"865067123456789","status":"FALL DOWN"}"#;
        let readings = parse_sub("fallDown", payload).unwrap();
        assert_eq!(readings[0].emergency_kind(), Some(EmergencyKind::Fall));
    }

    #[test]
    fn online_trigger_offline_only() {
        let offline = r#"{"IMEI":"865067123456789","status":"offline"}"#;
        let readings = parse_sub("onlineTrigger", offline).unwrap();
        assert_eq!(readings[0].emergency_kind(), Some(EmergencyKind::Offline));

        let online = r#"{"IMEI":"865067123456789","status":"online"}"#;
        assert!(parse_sub("onlineTrigger", online).unwrap().is_empty());
    }

    #[test]
    fn location_message() {
        let payload = r#"{
            "IMEI":"865067123456789",
            "timeStamps":"16/06/2025 12:00:00",
            "location":{
                "GPS":{"latitude":13.75,"longitude":100.5,"speed":1.2},
                "WiFi":"aa:bb:cc|-60",
                "LBS":{"mcc":520,"mnc":3,"lac":1001,"cid":44021}}}"#;
        let readings = parse_sub("location", payload).unwrap();
        match &readings[0].reading {
            Reading::Location { gps, cell, wifi_raw } => {
                assert_eq!(gps.unwrap().speed, Some(1.2));
                assert_eq!(cell.as_ref().unwrap()["mcc"], 520);
                assert_eq!(wifi_raw.as_deref(), Some("aa:bb:cc|-60"));
            }
            other => panic!("wrong reading: {other:?}"),
        }
    }

    #[test]
    fn sleep_data_groups_segments() {
        // 2 min awake, 3 min light, 2 min deep, 1 min rem, 2 min light
        let payload = r#"{
            "IMEI":"865067123456789",
            "timeStamps":"16/06/2025 07:01:00",
            "sleep":{"time":"2230@0700","data":"0011122312","num":10}}"#;
        let readings = parse_sub("sleepdata", payload).unwrap();
        match &readings[0].reading {
            Reading::SleepSummary {
                start_ts,
                end_ts,
                segments,
            } => {
                assert_eq!(
                    segments.as_slice(),
                    &[
                        SleepSegment { phase: SleepPhase::Awake, duration_s: 120 },
                        SleepSegment { phase: SleepPhase::Light, duration_s: 180 },
                        SleepSegment { phase: SleepPhase::Deep, duration_s: 120 },
                        SleepSegment { phase: SleepPhase::Rem, duration_s: 60 },
                        SleepSegment { phase: SleepPhase::Light, duration_s: 120 },
                    ]
                );
                // Window crosses midnight: starts on the 15th, ends on the 16th.
                assert!(start_ts < end_ts);
                assert_eq!(end_ts.format("%H:%M").to_string(), "07:00");
            }
            other => panic!("wrong reading: {other:?}"),
        }
    }

    #[test]
    fn sleep_num_mismatch_rejected() {
        let payload = r#"{
            "IMEI":"865067123456789",
            "timeStamps":"16/06/2025 07:01:00",
            "sleep":{"time":"2230@0700","data":"0011","num":10}}"#;
        let err = parse_sub("sleepdata", payload).unwrap_err();
        assert_eq!(err.kind(), "malformed_json");
    }

    #[test]
    fn unknown_subtopic_rejected() {
        let err = parse_sub("discofever", r#"{"IMEI":"1"}"#).unwrap_err();
        assert_eq!(err.kind(), "unsupported_topic");
    }

    #[test]
    fn missing_imei_is_malformed() {
        let err = parse_sub("hb", r#"{"battery":1}"#).unwrap_err();
        assert_eq!(err.kind(), "malformed_json");
    }
}
