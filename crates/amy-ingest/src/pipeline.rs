//! Per-message processing: codec → resolver → writer → flow events.
//!
//! Each reading extracted from a message gets its own flow id and the
//! event prefix `received → parsed → resolved → snapshot_written →
//! history_written`, with `rejected` terminating the chain on failure
//! and `emitted_emergency` appended for alerts. A message that fails
//! parsing gets a single flow id with `received → rejected`.

use std::sync::Arc;

use uuid::Uuid;

use amy_protocol::{
    CanonicalReading, DeviceFamily, FlowEvent, FlowStatus, FlowStep, codec, topics,
};

use crate::dataflow::EventSink;
use crate::emergency::priority_of;
use crate::resolver::{PatientResolver, Resolution};
use crate::store::StoreError;
use crate::writer::{CanonicalWriter, SnapshotOutcome};

pub struct Pipeline {
    resolver: PatientResolver,
    writer: CanonicalWriter,
    events: Arc<dyn EventSink>,
}

impl Pipeline {
    pub fn new(
        resolver: PatientResolver,
        writer: CanonicalWriter,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            resolver,
            writer,
            events,
        }
    }

    /// Process one inbound MQTT message end to end.
    ///
    /// Returns true when the message may be acknowledged to the broker.
    /// Transient write failures return false so QoS-1 redelivery can
    /// retry; unparseable or unresolvable messages are acknowledged —
    /// redelivery cannot fix those.
    pub async fn handle_message(&self, topic: &str, payload: &[u8]) -> bool {
        let family = match topics::classify(topic) {
            Some(family) => family,
            None => {
                tracing::debug!(topic = topic, "ignoring message on unknown topic");
                return true;
            }
        };

        let readings = match codec::parse(topic, payload) {
            Ok(readings) => readings,
            Err(e) => {
                tracing::warn!(topic = topic, error = %e, "rejected unparseable message");
                let flow_id = Uuid::now_v7();
                self.emit(FlowEvent::ok(flow_id, FlowStep::Received, family, topic, ""))
                    .await;
                self.emit(
                    FlowEvent::ok(flow_id, FlowStep::Rejected, family, topic, "")
                        .with_status(FlowStatus::Fail)
                        .with_reason(format!("{}: {e}", e.kind())),
                )
                .await;
                return true;
            }
        };

        if readings.is_empty() {
            tracing::debug!(topic = topic, "message carried nothing to process");
            return true;
        }

        let mut complete = true;
        for reading in readings {
            complete &= self.process_reading(topic, family, reading).await;
        }
        complete
    }

    async fn process_reading(
        &self,
        topic: &str,
        family: DeviceFamily,
        reading: CanonicalReading,
    ) -> bool {
        let flow_id = Uuid::now_v7();
        let device_id = reading.device.id.clone();
        let event =
            |step: FlowStep| FlowEvent::ok(flow_id, step, family, topic, &device_id);

        self.emit(event(FlowStep::Received)).await;
        self.emit(event(FlowStep::Parsed)).await;

        // Soft range check: persist anyway, but flag on the dashboard.
        if let Some(warning) = codec::range_warning(&reading.reading) {
            self.emit(
                event(FlowStep::Rejected)
                    .with_status(FlowStatus::Warning)
                    .with_reason(warning),
            )
            .await;
        }

        // Status traffic: surfaced on the flow stream, nothing stored.
        if reading.is_heartbeat() {
            tracing::debug!(
                family = family.as_str(),
                device_id = %device_id,
                "heartbeat observed"
            );
            return true;
        }

        let resolution = match self.resolver.resolve(&reading).await {
            Ok(resolution) => resolution,
            Err(e) => {
                self.reject(event(FlowStep::Rejected), "resolver_error", &e).await;
                return false;
            }
        };

        let patient_id = match &resolution {
            Resolution::Resolved(id) | Resolution::AutoProvisioned(id) => {
                self.emit(event(FlowStep::Resolved).with_patient(Some(id.as_str())))
                    .await;
                Some(id.clone())
            }
            Resolution::Unresolved if reading.is_emergency() => {
                // Safety requirement: emergencies are broadcast and
                // stored even when nobody matches the device.
                self.emit(
                    event(FlowStep::Resolved)
                        .with_patient(None)
                        .with_reason("unresolved"),
                )
                .await;
                None
            }
            Resolution::Unresolved => {
                tracing::debug!(
                    family = family.as_str(),
                    device_id = %device_id,
                    "dropping reading from unknown device"
                );
                self.emit(
                    event(FlowStep::Rejected)
                        .with_status(FlowStatus::Fail)
                        .with_reason("unresolved"),
                )
                .await;
                return true;
            }
        };

        let outcome = match self.writer.store(patient_id.as_deref(), &reading).await {
            Ok(outcome) => outcome,
            Err(e) => {
                // QoS-1 redelivery will retry the message later.
                let label = match e {
                    StoreError::Timeout(_) => "write_timeout",
                    _ => "store_error",
                };
                self.reject(
                    event(FlowStep::Rejected).with_patient(patient_id.as_deref()),
                    label,
                    &e,
                )
                .await;
                return false;
            }
        };

        match outcome.snapshot {
            SnapshotOutcome::Applied => {
                self.emit(
                    event(FlowStep::SnapshotWritten).with_patient(patient_id.as_deref()),
                )
                .await;
            }
            SnapshotOutcome::Stale => {
                self.emit(
                    event(FlowStep::Rejected)
                        .with_status(FlowStatus::Warning)
                        .with_patient(patient_id.as_deref())
                        .with_reason("snapshot_stale"),
                )
                .await;
            }
            SnapshotOutcome::Failed => {
                self.emit(
                    event(FlowStep::Rejected)
                        .with_status(FlowStatus::Warning)
                        .with_patient(patient_id.as_deref())
                        .with_reason("snapshot_failed"),
                )
                .await;
            }
            SnapshotOutcome::Skipped => {}
        }

        self.emit(event(FlowStep::HistoryWritten).with_patient(patient_id.as_deref()))
            .await;

        if let Some(kind) = outcome.emergency {
            let priority = priority_of(kind);
            tracing::info!(
                family = family.as_str(),
                device_id = %device_id,
                patient_id = ?patient_id,
                priority = priority.as_str(),
                "emergency alert stored and broadcast"
            );
            self.emit(
                event(FlowStep::EmittedEmergency)
                    .with_patient(patient_id.as_deref())
                    .with_reason(priority.as_str()),
            )
            .await;
        }
        true
    }

    async fn reject(&self, event: FlowEvent, label: &str, error: &StoreError) {
        tracing::error!(error = %error, "{label}");
        self.emit(
            event
                .with_status(FlowStatus::Fail)
                .with_reason(format!("{label}: {error}")),
        )
        .await;
    }

    async fn emit(&self, event: FlowEvent) {
        self.events.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataflow::MemoryEventSink;
    use crate::store::MemoryStore;
    use crate::writer::WriterSettings;
    use amy_protocol::ReadingKind;

    fn pipeline_over(
        store: Arc<MemoryStore>,
        sink: Arc<MemoryEventSink>,
    ) -> Pipeline {
        Pipeline::new(
            PatientResolver::new(store.clone(), 60),
            CanonicalWriter::new(store, WriterSettings::default()),
            sink,
        )
    }

    fn steps_of(events: &[FlowEvent]) -> Vec<FlowStep> {
        events.iter().map(|e| e.step).collect()
    }

    const AVA4_BP: &str = r#"{
        "from":"BLE","to":"CLOUD","time":1836942771,
        "deviceCode":"08:F9:E0:D1:F7:B4","mac":"08:F9:E0:D1:F7:B4",
        "type":"reportAttribute","device":"WBP BIOLIGHT",
        "data":{"attribute":"BP_BIOLIGTH","mac":"08:F9:E0:D1:F7:B4",
            "value":{"device_list":[
                {"scan_time":1836942771,"ble_addr":"d616f9641622",
                 "bp_high":137,"bp_low":95,"PR":74}]}}}"#;

    #[tokio::test]
    async fn accepted_reading_emits_full_prefix() {
        let store = Arc::new(MemoryStore::new());
        let patient = store.add_patient(None);
        store.link_device(ReadingKind::BloodPressure, "d616f9641622", &patient);
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store.clone(), sink.clone());

        pipeline.handle_message("dusun_sub", AVA4_BP.as_bytes()).await;

        let events = sink.events();
        assert_eq!(
            steps_of(&events),
            vec![
                FlowStep::Received,
                FlowStep::Parsed,
                FlowStep::Resolved,
                FlowStep::SnapshotWritten,
                FlowStep::HistoryWritten,
            ]
        );
        // One flow id across the whole chain.
        assert!(events.iter().all(|e| e.flow_id == events[0].flow_id));
        assert_eq!(events[2].patient_id.as_deref(), Some(patient.as_str()));
        assert_eq!(store.history_count("blood_pressure_histories"), 1);
        assert_eq!(store.audits().len(), 1);
    }

    #[tokio::test]
    async fn malformed_message_is_rejected_under_one_flow() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store, sink.clone());

        pipeline.handle_message("dusun_sub", b"not-json").await;

        let events = sink.events();
        assert_eq!(steps_of(&events), vec![FlowStep::Received, FlowStep::Rejected]);
        assert_eq!(events[1].status, FlowStatus::Fail);
        assert!(events[1].reason.as_deref().unwrap().starts_with("malformed_json"));
        assert_eq!(events[0].flow_id, events[1].flow_id);
    }

    #[tokio::test]
    async fn unknown_device_reading_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store.clone(), sink.clone());

        pipeline.handle_message("dusun_sub", AVA4_BP.as_bytes()).await;

        let events = sink.events();
        assert_eq!(
            steps_of(&events),
            vec![FlowStep::Received, FlowStep::Parsed, FlowStep::Rejected]
        );
        assert_eq!(events[2].reason.as_deref(), Some("unresolved"));
        assert_eq!(store.history_count("blood_pressure_histories"), 0);
    }

    #[tokio::test]
    async fn unresolved_sos_is_stored_and_broadcast() {
        // Unknown IMEI: the SOS still lands in emergency_alarm.
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store.clone(), sink.clone());

        let payload = r#"{"IMEI":"865067999999999","status":"SOS",
            "location":{"GPS":{"latitude":13.75,"longitude":100.5}}}"#;
        pipeline
            .handle_message("iMEDE_watch/sos", payload.as_bytes())
            .await;

        let events = sink.events();
        assert_eq!(
            steps_of(&events),
            vec![
                FlowStep::Received,
                FlowStep::Parsed,
                FlowStep::Resolved,
                FlowStep::HistoryWritten,
                FlowStep::EmittedEmergency,
            ]
        );
        let resolved = &events[2];
        assert_eq!(resolved.patient_id, None);
        assert_eq!(resolved.reason.as_deref(), Some("unresolved"));
        assert_eq!(events[4].reason.as_deref(), Some("CRITICAL"));

        let alarms = store.histories("emergency_alarm");
        assert_eq!(alarms.len(), 1);
        assert!(alarms[0].record.patient_id.is_none());
    }

    #[tokio::test]
    async fn out_of_range_reading_is_stored_with_warning() {
        let store = Arc::new(MemoryStore::new());
        let patient = store.add_patient(None);
        store.link_device(ReadingKind::BloodPressure, "d616f9641622", &patient);
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store.clone(), sink.clone());

        let payload = AVA4_BP.replace("\"bp_high\":137", "\"bp_high\":290");
        pipeline.handle_message("dusun_sub", payload.as_bytes()).await;

        let events = sink.events();
        let warning = events
            .iter()
            .find(|e| e.status == FlowStatus::Warning)
            .expect("warning event");
        assert!(warning.reason.as_deref().unwrap().contains("systolic"));
        // Stored regardless.
        assert_eq!(store.history_count("blood_pressure_histories"), 1);
        assert!(events.iter().any(|e| e.step == FlowStep::HistoryWritten));
    }

    #[tokio::test]
    async fn heartbeat_stops_after_parsed() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store.clone(), sink.clone());

        let payload = r#"{"type":"HB_Msg","mac":"08:F9:E0:D1:F7:B4","time":1836942000}"#;
        pipeline
            .handle_message("ESP32_BLE_GW_TX", payload.as_bytes())
            .await;

        assert_eq!(
            steps_of(&sink.events()),
            vec![FlowStep::Received, FlowStep::Parsed]
        );
        assert_eq!(store.audits().len(), 0);
    }

    #[tokio::test]
    async fn kati_batch_gets_one_flow_per_reading() {
        // Two AP55 entries × four vitals = eight distinct flows.
        let store = Arc::new(MemoryStore::new());
        let patient = store.add_patient(None);
        store.link_watch("865067123456789", &patient);
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store.clone(), sink.clone());

        let payload = r#"{
            "IMEI":"865067123456789",
            "num_datas":2,
            "data":[
                {"timestamp":1738331256,"heartRate":70,"bloodPressure":{"bp_sys":118,"bp_dia":76},"spO2":96,"bodyTemperature":36.4},
                {"timestamp":1738331316,"heartRate":74,"bloodPressure":{"bp_sys":121,"bp_dia":79},"spO2":97,"bodyTemperature":36.5}
            ]}"#;
        pipeline
            .handle_message("iMEDE_watch/AP55", payload.as_bytes())
            .await;

        let events = sink.events();
        let flow_ids: std::collections::HashSet<_> =
            events.iter().map(|e| e.flow_id).collect();
        assert_eq!(flow_ids.len(), 8);

        // Per-flow prefix holds for every reading.
        for flow_id in flow_ids {
            assert_eq!(
                steps_of(&sink.flow(flow_id)),
                vec![
                    FlowStep::Received,
                    FlowStep::Parsed,
                    FlowStep::Resolved,
                    FlowStep::SnapshotWritten,
                    FlowStep::HistoryWritten,
                ]
            );
        }

        assert_eq!(store.audits().len(), 8);
        // Final snapshots come from the later entry.
        let hr = store.snapshot(&patient, "last_heart_rate").unwrap();
        assert_eq!(hr.device_ts.timestamp(), 1_738_331_316);
    }

    #[tokio::test]
    async fn stale_snapshot_emits_warning_not_snapshot_written() {
        // Late reading keeps history, snapshot unchanged.
        let store = Arc::new(MemoryStore::new());
        let patient = store.add_patient(None);
        store.link_device(ReadingKind::BloodPressure, "d616f9641622", &patient);
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store.clone(), sink.clone());

        pipeline.handle_message("dusun_sub", AVA4_BP.as_bytes()).await;
        let earlier = AVA4_BP.replace("\"scan_time\":1836942771", "\"scan_time\":1836942711");
        pipeline.handle_message("dusun_sub", earlier.as_bytes()).await;

        let events = sink.events();
        let stale: Vec<_> = events
            .iter()
            .filter(|e| e.reason.as_deref() == Some("snapshot_stale"))
            .collect();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].status, FlowStatus::Warning);

        assert_eq!(store.history_count("blood_pressure_histories"), 2);
        let snapshot = store.snapshot(&patient, "last_blood_pressure").unwrap();
        assert_eq!(snapshot.device_ts.timestamp(), 1_836_942_771);
    }

    #[tokio::test]
    async fn ack_decision_tracks_write_outcome() {
        let store = Arc::new(MemoryStore::new());
        let patient = store.add_patient(None);
        store.link_device(ReadingKind::BloodPressure, "d616f9641622", &patient);
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store.clone(), sink.clone());

        // Unparseable and unresolved messages are acked — redelivery
        // cannot fix them.
        assert!(pipeline.handle_message("dusun_sub", b"not-json").await);

        // A failed history insert leaves the message unacked.
        store.fail_next_histories(1);
        assert!(!pipeline.handle_message("dusun_sub", AVA4_BP.as_bytes()).await);

        // The redelivery succeeds and acks.
        assert!(pipeline.handle_message("dusun_sub", AVA4_BP.as_bytes()).await);
        assert_eq!(store.history_count("blood_pressure_histories"), 1);
    }

    #[tokio::test]
    async fn online_trigger_online_edge_is_silent() {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(MemoryEventSink::new());
        let pipeline = pipeline_over(store, sink.clone());

        let payload = r#"{"IMEI":"865067123456789","status":"online"}"#;
        pipeline
            .handle_message("iMEDE_watch/onlineTrigger", payload.as_bytes())
            .await;
        assert!(sink.events().is_empty());
    }
}
