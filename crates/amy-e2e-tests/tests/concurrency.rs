//! Concurrency properties: snapshot monotonicity and idempotent
//! auto-provisioning under parallel message handling.

mod helpers;

use std::sync::Arc;

use helpers::TestHarness;

use amy_protocol::ReadingKind;

fn bp_message(scan_time: i64, systolic: u32) -> String {
    format!(
        r#"{{"mac":"08:F9:E0:D1:F7:B4","type":"reportAttribute","time":{scan_time},
            "data":{{"attribute":"BP_BIOLIGTH","mac":"08:F9:E0:D1:F7:B4",
                "value":{{"device_list":[
                    {{"scan_time":{scan_time},"ble_addr":"d616f9641622",
                     "bp_high":{systolic},"bp_low":80,"PR":70}}]}}}}}}"#
    )
}

/// Whatever order concurrent writes land in, the final snapshot is
/// the one with the maximum device timestamp.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_writes_keep_snapshot_monotonic() {
    let harness = Arc::new(TestHarness::new());
    let patient = harness.store.add_patient(None);
    harness
        .store
        .link_device(ReadingKind::BloodPressure, "d616f9641622", &patient);

    let base = 1_836_942_000i64;
    let offsets = [5i64, 40, 2, 17, 33, 8, 21, 12, 29, 36];
    let max_offset = *offsets.iter().max().unwrap();

    let mut tasks = tokio::task::JoinSet::new();
    for offset in offsets {
        let harness = harness.clone();
        tasks.spawn(async move {
            let payload = bp_message(base + offset, 100 + offset as u32);
            harness.process("dusun_sub", &payload).await;
        });
    }
    while tasks.join_next().await.is_some() {}

    assert_eq!(
        harness.store.history_count("blood_pressure_histories"),
        offsets.len()
    );
    let snapshot = harness.store.snapshot(&patient, "last_blood_pressure").unwrap();
    assert_eq!(snapshot.device_ts.timestamp(), base + max_offset);
}

/// Every stored reading has exactly one audit record.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_accepted_reading_audits_once() {
    let harness = Arc::new(TestHarness::new());
    let patient = harness.store.add_patient(None);
    harness
        .store
        .link_device(ReadingKind::BloodPressure, "d616f9641622", &patient);

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..20i64 {
        let harness = harness.clone();
        tasks.spawn(async move {
            harness
                .process("dusun_sub", &bp_message(1_836_942_000 + i, 120))
                .await;
        });
    }
    while tasks.join_next().await.is_some() {}

    let histories = harness.store.histories("blood_pressure_histories");
    let audits = harness.store.audits();
    assert_eq!(histories.len(), 20);
    assert_eq!(audits.len(), 20);

    let mut audited: Vec<&str> = audits.iter().map(|a| a.history_record_id.as_str()).collect();
    audited.sort_unstable();
    audited.dedup();
    assert_eq!(audited.len(), 20, "each audit references a distinct history record");
}

/// Concurrent first-sightings of one citizen id converge on a
/// single unregistered patient.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_sightings_create_one_patient() {
    let harness = Arc::new(TestHarness::new());

    let payload = r#"{
        "mac":"e4:5f:01:aa:bb:cc","type":"reportAttribute","time":1836942771,
        "data":{
            "attribute":"WBP_JUMPER","citiz":"3570300400000",
            "nameTH":"สมชาย","nameEN":"Somchai","brith":"19600101","gender":"1",
            "value":{"bp_high":120,"bp_low":78,"pr":70}}}"#;

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let harness = harness.clone();
        tasks.spawn(async move {
            harness.process("CM4_BLE_GW_TX", payload).await;
        });
    }
    while tasks.join_next().await.is_some() {}

    // One patient, ten history records, all pointing at it.
    assert_eq!(harness.store.patient_count(), 1);
    let histories = harness.store.histories("blood_pressure_histories");
    assert_eq!(histories.len(), 10);

    let first = histories[0].record.patient_id.clone().unwrap();
    assert!(
        histories
            .iter()
            .all(|h| h.record.patient_id.as_deref() == Some(first.as_str()))
    );
    assert!(harness.store.patient(&first).unwrap().unregistered);
}
