//! In-memory store for tests.
//!
//! Mirrors the semantics `MongoStore` relies on (unique `citiz`,
//! single-document snapshot CAS) under one mutex, plus builder and
//! inspection helpers for test setup and assertions.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use amy_protocol::{Gender, PatientHint, ReadingKind};

use super::{
    AuditRecord, HistoryRecord, ProvisionOutcome, SnapshotValue, Store, StoreError,
};

/// One patient document as the tests see it.
#[derive(Debug, Clone, Default)]
pub struct PatientDoc {
    pub citizen_id: Option<String>,
    pub unregistered: bool,
    pub deleted: bool,
    pub name_th: Option<String>,
    pub name_en: Option<String>,
    pub birth_date: Option<chrono::NaiveDate>,
    pub gender: Option<Gender>,
    pub snapshots: HashMap<String, SnapshotValue>,
}

/// A stored history document with its generated id.
#[derive(Debug, Clone)]
pub struct StoredHistory {
    pub id: String,
    pub record: HistoryRecord,
}

#[derive(Default)]
struct Inner {
    patients: HashMap<String, PatientDoc>,
    device_slots: HashMap<(ReadingKind, String), String>,
    gateway_slots: HashMap<String, Vec<String>>,
    watch_imeis: HashMap<String, String>,
    qube_boxes: HashSet<String>,
    histories: HashMap<String, Vec<StoredHistory>>,
    audits: Vec<AuditRecord>,
    fail_snapshots: u32,
    fail_histories: u32,
}

/// In-memory implementation of the `Store` trait.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Test setup ────────────────────────────────────────────

    /// Insert a patient, returning its generated id.
    pub fn add_patient(&self, citizen_id: Option<&str>) -> String {
        let id = Uuid::now_v7().to_string();
        self.inner.lock().unwrap().patients.insert(
            id.clone(),
            PatientDoc {
                citizen_id: citizen_id.map(str::to_string),
                ..PatientDoc::default()
            },
        );
        id
    }

    pub fn mark_deleted(&self, patient_id: &str) {
        if let Some(p) = self.inner.lock().unwrap().patients.get_mut(patient_id) {
            p.deleted = true;
        }
    }

    /// Register a BLE sub-device MAC in the per-kind slot.
    pub fn link_device(&self, kind: ReadingKind, mac: &str, patient_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .device_slots
            .insert((kind, mac.to_string()), patient_id.to_string());
    }

    pub fn link_gateway(&self, mac: &str, patient_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .gateway_slots
            .entry(mac.to_string())
            .or_default()
            .push(patient_id.to_string());
    }

    pub fn link_watch(&self, imei: &str, patient_id: &str) {
        self.inner
            .lock()
            .unwrap()
            .watch_imeis
            .insert(imei.to_string(), patient_id.to_string());
    }

    pub fn add_qube_box(&self, mac: &str) {
        self.inner.lock().unwrap().qube_boxes.insert(mac.to_string());
    }

    /// Make the next `n` snapshot CAS calls fail with a transient error.
    pub fn fail_next_snapshots(&self, n: u32) {
        self.inner.lock().unwrap().fail_snapshots = n;
    }

    /// Make the next `n` history inserts fail with a transient error.
    pub fn fail_next_histories(&self, n: u32) {
        self.inner.lock().unwrap().fail_histories = n;
    }

    // ── Test inspection ───────────────────────────────────────

    pub fn histories(&self, collection: &str) -> Vec<StoredHistory> {
        self.inner
            .lock()
            .unwrap()
            .histories
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn history_count(&self, collection: &str) -> usize {
        self.histories(collection).len()
    }

    pub fn snapshot(&self, patient_id: &str, field: &str) -> Option<SnapshotValue> {
        self.inner
            .lock()
            .unwrap()
            .patients
            .get(patient_id)
            .and_then(|p| p.snapshots.get(field).cloned())
    }

    pub fn audits(&self) -> Vec<AuditRecord> {
        self.inner.lock().unwrap().audits.clone()
    }

    pub fn patient(&self, patient_id: &str) -> Option<PatientDoc> {
        self.inner.lock().unwrap().patients.get(patient_id).cloned()
    }

    pub fn patient_count(&self) -> usize {
        self.inner.lock().unwrap().patients.len()
    }

    fn active(inner: &Inner, patient_id: &str) -> bool {
        inner
            .patients
            .get(patient_id)
            .is_some_and(|p| !p.deleted)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_patient_by_device_mac(
        &self,
        kind: ReadingKind,
        mac: &str,
    ) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .device_slots
            .get(&(kind, mac.to_string()))
            .filter(|id| Self::active(&inner, id))
            .cloned())
    }

    async fn find_patients_by_gateway(&self, mac: &str) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .gateway_slots
            .get(mac)
            .map(|ids| {
                ids.iter()
                    .filter(|id| Self::active(&inner, id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn find_patient_by_watch_imei(&self, imei: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .watch_imeis
            .get(imei)
            .filter(|id| Self::active(&inner, id))
            .cloned())
    }

    async fn find_patient_by_citizen_id(&self, citiz: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .patients
            .iter()
            .find(|(_, p)| !p.deleted && p.citizen_id.as_deref() == Some(citiz))
            .map(|(id, _)| id.clone()))
    }

    async fn qube_box_known(&self, mac: &str) -> Result<bool, StoreError> {
        Ok(self.inner.lock().unwrap().qube_boxes.contains(mac))
    }

    async fn create_unregistered_patient(
        &self,
        hint: &PatientHint,
    ) -> Result<ProvisionOutcome, StoreError> {
        let mut inner = self.inner.lock().unwrap();

        // The unique index on citiz makes concurrent first-sightings
        // converge on one document.
        if let Some((id, _)) = inner
            .patients
            .iter()
            .find(|(_, p)| !p.deleted && p.citizen_id.as_deref() == Some(&hint.citizen_id))
        {
            return Ok(ProvisionOutcome {
                patient_id: id.clone(),
                created: false,
            });
        }

        let id = Uuid::now_v7().to_string();
        inner.patients.insert(
            id.clone(),
            PatientDoc {
                citizen_id: Some(hint.citizen_id.clone()),
                unregistered: true,
                deleted: false,
                name_th: hint.name_th.clone(),
                name_en: hint.name_en.clone(),
                birth_date: hint.birth_date,
                gender: Some(hint.gender),
                snapshots: HashMap::new(),
            },
        );
        Ok(ProvisionOutcome {
            patient_id: id,
            created: true,
        })
    }

    async fn insert_history(&self, record: &HistoryRecord) -> Result<String, StoreError> {
        let collection = record
            .collection()
            .ok_or_else(|| StoreError::Database("no history collection for kind".into()))?;

        let mut inner = self.inner.lock().unwrap();
        if inner.fail_histories > 0 {
            inner.fail_histories -= 1;
            return Err(StoreError::Database("injected history failure".into()));
        }

        let id = Uuid::now_v7().to_string();
        inner
            .histories
            .entry(collection.to_string())
            .or_default()
            .push(StoredHistory {
                id: id.clone(),
                record: record.clone(),
            });
        Ok(id)
    }

    async fn snapshot_cas(
        &self,
        patient_id: &str,
        field: &str,
        snapshot: &SnapshotValue,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_snapshots > 0 {
            inner.fail_snapshots -= 1;
            return Err(StoreError::Database("injected snapshot failure".into()));
        }

        let Some(patient) = inner.patients.get_mut(patient_id) else {
            return Ok(false);
        };
        match patient.snapshots.get(field) {
            Some(current) if current.device_ts >= snapshot.device_ts => Ok(false),
            _ => {
                patient
                    .snapshots
                    .insert(field.to_string(), snapshot.clone());
                Ok(true)
            }
        }
    }

    async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        self.inner.lock().unwrap().audits.push(record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amy_protocol::{DeviceFamily, Reading};
    use chrono::Utc;

    fn hint(citiz: &str) -> PatientHint {
        PatientHint {
            citizen_id: citiz.to_string(),
            name_th: Some("ทดสอบ".into()),
            name_en: Some("Test".into()),
            birth_date: None,
            gender: Gender::Female,
        }
    }

    #[tokio::test]
    async fn soft_deleted_patients_do_not_resolve() {
        let store = MemoryStore::new();
        let patient = store.add_patient(None);
        store.link_watch("865000000000001", &patient);

        assert!(
            store
                .find_patient_by_watch_imei("865000000000001")
                .await
                .unwrap()
                .is_some()
        );

        store.mark_deleted(&patient);
        assert!(
            store
                .find_patient_by_watch_imei("865000000000001")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn provision_is_idempotent() {
        let store = MemoryStore::new();

        let first = store.create_unregistered_patient(&hint("357")).await.unwrap();
        assert!(first.created);

        let second = store.create_unregistered_patient(&hint("357")).await.unwrap();
        assert!(!second.created);
        assert_eq!(first.patient_id, second.patient_id);
        assert_eq!(store.patient_count(), 1);

        let doc = store.patient(&first.patient_id).unwrap();
        assert!(doc.unregistered);
        assert_eq!(doc.name_en.as_deref(), Some("Test"));
    }

    #[tokio::test]
    async fn snapshot_cas_rejects_older_timestamps() {
        let store = MemoryStore::new();
        let patient = store.add_patient(None);
        let now = Utc::now();

        let newer = SnapshotValue {
            reading: Reading::HeartRate { bpm: 70.0 },
            device_ts: now,
            family: DeviceFamily::KatiWatch,
        };
        let older = SnapshotValue {
            reading: Reading::HeartRate { bpm: 99.0 },
            device_ts: now - chrono::Duration::seconds(60),
            family: DeviceFamily::KatiWatch,
        };

        assert!(store.snapshot_cas(&patient, "last_heart_rate", &newer).await.unwrap());
        assert!(!store.snapshot_cas(&patient, "last_heart_rate", &older).await.unwrap());

        let stored = store.snapshot(&patient, "last_heart_rate").unwrap();
        assert_eq!(stored.device_ts, now);
    }
}
