//! MongoDB-backed store.
//!
//! Collection names and index expectations are contractual (§ the admin
//! surface owns schema and indexes; the core only reads mappings and
//! appends observations). The snapshot CAS is a single `update_one`
//! against the patient document so MongoDB's per-document atomicity
//! carries the monotonicity invariant.

use bson::oid::ObjectId;
use bson::{Bson, Document, doc};
use futures::TryStreamExt;
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};

use async_trait::async_trait;

use amy_protocol::{PatientHint, ReadingKind};

use super::{
    AuditRecord, HistoryRecord, ProvisionOutcome, SnapshotValue, Store, StoreError,
    device_mac_column,
};

const PATIENTS: &str = "patients";
const AMY_DEVICES: &str = "amy_devices";
const AMY_BOXES: &str = "amy_boxes";
const WATCHES: &str = "watches";
const QUBE_BOXES: &str = "mfc_hv01_boxes";
const AUDIT_LOG: &str = "audit_log";

/// MongoDB implementation of the `Store` trait.
pub struct MongoStore {
    db: Database,
    audit_db: Database,
}

impl MongoStore {
    /// Connect with the pool and timeout budget of the deployment
    /// (10–50 connections, 5 s per operation).
    pub async fn connect(uri: &str, db_name: &str, audit_db_name: &str) -> Result<Self, StoreError> {
        let mut options = ClientOptions::parse(uri).await.map_err(db_err)?;
        options.min_pool_size = Some(10);
        options.max_pool_size = Some(50);
        options.connect_timeout = Some(std::time::Duration::from_secs(5));
        options.server_selection_timeout = Some(std::time::Duration::from_secs(5));

        let client = Client::with_options(options).map_err(db_err)?;
        Ok(Self {
            db: client.database(db_name),
            audit_db: client.database(audit_db_name),
        })
    }

    fn patients(&self) -> mongodb::Collection<Document> {
        self.db.collection(PATIENTS)
    }

    /// Patient exists and is not soft-deleted.
    async fn patient_active(&self, id: &Bson) -> Result<bool, StoreError> {
        let found = self
            .patients()
            .find_one(doc! { "_id": id.clone(), "deleted": { "$ne": true } })
            .await
            .map_err(db_err)?;
        Ok(found.is_some())
    }
}

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Database(e.to_string())
}

fn is_duplicate_key(e: &mongodb::error::Error) -> bool {
    matches!(
        *e.kind,
        ErrorKind::Write(WriteFailure::WriteError(ref we)) if we.code == 11000
    )
}

/// Patient ids travel as strings; in the database they are ObjectIds
/// (legacy imports left a few string `_id`s behind, so fall back).
fn id_bson(id: &str) -> Bson {
    ObjectId::parse_str(id)
        .map(Bson::ObjectId)
        .unwrap_or_else(|_| Bson::String(id.to_string()))
}

fn id_string(id: &Bson) -> Option<String> {
    match id {
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        Bson::String(s) => Some(s.clone()),
        _ => None,
    }
}

fn snapshot_document(snapshot: &SnapshotValue) -> Result<Document, StoreError> {
    let mut document = doc! {
        "device_ts": bson::DateTime::from_chrono(snapshot.device_ts),
        "family": bson::to_bson(&snapshot.family).map_err(db_err)?,
    };
    document.insert("data", bson::to_bson(&snapshot.reading).map_err(db_err)?);
    Ok(document)
}

#[async_trait]
impl Store for MongoStore {
    async fn find_patient_by_device_mac(
        &self,
        kind: ReadingKind,
        mac: &str,
    ) -> Result<Option<String>, StoreError> {
        let Some(column) = device_mac_column(kind) else {
            return Ok(None);
        };

        let mut filter = Document::new();
        filter.insert(column, mac);
        let Some(slot) = self
            .db
            .collection::<Document>(AMY_DEVICES)
            .find_one(filter)
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };

        let Some(patient_id) = slot.get("patient_id") else {
            return Ok(None);
        };
        if !self.patient_active(patient_id).await? {
            return Ok(None);
        }
        Ok(id_string(patient_id))
    }

    async fn find_patients_by_gateway(&self, mac: &str) -> Result<Vec<String>, StoreError> {
        let mut cursor = self
            .db
            .collection::<Document>(AMY_BOXES)
            .find(doc! { "mac_address": mac })
            .await
            .map_err(db_err)?;

        let mut patients = Vec::new();
        while let Some(slot) = cursor.try_next().await.map_err(db_err)? {
            let Some(patient_id) = slot.get("patient_id") else {
                continue;
            };
            if self.patient_active(patient_id).await? {
                if let Some(id) = id_string(patient_id) {
                    patients.push(id);
                }
            }
        }
        Ok(patients)
    }

    async fn find_patient_by_watch_imei(&self, imei: &str) -> Result<Option<String>, StoreError> {
        let Some(watch) = self
            .db
            .collection::<Document>(WATCHES)
            .find_one(doc! { "imei": imei })
            .await
            .map_err(db_err)?
        else {
            return Ok(None);
        };

        let Some(patient_id) = watch.get("patient_id") else {
            return Ok(None);
        };
        if !self.patient_active(patient_id).await? {
            return Ok(None);
        }
        Ok(id_string(patient_id))
    }

    async fn find_patient_by_citizen_id(&self, citiz: &str) -> Result<Option<String>, StoreError> {
        let found = self
            .patients()
            .find_one(doc! { "citiz": citiz, "deleted": { "$ne": true } })
            .await
            .map_err(db_err)?;
        Ok(found.and_then(|p| p.get("_id").and_then(id_string)))
    }

    async fn qube_box_known(&self, mac: &str) -> Result<bool, StoreError> {
        let found = self
            .db
            .collection::<Document>(QUBE_BOXES)
            .find_one(doc! { "mac_address": mac })
            .await
            .map_err(db_err)?;
        Ok(found.is_some())
    }

    async fn create_unregistered_patient(
        &self,
        hint: &PatientHint,
    ) -> Result<ProvisionOutcome, StoreError> {
        let mut document = doc! {
            "citiz": &hint.citizen_id,
            "unregistered": true,
            "deleted": false,
            "created_at": bson::DateTime::now(),
        };
        if let Some(name_th) = &hint.name_th {
            document.insert("name_th", name_th);
        }
        if let Some(name_en) = &hint.name_en {
            document.insert("name_en", name_en);
        }
        if let Some(birth_date) = hint.birth_date {
            document.insert("birth_date", birth_date.format("%Y-%m-%d").to_string());
        }
        document.insert("gender", bson::to_bson(&hint.gender).map_err(db_err)?);

        match self.patients().insert_one(document).await {
            Ok(result) => {
                let patient_id = id_string(&result.inserted_id)
                    .ok_or_else(|| StoreError::Database("non-id inserted_id".into()))?;
                Ok(ProvisionOutcome {
                    patient_id,
                    created: true,
                })
            }
            // Concurrent first-sighting: the unique index on citiz
            // rejected us — re-read and hand back the winner.
            Err(e) if is_duplicate_key(&e) => {
                let existing = self
                    .find_patient_by_citizen_id(&hint.citizen_id)
                    .await?
                    .ok_or_else(|| StoreError::DuplicateKey(hint.citizen_id.clone()))?;
                Ok(ProvisionOutcome {
                    patient_id: existing,
                    created: false,
                })
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn insert_history(&self, record: &HistoryRecord) -> Result<String, StoreError> {
        let collection = record
            .collection()
            .ok_or_else(|| StoreError::Database("no history collection for kind".into()))?;

        let mut document = doc! {
            "patient_id": record
                .patient_id
                .as_deref()
                .map(id_bson)
                .unwrap_or(Bson::Null),
            "family": bson::to_bson(&record.reading.device.family).map_err(db_err)?,
            "device_id": &record.reading.device.id,
            "device_ts": bson::DateTime::from_chrono(record.effective_ts),
            "server_ts": bson::DateTime::from_chrono(record.server_ts),
        };
        if let Some(gateway) = &record.reading.device.gateway {
            document.insert("gateway", gateway);
        }
        document.insert(
            "data",
            bson::to_bson(&record.reading.reading).map_err(db_err)?,
        );
        if let Some(priority) = record.priority {
            document.insert("priority", priority.as_str());
        }

        let result = self
            .db
            .collection::<Document>(collection)
            .insert_one(document)
            .await
            .map_err(db_err)?;
        id_string(&result.inserted_id).ok_or_else(|| StoreError::Database("non-id inserted_id".into()))
    }

    async fn snapshot_cas(
        &self,
        patient_id: &str,
        field: &str,
        snapshot: &SnapshotValue,
    ) -> Result<bool, StoreError> {
        let field_ts = format!("{field}.device_ts");

        let mut absent = Document::new();
        absent.insert(field_ts.clone(), doc! { "$exists": false });
        let mut older = Document::new();
        older.insert(
            field_ts,
            doc! { "$lt": bson::DateTime::from_chrono(snapshot.device_ts) },
        );

        let mut filter = doc! { "_id": id_bson(patient_id) };
        filter.insert("$or", vec![absent, older]);

        let mut set = Document::new();
        set.insert(field, snapshot_document(snapshot)?);
        let update = doc! { "$set": set };

        let result = self
            .patients()
            .update_one(filter, update)
            .await
            .map_err(db_err)?;
        Ok(result.matched_count == 1)
    }

    async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError> {
        let document = doc! {
            "server_ts": bson::DateTime::from_chrono(record.server_ts),
            "patient_id": record
                .patient_id
                .as_deref()
                .map(id_bson)
                .unwrap_or(Bson::Null),
            "reading_kind": record.reading_kind.as_str(),
            "source_family": record.source_family.as_str(),
            "history_record_id": id_bson(&record.history_record_id),
        };
        self.audit_db
            .collection::<Document>(AUDIT_LOG)
            .insert_one(document)
            .await
            .map_err(db_err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use amy_protocol::{DeviceFamily, Reading};
    use chrono::Utc;

    #[test]
    fn id_bson_parses_object_ids() {
        let oid = ObjectId::new();
        assert!(matches!(id_bson(&oid.to_hex()), Bson::ObjectId(_)));
        assert!(matches!(id_bson("legacy-id-17"), Bson::String(_)));
    }

    #[test]
    fn id_string_roundtrip() {
        let oid = ObjectId::new();
        assert_eq!(id_string(&Bson::ObjectId(oid)), Some(oid.to_hex()));
        assert_eq!(id_string(&Bson::String("p-1".into())), Some("p-1".into()));
        assert_eq!(id_string(&Bson::Null), None);
    }

    #[test]
    fn snapshot_document_shape() {
        let snapshot = SnapshotValue {
            reading: Reading::Spo2 {
                spo2: 97.0,
                pulse: Some(70.0),
                perfusion_index: None,
            },
            device_ts: Utc::now(),
            family: DeviceFamily::KatiWatch,
        };
        let document = snapshot_document(&snapshot).unwrap();
        assert!(document.get_datetime("device_ts").is_ok());
        assert_eq!(document.get_str("family").unwrap(), "kati_watch");
        assert_eq!(
            document.get_document("data").unwrap().get_str("kind").unwrap(),
            "spo2"
        );
    }
}
