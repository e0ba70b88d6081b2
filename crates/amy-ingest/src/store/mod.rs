//! Document-store access layer.
//!
//! The `Store` trait is the seam between the pipeline and MongoDB:
//! `MongoStore` talks to the real deployment, `MemoryStore` backs unit
//! and e2e tests. Collection names are contractual — the admin surface
//! and dashboards read the same database.

pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use amy_protocol::{
    AlertPriority, CanonicalReading, DeviceFamily, PatientHint, Reading, ReadingKind,
};

pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Errors from the document store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    #[error("timeout: {0}")]
    Timeout(String),
}

impl StoreError {
    /// Duplicate-key conflicts are resolved by re-reading; everything
    /// else is worth a retry.
    pub fn is_transient(&self) -> bool {
        !matches!(self, StoreError::DuplicateKey(_))
    }
}

/// One append-only history document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub patient_id: Option<String>,
    #[serde(flatten)]
    pub reading: CanonicalReading,
    pub server_ts: DateTime<Utc>,
    /// Effective device timestamp — the device clock, or the server
    /// clock when the payload carried none.
    pub effective_ts: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<AlertPriority>,
}

impl HistoryRecord {
    pub fn kind(&self) -> ReadingKind {
        self.reading.kind()
    }

    pub fn collection(&self) -> Option<&'static str> {
        self.kind().history_collection()
    }
}

/// The most-recent-value snapshot stored on the patient document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotValue {
    #[serde(flatten)]
    pub reading: Reading,
    pub device_ts: DateTime<Utc>,
    pub family: DeviceFamily,
}

/// Minimal provenance record, TTL'd after 180 days by a collection index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub server_ts: DateTime<Utc>,
    pub patient_id: Option<String>,
    pub reading_kind: ReadingKind,
    pub source_family: DeviceFamily,
    pub history_record_id: String,
}

/// Result of an auto-provision attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionOutcome {
    pub patient_id: String,
    /// False when a concurrent first-sighting won the insert race.
    pub created: bool,
}

/// Per-reading-kind MAC column on `amy_devices`.
///
/// The blood-pressure column is `mac_dusun_bps`; the other
/// instrument classes follow the same naming scheme.
pub fn device_mac_column(kind: ReadingKind) -> Option<&'static str> {
    match kind {
        ReadingKind::BloodPressure => Some("mac_dusun_bps"),
        ReadingKind::BloodSugar => Some("mac_dusun_glucose"),
        ReadingKind::Spo2 => Some("mac_dusun_oximeter"),
        ReadingKind::BodyTemperature => Some("mac_dusun_temp"),
        ReadingKind::Weight => Some("mac_dusun_weight"),
        ReadingKind::UricAcid => Some("mac_dusun_ua"),
        ReadingKind::Cholesterol => Some("mac_dusun_chol"),
        _ => None,
    }
}

/// Document-store operations the core depends on.
///
/// Mapping collections (`amy_devices`, `amy_boxes`, `watches`,
/// `mfc_hv01_boxes`) are read-only here; the admin surface owns them.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Resolver reads ────────────────────────────────────────

    /// Look up the patient owning a BLE sub-device MAC in the per-kind
    /// column of `amy_devices`. Soft-deleted patients resolve to None.
    async fn find_patient_by_device_mac(
        &self,
        kind: ReadingKind,
        mac: &str,
    ) -> Result<Option<String>, StoreError>;

    /// All patients whose AVA4 gateway slot (`amy_boxes`) carries this
    /// MAC. The resolver only accepts an unambiguous (single) match.
    async fn find_patients_by_gateway(&self, mac: &str) -> Result<Vec<String>, StoreError>;

    /// Look up a Kati watch IMEI in `watches`.
    async fn find_patient_by_watch_imei(&self, imei: &str) -> Result<Option<String>, StoreError>;

    /// Look up a citizen ID on `patients` (soft-deleted excluded).
    async fn find_patient_by_citizen_id(&self, citiz: &str) -> Result<Option<String>, StoreError>;

    /// Whether a Qube-Vital box MAC is registered in `mfc_hv01_boxes`.
    async fn qube_box_known(&self, mac: &str) -> Result<bool, StoreError>;

    /// Create an `unregistered` patient from Qube demographics.
    /// Idempotent under concurrent first-sighting: a duplicate-key
    /// conflict on `citiz` re-reads and returns the existing id.
    async fn create_unregistered_patient(
        &self,
        hint: &PatientHint,
    ) -> Result<ProvisionOutcome, StoreError>;

    // ── Writer operations ─────────────────────────────────────

    /// Append one history document; returns its id.
    async fn insert_history(&self, record: &HistoryRecord) -> Result<String, StoreError>;

    /// Conditionally set `patients.<field>` — only when the stored
    /// snapshot is absent or strictly older than `snapshot.device_ts`.
    /// Returns true when applied, false when the stored value is newer.
    async fn snapshot_cas(
        &self,
        patient_id: &str,
        field: &str,
        snapshot: &SnapshotValue,
    ) -> Result<bool, StoreError>;

    /// Append an audit record to `audit_log`.
    async fn insert_audit(&self, record: &AuditRecord) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_columns_cover_ava4_instruments() {
        assert_eq!(
            device_mac_column(ReadingKind::BloodPressure),
            Some("mac_dusun_bps")
        );
        assert_eq!(
            device_mac_column(ReadingKind::Weight),
            Some("mac_dusun_weight")
        );
        assert_eq!(device_mac_column(ReadingKind::Emergency), None);
        assert_eq!(device_mac_column(ReadingKind::HeartRate), None);
    }

    #[test]
    fn duplicate_key_is_not_transient() {
        assert!(!StoreError::DuplicateKey("citiz".into()).is_transient());
        assert!(StoreError::Database("boom".into()).is_transient());
        assert!(StoreError::Timeout("op".into()).is_transient());
    }
}
