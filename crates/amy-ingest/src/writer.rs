//! Canonical writer — the dual-write protocol.
//!
//! History append first, then a conditional snapshot update on the
//! patient document, then a best-effort audit record. Writes for the
//! same patient are serialised through a striped lock table so the
//! snapshot never regresses under concurrency.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, MutexGuard};

use amy_protocol::{CanonicalReading, EmergencyKind};

use crate::audit::AuditSink;
use crate::emergency::priority_of;
use crate::store::{HistoryRecord, SnapshotValue, Store, StoreError};

/// Striped keyed mutex: one stripe per hash bucket, lock held for the
/// duration of the dual write.
pub struct LockTable {
    stripes: Vec<Mutex<()>>,
}

impl LockTable {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].lock().await
    }
}

/// What happened to the snapshot half of the dual write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// The patient document now carries this reading.
    Applied,
    /// A newer reading already holds the snapshot (late arrival). The
    /// history record is retained; this is still success.
    Stale,
    /// No snapshot applies (null patient, or the kind keeps none).
    Skipped,
    /// Transient failures exhausted the retry budget; history retained.
    Failed,
}

/// Result of one `store` call.
#[derive(Debug, Clone)]
pub struct StoreOutcome {
    pub history_id: String,
    pub snapshot: SnapshotOutcome,
    pub emergency: Option<EmergencyKind>,
}

/// Writer configuration knobs.
#[derive(Debug, Clone, Copy)]
pub struct WriterSettings {
    pub max_retries: u32,
    pub protocol_timeout: Duration,
    pub per_patient_stripes: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            protocol_timeout: Duration::from_secs(15),
            per_patient_stripes: 1024,
        }
    }
}

const SNAPSHOT_BACKOFF_MS: [u64; 3] = [50, 200, 800];

pub struct CanonicalWriter {
    store: Arc<dyn Store>,
    audit: AuditSink,
    locks: LockTable,
    settings: WriterSettings,
}

impl CanonicalWriter {
    pub fn new(store: Arc<dyn Store>, settings: WriterSettings) -> Self {
        Self {
            audit: AuditSink::new(store.clone()),
            locks: LockTable::new(settings.per_patient_stripes),
            store,
            settings,
        }
    }

    /// Execute the dual-write protocol for one reading.
    ///
    /// `patient_id` is `None` only for unresolved emergencies, which
    /// still get a history record in `emergency_alarm`.
    pub async fn store(
        &self,
        patient_id: Option<&str>,
        reading: &CanonicalReading,
    ) -> Result<StoreOutcome, StoreError> {
        tokio::time::timeout(
            self.settings.protocol_timeout,
            self.store_inner(patient_id, reading),
        )
        .await
        .map_err(|_| StoreError::Timeout("write protocol budget exceeded".into()))?
    }

    async fn store_inner(
        &self,
        patient_id: Option<&str>,
        reading: &CanonicalReading,
    ) -> Result<StoreOutcome, StoreError> {
        let kind = reading.kind();
        let server_ts = Utc::now();
        let effective_ts = reading.device_ts.unwrap_or(server_ts);
        let emergency = reading.emergency_kind();

        // Per-patient critical section across history + snapshot.
        let _guard = match patient_id {
            Some(id) => Some(self.locks.lock(id).await),
            None => None,
        };

        let record = HistoryRecord {
            patient_id: patient_id.map(str::to_string),
            reading: reading.clone(),
            server_ts,
            effective_ts,
            priority: emergency.map(priority_of),
        };
        let history_id = self.store.insert_history(&record).await?;

        let snapshot = match (patient_id, kind.snapshot_field()) {
            (Some(patient), Some(field)) => {
                let value = SnapshotValue {
                    reading: reading.reading.clone(),
                    device_ts: effective_ts,
                    family: reading.device.family,
                };
                self.snapshot_with_retry(patient, &field, &value).await
            }
            _ => SnapshotOutcome::Skipped,
        };

        self.audit
            .record(patient_id, kind, reading.device.family, &history_id)
            .await;

        Ok(StoreOutcome {
            history_id,
            snapshot,
            emergency,
        })
    }

    async fn snapshot_with_retry(
        &self,
        patient_id: &str,
        field: &str,
        value: &SnapshotValue,
    ) -> SnapshotOutcome {
        let mut attempt = 0u32;
        loop {
            match self.store.snapshot_cas(patient_id, field, value).await {
                Ok(true) => return SnapshotOutcome::Applied,
                Ok(false) => return SnapshotOutcome::Stale,
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let delay = SNAPSHOT_BACKOFF_MS
                        .get(attempt as usize)
                        .copied()
                        .unwrap_or(*SNAPSHOT_BACKOFF_MS.last().unwrap_or(&800));
                    tracing::warn!(
                        patient_id = %patient_id,
                        field = %field,
                        attempt = attempt + 1,
                        error = %e,
                        "snapshot update failed, retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(
                        patient_id = %patient_id,
                        field = %field,
                        error = %e,
                        "snapshot update failed permanently, history retained"
                    );
                    return SnapshotOutcome::Failed;
                }
            }
        }
    }
}
