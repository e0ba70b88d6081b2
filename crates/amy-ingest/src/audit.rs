//! Audit trail sink.
//!
//! One provenance record per accepted reading, linking back to the
//! history document. Best-effort: audit failures are logged and never
//! fail the primary write. The `audit_log` collection carries a
//! 180-day TTL index (created by the admin surface).

use std::sync::Arc;

use chrono::Utc;

use amy_protocol::{DeviceFamily, ReadingKind};

use crate::store::{AuditRecord, Store};

pub struct AuditSink {
    store: Arc<dyn Store>,
}

impl AuditSink {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn record(
        &self,
        patient_id: Option<&str>,
        reading_kind: ReadingKind,
        source_family: DeviceFamily,
        history_record_id: &str,
    ) {
        let record = AuditRecord {
            server_ts: Utc::now(),
            patient_id: patient_id.map(str::to_string),
            reading_kind,
            source_family,
            history_record_id: history_record_id.to_string(),
        };
        if let Err(e) = self.store.insert_audit(&record).await {
            tracing::warn!(
                history_record_id = %history_record_id,
                error = %e,
                "audit write failed (primary write unaffected)"
            );
        }
    }
}
