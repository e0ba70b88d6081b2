//! Device → patient resolution.
//!
//! Each family has its own lookup path: AVA4 sub-devices by per-kind
//! BLE MAC with a gateway fallback, Kati watches by IMEI, Qube-Vital by
//! citizen ID with auto-provisioning of unknown citizens. A small TTL
//! cache keyed by device identity keeps the hot path off the database.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;

use amy_protocol::{CanonicalReading, DeviceFamily};

use crate::store::{Store, StoreError};

/// Outcome of a resolution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    /// Qube-Vital only: a new unregistered patient was created (or an
    /// existing one was found after losing the insert race).
    AutoProvisioned(String),
    Unresolved,
}

impl Resolution {
    pub fn patient_id(&self) -> Option<&str> {
        match self {
            Resolution::Resolved(id) | Resolution::AutoProvisioned(id) => Some(id),
            Resolution::Unresolved => None,
        }
    }
}

struct CacheEntry {
    patient_id: String,
    inserted_at: Instant,
}

/// Resolver over the store with an in-process lookup cache.
pub struct PatientResolver {
    store: Arc<dyn Store>,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl PatientResolver {
    /// `cache_ttl_s = 0` disables the cache.
    pub fn new(store: Arc<dyn Store>, cache_ttl_s: u64) -> Self {
        Self {
            store,
            cache_ttl: Duration::from_secs(cache_ttl_s),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, reading: &CanonicalReading) -> Result<Resolution, StoreError> {
        match reading.device.family {
            DeviceFamily::Ava4SubDevice => self.resolve_ava4(reading).await,
            DeviceFamily::KatiWatch => self.resolve_kati(reading).await,
            DeviceFamily::QubeVital => self.resolve_qube(reading).await,
            // Gateway status traffic carries no patient.
            DeviceFamily::Ava4Gateway => Ok(Resolution::Unresolved),
        }
    }

    /// Drop every cached mapping (admin cache-flush signal).
    pub async fn flush_cache(&self) {
        self.cache.write().await.clear();
    }

    // ── Family paths ──────────────────────────────────────────

    async fn resolve_ava4(&self, reading: &CanonicalReading) -> Result<Resolution, StoreError> {
        let kind = reading.kind();
        let mac = &reading.device.id;
        let cache_key = format!("ava4:{}:{mac}", kind.as_str());

        if let Some(patient_id) = self.cached(&cache_key).await {
            return Ok(Resolution::Resolved(patient_id));
        }

        if let Some(patient_id) = self.store.find_patient_by_device_mac(kind, mac).await? {
            self.remember(cache_key, &patient_id).await;
            return Ok(Resolution::Resolved(patient_id));
        }

        // Fall back to the enclosing gateway, but only when it maps to
        // exactly one patient.
        if let Some(gateway) = &reading.device.gateway {
            let patients = self.store.find_patients_by_gateway(gateway).await?;
            match patients.as_slice() {
                [patient_id] => {
                    self.remember(cache_key, patient_id).await;
                    return Ok(Resolution::Resolved(patient_id.clone()));
                }
                [] => {}
                many => {
                    tracing::warn!(
                        gateway = %gateway,
                        candidates = many.len(),
                        "ambiguous gateway mapping, not resolving"
                    );
                }
            }
        }

        Ok(Resolution::Unresolved)
    }

    async fn resolve_kati(&self, reading: &CanonicalReading) -> Result<Resolution, StoreError> {
        let imei = &reading.device.id;
        let cache_key = format!("kati:{imei}");

        if let Some(patient_id) = self.cached(&cache_key).await {
            return Ok(Resolution::Resolved(patient_id));
        }

        match self.store.find_patient_by_watch_imei(imei).await? {
            Some(patient_id) => {
                self.remember(cache_key, &patient_id).await;
                Ok(Resolution::Resolved(patient_id))
            }
            None => Ok(Resolution::Unresolved),
        }
    }

    async fn resolve_qube(&self, reading: &CanonicalReading) -> Result<Resolution, StoreError> {
        let Some(hint) = &reading.hint else {
            // No citizen ID on the payload; nothing to match or create.
            return Ok(Resolution::Unresolved);
        };
        let cache_key = format!("citiz:{}", hint.citizen_id);

        if let Some(patient_id) = self.cached(&cache_key).await {
            return Ok(Resolution::Resolved(patient_id));
        }

        if let Some(patient_id) = self
            .store
            .find_patient_by_citizen_id(&hint.citizen_id)
            .await?
        {
            self.remember(cache_key, &patient_id).await;
            return Ok(Resolution::Resolved(patient_id));
        }

        // Unknown kiosks still provision — flag for ops review.
        if !self.store.qube_box_known(&reading.device.id).await? {
            tracing::warn!(mac = %reading.device.id, "report from unregistered Qube-Vital box");
        }

        let outcome = self.store.create_unregistered_patient(hint).await?;
        if outcome.created {
            tracing::info!(
                patient_id = %outcome.patient_id,
                "auto-provisioned unregistered patient"
            );
        }
        self.remember(cache_key, &outcome.patient_id).await;
        Ok(Resolution::AutoProvisioned(outcome.patient_id))
    }

    // ── Cache ─────────────────────────────────────────────────

    async fn cached(&self, key: &str) -> Option<String> {
        if self.cache_ttl.is_zero() {
            return None;
        }
        let cache = self.cache.read().await;
        cache
            .get(key)
            .filter(|e| e.inserted_at.elapsed() < self.cache_ttl)
            .map(|e| e.patient_id.clone())
    }

    async fn remember(&self, key: String, patient_id: &str) {
        if self.cache_ttl.is_zero() {
            return;
        }
        self.cache.write().await.insert(
            key,
            CacheEntry {
                patient_id: patient_id.to_string(),
                inserted_at: Instant::now(),
            },
        );
    }
}
