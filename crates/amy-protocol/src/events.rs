//! Data-flow events — the step-by-step processing trail broadcast to the
//! monitoring dashboard.
//!
//! Every reading extracted from an inbound MQTT message produces a
//! causally ordered sequence of events sharing one `flow_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::DeviceFamily;

/// Processing step a flow event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStep {
    Received,
    Parsed,
    Resolved,
    SnapshotWritten,
    HistoryWritten,
    EmittedEmergency,
    Rejected,
}

/// Outcome attached to a flow event. `Warning` marks soft failures
/// (out-of-range values, stale snapshots) where the reading was still
/// persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Ok,
    Fail,
    Warning,
}

/// Priority of an emergency alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertPriority {
    Medium,
    High,
    Critical,
}

impl AlertPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::Critical => "CRITICAL",
            AlertPriority::High => "HIGH",
            AlertPriority::Medium => "MEDIUM",
        }
    }
}

/// One step in the processing of a single inbound reading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowEvent {
    pub flow_id: Uuid,
    pub step: FlowStep,
    pub status: FlowStatus,
    pub family: DeviceFamily,
    pub topic: String,
    pub device_id: String,
    pub patient_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub server_ts: DateTime<Utc>,
}

impl FlowEvent {
    /// A fresh `ok` event for the given step.
    pub fn ok(flow_id: Uuid, step: FlowStep, family: DeviceFamily, topic: &str, device_id: &str) -> Self {
        Self {
            flow_id,
            step,
            status: FlowStatus::Ok,
            family,
            topic: topic.to_string(),
            device_id: device_id.to_string(),
            patient_id: None,
            reason: None,
            server_ts: Utc::now(),
        }
    }

    pub fn with_patient(mut self, patient_id: Option<&str>) -> Self {
        self.patient_id = patient_id.map(str::to_string);
        self
    }

    pub fn with_status(mut self, status: FlowStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}
