//! Emergency pipeline — priority assignment.
//!
//! Emergencies ride the normal dual-write path into `emergency_alarm`
//! and are additionally broadcast as `emitted_emergency` flow events.
//! Unresolved emergencies are never dropped: they persist with a null
//! patient and still reach the dashboard.

use amy_protocol::{AlertPriority, EmergencyKind};

/// Fixed urgency ladder for emergency alert classes.
pub fn priority_of(kind: EmergencyKind) -> AlertPriority {
    match kind {
        EmergencyKind::Sos => AlertPriority::Critical,
        EmergencyKind::Fall => AlertPriority::High,
        EmergencyKind::LowBattery | EmergencyKind::NotWorn | EmergencyKind::Offline => {
            AlertPriority::Medium
        }
    }
}
