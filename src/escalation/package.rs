use super::EscalationCause;
use crate::error::EngineError;
use crate::telemetry::{GeoLocation, VehicleState};
use crate::types::CollisionTarget;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Vehicle identity, as registered for the session
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleInfo {
    pub vin: String,
    pub make: String,
    pub model: String,
    pub plate: String,
    /// Last known speed, filled in when the package is assembled
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speed_kmh: Option<f64>,
}

/// Per-session context supplied by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionProfile {
    pub driver_id: String,
    pub vehicle: VehicleInfo,
    pub occupants: u32,
    /// Optional medical profile shared with responders
    pub medical_history: Vec<String>,
}

impl Default for SessionProfile {
    fn default() -> Self {
        Self {
            driver_id: "anonymous".to_string(),
            vehicle: VehicleInfo::default(),
            occupants: 1,
            medical_history: Vec::new(),
        }
    }
}

impl SessionProfile {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }
}

/// Payload sent to the emergency-communication channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyDataPackage {
    pub case_id: Uuid,
    pub incident_type: String,
    pub severity: String,
    /// `null` when no fix was available
    pub location: Option<GeoLocation>,
    pub vehicle_info: VehicleInfo,
    pub occupants: u32,
    pub medical_history: Option<Vec<String>>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collided_with: Option<CollisionTarget>,
}

impl EmergencyDataPackage {
    pub fn assemble(
        case_id: Uuid,
        cause: &EscalationCause,
        profile: &SessionProfile,
        vehicle: Option<&VehicleState>,
        now: DateTime<Utc>,
    ) -> Self {
        let mut vehicle_info = profile.vehicle.clone();
        vehicle_info.speed_kmh = vehicle.map(|v| v.speed_kmh);
        Self {
            case_id,
            incident_type: cause.kind.incident_type().to_string(),
            severity: cause.kind.severity().to_string(),
            location: vehicle.and_then(|v| v.location),
            vehicle_info,
            occupants: profile.occupants,
            medical_history: (!profile.medical_history.is_empty())
                .then(|| profile.medical_history.clone()),
            timestamp: now,
            collided_with: cause.collided_with,
        }
    }
}
