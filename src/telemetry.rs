//! Raw vehicle state interpretation
//!
//! Raw telemetry (velocity, controls, location, rotation) feeds the status
//! surface and the emergency data package; it does not enter fusion math.
//! The one exception is a rollover, which is mapped to a `critical_event`
//! sample so the classifier and escalation machine see it.

use crate::config::TelemetryConfig;
use crate::types::{
    CollisionTarget, CriticalEvent, CriticalEventKind, SignalKind, SignalSample, SignalValue,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source id used for samples derived from raw vehicle state
pub const VEHICLE_STATE_SOURCE: &str = "vehicle_state";

/// Geographic position
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    /// Horizontal accuracy (m)
    pub accuracy: f64,
}

/// Vehicle orientation (degrees)
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rotation {
    pub pitch: f64,
    pub yaw: f64,
    pub roll: f64,
}

/// Snapshot of raw vehicle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleState {
    pub timestamp: DateTime<Utc>,
    pub speed_kmh: f64,
    /// Longitudinal acceleration (m/s²)
    #[serde(default)]
    pub acceleration: f64,
    #[serde(default)]
    pub gear: i32,
    #[serde(default)]
    pub rpm: f64,
    /// Throttle input, 0-1
    #[serde(default)]
    pub throttle: f64,
    /// Brake input, 0-1
    #[serde(default)]
    pub brake: f64,
    #[serde(default)]
    pub location: Option<GeoLocation>,
    #[serde(default)]
    pub rotation: Rotation,
}

/// Driving anomaly derived from controls and speed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrivingAnomaly {
    None,
    HardBrake,
    StuckOrBlocked,
    ExcessiveSpeeding,
}

/// Check for driving anomalies, most urgent first
pub fn detect_anomaly(state: &VehicleState, config: &TelemetryConfig) -> DrivingAnomaly {
    if state.brake >= 1.0 && state.speed_kmh > config.hard_brake_min_kmh {
        return DrivingAnomaly::HardBrake;
    }
    if state.throttle > config.stuck_throttle && state.speed_kmh < config.stuck_max_kmh {
        return DrivingAnomaly::StuckOrBlocked;
    }
    if state.speed_kmh > config.speeding_kmh {
        return DrivingAnomaly::ExcessiveSpeeding;
    }
    DrivingAnomaly::None
}

impl CollisionTarget {
    /// Classify a simulator/sensor actor type id, e.g. `vehicle.tesla.model3`
    pub fn classify(actor_type_id: &str) -> CollisionTarget {
        let id = actor_type_id.to_ascii_lowercase();
        if id.contains("vehicle") {
            CollisionTarget::Car
        } else if id.contains("pedestrian") || id.contains("walker") {
            CollisionTarget::Pedestrian
        } else if id.contains("pole") || id.contains("streetlamp") {
            CollisionTarget::Pole
        } else if id.contains("wall") || id.contains("building") {
            CollisionTarget::BuildingWall
        } else if id.contains("trafficlight") {
            CollisionTarget::TrafficLight
        } else if id.contains("static.vegetation") {
            CollisionTarget::Vegetation
        } else {
            CollisionTarget::Other
        }
    }
}

/// Build a collision critical-event sample from a sensor report
pub fn collision_sample(
    actor_type_id: &str,
    timestamp: DateTime<Utc>,
    source_id: impl Into<String>,
) -> SignalSample {
    SignalSample::new(
        SignalKind::CriticalEvent,
        SignalValue::Critical(CriticalEvent {
            event: CriticalEventKind::Collision,
            collided_with: Some(CollisionTarget::classify(actor_type_id)),
        }),
        timestamp,
        source_id,
    )
}

/// Map raw state to the samples it implies (currently only rollover)
pub fn derive_samples(state: &VehicleState, config: &TelemetryConfig) -> Vec<SignalSample> {
    let rotation = state.rotation;
    if rotation.roll.abs() >= config.rollover_deg || rotation.pitch.abs() >= config.rollover_deg {
        vec![SignalSample::critical(
            CriticalEventKind::Rollover,
            state.timestamp,
            VEHICLE_STATE_SOURCE,
        )]
    } else {
        Vec::new()
    }
}

/// Surrounding traffic, as reported by a perception collaborator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrafficContext {
    pub timestamp: DateTime<Utc>,
    /// Vehicles within `radius_m` of the ego vehicle
    pub nearby_vehicles: u32,
    /// Counting radius used by the producer; assumed to match the configured one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radius_m: Option<f64>,
}

/// Likely source of stress, used to pick between break and route suggestions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StressContext {
    Traffic,
    Personal,
    Unknown,
}

impl TrafficContext {
    pub fn stress_context(&self, config: &TelemetryConfig) -> StressContext {
        // A count over a wider area is not comparable with the threshold
        if self.radius_m.is_some_and(|r| r > config.traffic_radius_m) {
            return StressContext::Unknown;
        }
        if self.nearby_vehicles >= config.traffic_vehicle_threshold {
            StressContext::Traffic
        } else {
            StressContext::Personal
        }
    }
}

/// Vehicle section of the status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleStatus {
    pub speed_kmh: f64,
    pub anomaly: DrivingAnomaly,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nearby_vehicles: Option<u32>,
}
