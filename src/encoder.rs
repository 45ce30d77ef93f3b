//! Status encoding
//!
//! This module encodes one decision cycle into the status event pushed to
//! the presentation/telemetry stream. Every event carries producer
//! metadata so consumers can tell engine instances apart.

use crate::error::{EngineError, Fault};
use crate::escalation::{EscalationCase, EscalationStatus};
use crate::telemetry::VehicleStatus;
use crate::types::{
    FusionStatus, InterventionRecord, RiskTier, SignalKind, SubScore, WellnessState,
};
use crate::{ENGINE_VERSION, PRODUCER_NAME};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current status event schema
pub const STATUS_SCHEMA: &str = "wellness.status.v1";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusProducer {
    pub name: String,
    pub version: String,
    pub instance_id: String,
}

/// Fusion section of the status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionSection {
    pub status: FusionStatus,
    pub composite: Option<f64>,
    pub composite_trend: Option<f64>,
    pub fatigue: Option<SubScore>,
    pub stress: Option<SubScore>,
    pub attention: Option<SubScore>,
}

/// One cycle's status, as published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub schema: String,
    pub producer: StatusProducer,
    pub session_id: Uuid,
    pub driver_id: String,
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub fusion: FusionSection,
    pub tier: RiskTier,
    pub tier_entered_at: Option<DateTime<Utc>>,
    /// Open interventions
    pub interventions: Vec<InterventionRecord>,
    pub escalation: Option<EscalationStatus>,
    pub stale: Vec<SignalKind>,
    pub faults: Vec<Fault>,
    pub invalid_samples: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle: Option<VehicleStatus>,
}

impl StatusEvent {
    pub fn is_degraded(&self) -> bool {
        self.fusion.status == FusionStatus::Degraded
    }
}

/// Everything the encoder reads for one cycle
pub struct CycleView<'a> {
    pub session_id: Uuid,
    pub driver_id: &'a str,
    pub cycle: u64,
    pub at: DateTime<Utc>,
    pub state: &'a WellnessState,
    pub tier: RiskTier,
    pub tier_entered_at: Option<DateTime<Utc>>,
    pub interventions: Vec<InterventionRecord>,
    pub escalation: Option<&'a EscalationCase>,
    pub faults: Vec<Fault>,
    pub invalid_samples: u64,
    pub vehicle: Option<VehicleStatus>,
}

/// Status encoder
pub struct StatusEncoder {
    instance_id: String,
}

impl Default for StatusEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusEncoder {
    /// Create a new encoder with a unique instance ID
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    /// Create an encoder with a specific instance ID
    pub fn with_instance_id(instance_id: String) -> Self {
        Self { instance_id }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn encode(&self, view: CycleView<'_>) -> StatusEvent {
        let state = view.state;
        StatusEvent {
            schema: STATUS_SCHEMA.to_string(),
            producer: StatusProducer {
                name: PRODUCER_NAME.to_string(),
                version: ENGINE_VERSION.to_string(),
                instance_id: self.instance_id.clone(),
            },
            session_id: view.session_id,
            driver_id: view.driver_id.to_string(),
            cycle: view.cycle,
            at: view.at,
            fusion: FusionSection {
                status: state.status,
                composite: state.composite,
                composite_trend: state.composite_trend,
                fatigue: state.fatigue,
                stress: state.stress,
                attention: state.attention,
            },
            tier: view.tier,
            tier_entered_at: view.tier_entered_at,
            interventions: view.interventions,
            escalation: view.escalation.map(EscalationStatus::from),
            stale: state.stale.clone(),
            faults: view.faults,
            invalid_samples: view.invalid_samples,
            vehicle: view.vehicle,
        }
    }

    pub fn encode_to_json(&self, view: CycleView<'_>) -> Result<String, EngineError> {
        Ok(serde_json::to_string(&self.encode(view))?)
    }
}
