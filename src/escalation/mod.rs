//! Emergency escalation
//!
//! A case moves through `Assessing → Securing → Calling → Monitoring →
//! Resolved`. Every phase carries a wall-clock deadline that is evaluated
//! by the decision loop; collaborator I/O is requested through
//! [`Command`](crate::types::Command)s and its results come back as
//! inbound reports, so the machine never waits on a collaborator.

mod log;
mod machine;
mod package;

pub use log::CaseLog;
pub use machine::{EscalationInput, EscalationMachine, EscalationOutput};
pub use package::{EmergencyDataPackage, SessionProfile, VehicleInfo};

use crate::types::{CollisionTarget, CriticalEventKind, OverrideMethod, VehicleCommand};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPhase {
    Idle,
    Assessing,
    Securing,
    Calling,
    Monitoring,
    Resolved,
}

impl EscalationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationPhase::Idle => "idle",
            EscalationPhase::Assessing => "assessing",
            EscalationPhase::Securing => "securing",
            EscalationPhase::Calling => "calling",
            EscalationPhase::Monitoring => "monitoring",
            EscalationPhase::Resolved => "resolved",
        }
    }
}

impl fmt::Display for EscalationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What opened the case, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CauseKind {
    /// Composite score in the Critical band
    CriticalTier,
    NoResponse,
    Collision,
    Rollover,
}

impl CauseKind {
    pub fn is_event(&self) -> bool {
        !matches!(self, CauseKind::CriticalTier)
    }

    pub fn incident_type(&self) -> &'static str {
        match self {
            CauseKind::CriticalTier => "critical_wellness",
            CauseKind::NoResponse => "driver_unresponsive",
            CauseKind::Collision => "collision",
            CauseKind::Rollover => "rollover",
        }
    }

    pub fn severity(&self) -> &'static str {
        match self {
            CauseKind::CriticalTier | CauseKind::NoResponse => "high",
            CauseKind::Collision | CauseKind::Rollover => "critical",
        }
    }
}

impl From<CriticalEventKind> for CauseKind {
    fn from(event: CriticalEventKind) -> Self {
        match event {
            CriticalEventKind::Collision => CauseKind::Collision,
            CriticalEventKind::Rollover => CauseKind::Rollover,
            CriticalEventKind::NoResponse => CauseKind::NoResponse,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationCause {
    pub kind: CauseKind,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collided_with: Option<CollisionTarget>,
    /// Composite score when a Critical-tier reading opened the case
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolution", rename_all = "snake_case")]
pub enum CaseResolution {
    /// The driver cancelled inside the override window
    FalseAlarm { method: OverrideMethod },
    /// Driver responsive and composite back above the recovery score
    Recovered,
    ResponderAcknowledged,
    /// Monitoring ran out its budget without another resolution
    MonitoringTimeout,
}

/// Emergency package delivery state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CommState {
    NotStarted,
    InFlight { attempt: u32 },
    RetryPending { next_attempt: u32, at: DateTime<Utc> },
    Delivered { attempt: u32 },
    /// All attempts failed
    Failed { attempts: u32 },
    /// Withdrawn by a driver override before delivery
    Suppressed,
}

impl CommState {
    pub fn label(&self) -> &'static str {
        match self {
            CommState::NotStarted => "not_started",
            CommState::InFlight { .. } => "in_flight",
            CommState::RetryPending { .. } => "retry_pending",
            CommState::Delivered { .. } => "delivered",
            CommState::Failed { .. } => "comm_failed",
            CommState::Suppressed => "suppressed",
        }
    }
}

/// One entry in a case's phase timeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEntry {
    pub at: DateTime<Utc>,
    pub phase: EscalationPhase,
    pub note: String,
}

/// An open (or just archived) escalation case
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationCase {
    pub id: Uuid,
    pub cause: EscalationCause,
    pub phase: EscalationPhase,
    pub phase_deadline: DateTime<Utc>,
    pub override_count: u32,
    pub data_package: Option<EmergencyDataPackage>,
    pub comm: CommState,
    pub opened_at: DateTime<Utc>,
    pub timeline: Vec<TimelineEntry>,
    pub resolution: Option<CaseResolution>,
    /// Deadline for the actuator to confirm securement
    pub secure_by: Option<DateTime<Utc>>,
    /// Last instant a driver cancel counts as a false alarm
    pub override_until: Option<DateTime<Utc>>,
    /// When the package goes out
    pub call_at: Option<DateTime<Utc>>,
    pub driver_responsive: bool,
    #[serde(skip)]
    pub(crate) confirmations: u32,
    #[serde(skip)]
    pub(crate) sources: BTreeSet<String>,
    #[serde(skip)]
    pub(crate) awaiting_actuator: Vec<VehicleCommand>,
}

impl EscalationCase {
    pub(crate) fn record(&mut self, at: DateTime<Utc>, note: impl Into<String>) {
        self.timeline.push(TimelineEntry {
            at,
            phase: self.phase,
            note: note.into(),
        });
    }
}

/// Escalation section of the status event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationStatus {
    pub case_id: Uuid,
    pub phase: EscalationPhase,
    pub cause: CauseKind,
    pub phase_deadline: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_until: Option<DateTime<Utc>>,
    pub override_count: u32,
    pub comm: String,
}

impl From<&EscalationCase> for EscalationStatus {
    fn from(case: &EscalationCase) -> Self {
        Self {
            case_id: case.id,
            phase: case.phase,
            cause: case.cause.kind,
            phase_deadline: case.phase_deadline,
            override_until: case.override_until,
            override_count: case.override_count,
            comm: case.comm.label().to_string(),
        }
    }
}
