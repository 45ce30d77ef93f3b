//! Core types for the wellness engine
//!
//! This module defines the data that flows through each stage of the decision
//! loop: raw signal samples, the fused wellness state, risk tiers and their
//! transitions, intervention records, and the messages exchanged with
//! collaborators (driver responses, delivery reports, vehicle commands).

use crate::escalation::EmergencyDataPackage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

/// Which producer family a signal kind comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalOrigin {
    /// Behavioral features derived from the cabin camera (~30 Hz)
    Vision,
    /// Vehicle telemetry (up to 100 Hz, downsampled)
    Telemetry,
    /// Discrete critical events (collision, rollover, no response)
    Event,
}

impl SignalOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalOrigin::Vision => "vision",
            SignalOrigin::Telemetry => "telemetry",
            SignalOrigin::Event => "event",
        }
    }
}

/// Kind of signal reported by a producer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Fraction of time the eyes are closed (PERCLOS), 0-1
    EyeClosure,
    /// Blinks per minute
    BlinkRate,
    /// Yawn detected in the current window
    Yawn,
    /// Head-pose class
    HeadPose,
    /// Gaze class
    Gaze,
    /// Emotion class
    Emotion,
    /// Heart-rate estimate (bpm)
    HeartRate,
    /// Steering stability, 0-1 (1 = perfectly stable)
    SteeringStability,
    /// Speed consistency, 0-1 (1 = perfectly consistent)
    SpeedConsistency,
    /// Lane deviation, 0-1 (1 = leaving the lane)
    LaneDeviation,
    /// Discrete critical event
    CriticalEvent,
}

impl SignalKind {
    pub const ALL: [SignalKind; 11] = [
        SignalKind::EyeClosure,
        SignalKind::BlinkRate,
        SignalKind::Yawn,
        SignalKind::HeadPose,
        SignalKind::Gaze,
        SignalKind::Emotion,
        SignalKind::HeartRate,
        SignalKind::SteeringStability,
        SignalKind::SpeedConsistency,
        SignalKind::LaneDeviation,
        SignalKind::CriticalEvent,
    ];

    pub fn origin(&self) -> SignalOrigin {
        match self {
            SignalKind::EyeClosure
            | SignalKind::BlinkRate
            | SignalKind::Yawn
            | SignalKind::HeadPose
            | SignalKind::Gaze
            | SignalKind::Emotion
            | SignalKind::HeartRate => SignalOrigin::Vision,
            SignalKind::SteeringStability
            | SignalKind::SpeedConsistency
            | SignalKind::LaneDeviation => SignalOrigin::Telemetry,
            SignalKind::CriticalEvent => SignalOrigin::Event,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SignalKind::EyeClosure => "eye_closure",
            SignalKind::BlinkRate => "blink_rate",
            SignalKind::Yawn => "yawn",
            SignalKind::HeadPose => "head_pose",
            SignalKind::Gaze => "gaze",
            SignalKind::Emotion => "emotion",
            SignalKind::HeartRate => "heart_rate",
            SignalKind::SteeringStability => "steering_stability",
            SignalKind::SpeedConsistency => "speed_consistency",
            SignalKind::LaneDeviation => "lane_deviation",
            SignalKind::CriticalEvent => "critical_event",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Head-pose classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HeadPoseClass {
    Forward,
    TurnedAway,
    Down,
    Nodding,
}

/// Gaze classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GazeClass {
    Road,
    Mirror,
    Dashboard,
    OffRoad,
}

/// Emotion classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmotionClass {
    Neutral,
    Happy,
    Surprise,
    Sad,
    Angry,
    Fear,
    Disgust,
}

impl EmotionClass {
    /// Angry, sad, fear and disgust count as negative affect
    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            EmotionClass::Sad | EmotionClass::Angry | EmotionClass::Fear | EmotionClass::Disgust
        )
    }
}

/// Kind of critical event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriticalEventKind {
    Collision,
    Rollover,
    NoResponse,
}

/// What the vehicle collided with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionTarget {
    Car,
    Pedestrian,
    Pole,
    #[serde(rename = "building/wall")]
    BuildingWall,
    TrafficLight,
    Vegetation,
    Other,
}

/// Payload of a critical-event sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CriticalEvent {
    pub event: CriticalEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub collided_with: Option<CollisionTarget>,
}

/// Typed value carried by a sample
///
/// Class names are disjoint across the categorical enums, so the untagged
/// representation stays unambiguous on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Flag(bool),
    Scalar(f64),
    HeadPose(HeadPoseClass),
    Gaze(GazeClass),
    Emotion(EmotionClass),
    Critical(CriticalEvent),
}

/// A single feature report from a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalSample {
    pub kind: SignalKind,
    pub value: SignalValue,
    /// Producer confidence, 0-1
    pub confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
}

impl SignalSample {
    pub fn new(
        kind: SignalKind,
        value: SignalValue,
        timestamp: DateTime<Utc>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            value,
            confidence: 1.0,
            timestamp,
            source_id: source_id.into(),
        }
    }

    pub fn scalar(
        kind: SignalKind,
        value: f64,
        timestamp: DateTime<Utc>,
        source_id: impl Into<String>,
    ) -> Self {
        Self::new(kind, SignalValue::Scalar(value), timestamp, source_id)
    }

    pub fn critical(
        event: CriticalEventKind,
        timestamp: DateTime<Utc>,
        source_id: impl Into<String>,
    ) -> Self {
        Self::new(
            SignalKind::CriticalEvent,
            SignalValue::Critical(CriticalEvent {
                event,
                collided_with: None,
            }),
            timestamp,
            source_id,
        )
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self.value {
            SignalValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_critical(&self) -> Option<CriticalEvent> {
        match self.value {
            SignalValue::Critical(event) => Some(event),
            _ => None,
        }
    }
}

/// The three wellness sub-scores
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubScoreKind {
    Fatigue,
    Stress,
    Attention,
}

impl SubScoreKind {
    pub const ALL: [SubScoreKind; 3] = [
        SubScoreKind::Fatigue,
        SubScoreKind::Stress,
        SubScoreKind::Attention,
    ];
}

/// Smoothed sub-score (0-100, higher is better) and its trend over the window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SubScore {
    pub value: f64,
    /// First difference over the trend window (points)
    pub trend: f64,
}

/// Fusion output status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FusionStatus {
    Ok,
    Degraded,
}

/// One point of smoothed history used for trend computation
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TrendPoint {
    pub at: DateTime<Utc>,
    pub sub_scores: [Option<f64>; 3],
    pub composite: Option<f64>,
}

/// Fused wellness state for one driver session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WellnessState {
    pub fatigue: Option<SubScore>,
    pub stress: Option<SubScore>,
    pub attention: Option<SubScore>,
    /// Composite wellness score, `None` while degraded
    pub composite: Option<f64>,
    pub composite_trend: Option<f64>,
    pub status: FusionStatus,
    pub updated_at: Option<DateTime<Utc>>,
    /// Kinds excluded from the last fusion because they were stale
    pub stale: Vec<SignalKind>,
    #[serde(skip)]
    pub(crate) history: VecDeque<TrendPoint>,
}

impl Default for WellnessState {
    fn default() -> Self {
        Self {
            fatigue: None,
            stress: None,
            attention: None,
            composite: None,
            composite_trend: None,
            status: FusionStatus::Degraded,
            updated_at: None,
            stale: Vec::new(),
            history: VecDeque::new(),
        }
    }
}

impl WellnessState {
    pub fn sub_score(&self, kind: SubScoreKind) -> Option<SubScore> {
        match kind {
            SubScoreKind::Fatigue => self.fatigue,
            SubScoreKind::Stress => self.stress,
            SubScoreKind::Attention => self.attention,
        }
    }

    pub(crate) fn set_sub_score(&mut self, kind: SubScoreKind, score: Option<SubScore>) {
        match kind {
            SubScoreKind::Fatigue => self.fatigue = score,
            SubScoreKind::Stress => self.stress = score,
            SubScoreKind::Attention => self.attention = score,
        }
    }

    /// The weakest sub-score, i.e. the dominant impairment
    pub fn dominant(&self) -> Option<SubScoreKind> {
        SubScoreKind::ALL
            .iter()
            .filter_map(|k| self.sub_score(*k).map(|s| (*k, s.value)))
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(k, _)| k)
    }
}

/// Ordered risk tiers, least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskTier {
    Nominal,
    Low,
    Medium,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskTier::Nominal => "nominal",
            RiskTier::Low => "low",
            RiskTier::Medium => "medium",
            RiskTier::High => "high",
            RiskTier::Critical => "critical",
        }
    }

    /// One step more severe, saturating at `Critical`
    pub fn escalated(&self) -> RiskTier {
        match self {
            RiskTier::Nominal => RiskTier::Low,
            RiskTier::Low => RiskTier::Medium,
            RiskTier::Medium => RiskTier::High,
            RiskTier::High | RiskTier::Critical => RiskTier::Critical,
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a tier transition happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TransitionCause {
    /// The composite score entered the target band
    ScoreBand { score: f64, trend: Option<f64> },
    /// The composite is falling fast enough to classify one band worse
    RapidDecline { score: f64, trend: f64 },
    /// A critical-event sample short-circuited the classifier
    CriticalEvent { event: CriticalEventKind },
}

/// Audit record of a tier change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierTransition {
    pub from: RiskTier,
    pub to: RiskTier,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub cause: TransitionCause,
    /// Sample that triggered the change, for audit and replay
    pub trigger: Option<SignalSample>,
}

impl TierTransition {
    pub fn is_upgrade(&self) -> bool {
        self.to > self.from
    }
}

/// Intervention categories
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionCategory {
    Reminder,
    Engagement,
    BreakSuggestion,
    RouteChange,
    EmergencyContact,
}

impl InterventionCategory {
    pub const ALL: [InterventionCategory; 5] = [
        InterventionCategory::Reminder,
        InterventionCategory::Engagement,
        InterventionCategory::BreakSuggestion,
        InterventionCategory::RouteChange,
        InterventionCategory::EmergencyContact,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            InterventionCategory::Reminder => "reminder",
            InterventionCategory::Engagement => "engagement",
            InterventionCategory::BreakSuggestion => "break_suggestion",
            InterventionCategory::RouteChange => "route_change",
            InterventionCategory::EmergencyContact => "emergency_contact",
        }
    }
}

impl fmt::Display for InterventionCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of an intervention
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterventionOutcome {
    /// Issued, awaiting the driver
    Pending,
    Acknowledged,
    /// Not acknowledged before the acknowledgement timeout
    Ignored,
    /// Withdrawn because an emergency took over
    Suppressed,
}

/// A single issued intervention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterventionRecord {
    pub id: Uuid,
    pub category: InterventionCategory,
    pub tier_at_trigger: RiskTier,
    pub issued_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub outcome: InterventionOutcome,
    pub closed_at: Option<DateTime<Utc>>,
}

impl InterventionRecord {
    pub fn is_open(&self) -> bool {
        self.outcome == InterventionOutcome::Pending
    }
}

/// How the driver cancelled an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMethod {
    Manual,
    Voice,
    /// Biometric confirmation of responsiveness
    Biometric,
}

/// What the driver said or did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum ResponseKind {
    /// Cancel an escalation in progress
    Cancel { method: OverrideMethod },
    /// Acknowledge an intervention (all open ones when no category is given)
    Acknowledge {
        #[serde(default)]
        category: Option<InterventionCategory>,
    },
}

/// Asynchronous signal on the driver response channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverResponse {
    #[serde(flatten)]
    pub kind: ResponseKind,
    pub at: DateTime<Utc>,
}

impl DriverResponse {
    pub fn cancel(method: OverrideMethod, at: DateTime<Utc>) -> Self {
        Self {
            kind: ResponseKind::Cancel { method },
            at,
        }
    }

    pub fn acknowledge(category: Option<InterventionCategory>, at: DateTime<Utc>) -> Self {
        Self {
            kind: ResponseKind::Acknowledge { category },
            at,
        }
    }
}

/// Deceleration profile requested during securement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecelerationProfile {
    Controlled,
    Firm,
}

/// Commands for the vehicle-control actuator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum VehicleCommand {
    HazardLights { on: bool },
    Decelerate { profile: DecelerationProfile },
    CancelDeceleration,
    LaneHold { engage: bool },
}

impl VehicleCommand {
    pub fn label(&self) -> String {
        match self {
            VehicleCommand::HazardLights { on } => {
                format!("hazard_lights_{}", if *on { "on" } else { "off" })
            }
            VehicleCommand::Decelerate { profile } => format!("decelerate_{profile:?}").to_lowercase(),
            VehicleCommand::CancelDeceleration => "cancel_deceleration".to_string(),
            VehicleCommand::LaneHold { engage } => {
                format!("lane_hold_{}", if *engage { "engage" } else { "disengage" })
            }
        }
    }
}

/// Work the decision loop hands to collaborators
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Vehicle { command: VehicleCommand },
    TransmitPackage {
        case_id: Uuid,
        attempt: u32,
        package: EmergencyDataPackage,
    },
    AbortTransmission { case_id: Uuid },
}

/// Result of one package transmission attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub case_id: Uuid,
    pub attempt: u32,
    pub delivered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Result of applying a vehicle command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuatorReport {
    pub command: VehicleCommand,
    pub applied: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

/// Messages accepted by the engine at any time, applied at the next cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Driver(DriverResponse),
    Delivery(DeliveryReport),
    Actuator(ActuatorReport),
    /// External responder acknowledged the emergency
    ResponderAck {
        #[serde(default)]
        case_id: Option<Uuid>,
        at: DateTime<Utc>,
    },
}
