//! Engine configuration
//!
//! Every threshold the decision loop uses lives here, with defaults matching
//! the documented behavior. All structs deserialize with `#[serde(default)]`
//! so a partial JSON document overrides only what it names.

use crate::error::EngineError;
use crate::types::{RiskTier, SignalOrigin};
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Convert a millisecond setting into a chrono duration
pub(crate) fn ms(value: u64) -> Duration {
    Duration::milliseconds(value.min(i64::MAX as u64) as i64)
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Decision-loop period (ms)
    pub cycle_ms: u64,
    pub normalizer: NormalizerConfig,
    pub fusion: FusionConfig,
    pub baseline: BaselineConfig,
    pub classifier: ClassifierConfig,
    pub intervention: InterventionConfig,
    pub escalation: EscalationConfig,
    pub telemetry: TelemetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_ms: 100,
            normalizer: NormalizerConfig::default(),
            fusion: FusionConfig::default(),
            baseline: BaselineConfig::default(),
            classifier: ClassifierConfig::default(),
            intervention: InterventionConfig::default(),
            escalation: EscalationConfig::default(),
            telemetry: TelemetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from JSON and validate it
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to pretty JSON
    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.cycle_ms == 0 {
            return Err(EngineError::Config("cycle_ms must be positive".into()));
        }
        if !(0.0..=1.0).contains(&self.normalizer.confidence_floor) {
            return Err(EngineError::Config(
                "normalizer.confidence_floor must be within 0-1".into(),
            ));
        }
        if self.fusion.half_life_ms == 0 {
            return Err(EngineError::Config("fusion.half_life_ms must be positive".into()));
        }
        let weights = &self.fusion.composite_weights;
        if [weights.fatigue, weights.stress, weights.attention]
            .iter()
            .any(|w| !w.is_finite() || *w < 0.0)
            || weights.total() <= 0.0
        {
            return Err(EngineError::Config(
                "fusion.composite_weights must be non-negative with a positive sum".into(),
            ));
        }
        let b = &self.classifier.breakpoints;
        if !(b.low > b.medium && b.medium > b.high && b.high > b.critical) {
            return Err(EngineError::Config(
                "classifier.breakpoints must be strictly descending (low > medium > high > critical)"
                    .into(),
            ));
        }
        if !(0.0..=100.0).contains(&b.low) || !(0.0..=100.0).contains(&b.critical) {
            return Err(EngineError::Config(
                "classifier.breakpoints must lie within 0-100".into(),
            ));
        }
        if self.escalation.max_transmit_attempts == 0 {
            return Err(EngineError::Config(
                "escalation.max_transmit_attempts must be at least 1".into(),
            ));
        }
        if self.escalation.required_consecutive == 0 {
            return Err(EngineError::Config(
                "escalation.required_consecutive must be at least 1".into(),
            ));
        }
        if !self.telemetry.traffic_radius_m.is_finite() || self.telemetry.traffic_radius_m <= 0.0 {
            return Err(EngineError::Config(
                "telemetry.traffic_radius_m must be positive".into(),
            ));
        }
        if self.baseline.alpha <= 0.0 || self.baseline.alpha > 1.0 {
            return Err(EngineError::Config("baseline.alpha must be within (0, 1]".into()));
        }
        Ok(())
    }
}

/// Signal normalizer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Staleness threshold for vision-derived kinds (ms)
    pub vision_staleness_ms: u64,
    /// Staleness threshold for telemetry kinds (ms)
    pub telemetry_staleness_ms: u64,
    /// How long a critical-event sample counts as fresh (ms)
    pub event_staleness_ms: u64,
    /// Samples below this confidence are ignored by fusion
    pub confidence_floor: f64,
    /// A producer origin silent for this long is reported offline (ms)
    pub watchdog_ms: u64,
    /// Maximum critical events queued between two cycles
    pub max_pending_events: usize,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            vision_staleness_ms: 2_000,
            telemetry_staleness_ms: 1_000,
            event_staleness_ms: 2_000,
            confidence_floor: 0.5,
            watchdog_ms: 10_000,
            max_pending_events: 32,
        }
    }
}

impl NormalizerConfig {
    pub fn staleness_for(&self, origin: SignalOrigin) -> Duration {
        match origin {
            SignalOrigin::Vision => ms(self.vision_staleness_ms),
            SignalOrigin::Telemetry => ms(self.telemetry_staleness_ms),
            SignalOrigin::Event => ms(self.event_staleness_ms),
        }
    }
}

/// Weights of the three sub-scores in the composite
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompositeWeights {
    pub fatigue: f64,
    pub stress: f64,
    pub attention: f64,
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            fatigue: 1.0 / 3.0,
            stress: 1.0 / 3.0,
            attention: 1.0 / 3.0,
        }
    }
}

impl CompositeWeights {
    pub fn total(&self) -> f64 {
        self.fatigue + self.stress + self.attention
    }
}

/// Fusion engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FusionConfig {
    /// EMA half-life for sub-score smoothing (ms)
    pub half_life_ms: u64,
    /// Window for the first-difference trend (ms)
    pub trend_window_ms: u64,
    pub composite_weights: CompositeWeights,
    /// Baselines are only nudged while the composite is at or above this
    pub normal_band_floor: f64,
    /// Clip for baseline z-scores
    pub z_clip: f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            half_life_ms: 3_000,
            trend_window_ms: 5_000,
            composite_weights: CompositeWeights::default(),
            normal_band_floor: 85.0,
            z_clip: 3.0,
        }
    }
}

/// Baseline estimator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BaselineConfig {
    /// Exponential weight of each accepted observation
    pub alpha: f64,
    /// Half-life of the decay toward population defaults while unseen (days)
    pub decay_half_life_days: f64,
    /// Floor on the standard deviation used for z-scores, as a fraction of
    /// the population standard deviation
    pub min_std_fraction: f64,
}

impl Default for BaselineConfig {
    fn default() -> Self {
        Self {
            alpha: 0.02,
            decay_half_life_days: 30.0,
            min_std_fraction: 0.25,
        }
    }
}

/// Composite-score breakpoints (lower bound of each band)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierBreakpoints {
    /// Scores at or above this are Nominal
    pub low: f64,
    /// Scores at or above this (and below `low`) are Low
    pub medium: f64,
    /// Scores at or above this (and below `medium`) are Medium
    pub high: f64,
    /// Scores at or above this (and below `high`) are High; below is Critical
    pub critical: f64,
}

impl Default for TierBreakpoints {
    fn default() -> Self {
        Self {
            low: 85.0,
            medium: 70.0,
            high: 50.0,
            critical: 30.0,
        }
    }
}

impl TierBreakpoints {
    pub fn band(&self, score: f64) -> RiskTier {
        if score >= self.low {
            RiskTier::Nominal
        } else if score >= self.medium {
            RiskTier::Low
        } else if score >= self.high {
            RiskTier::Medium
        } else if score >= self.critical {
            RiskTier::High
        } else {
            RiskTier::Critical
        }
    }
}

/// Risk classifier settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub breakpoints: TierBreakpoints,
    /// Minimum time in a less severe band before downgrading (ms)
    pub dwell_ms: u64,
    /// Composite trend (points over the trend window) at or below which the
    /// band is read one tier more severe, capped at High
    pub rapid_decline_points: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            breakpoints: TierBreakpoints::default(),
            dwell_ms: 3_000,
            rapid_decline_points: -15.0,
        }
    }
}

/// Intervention selector settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterventionConfig {
    /// Minimum spacing between two records of the same category (ms)
    pub cooldown_ms: u64,
    /// Open records not acknowledged within this are closed as ignored (ms)
    pub acknowledge_timeout_ms: u64,
    /// Re-evaluation period while the tier stays above Low (ms)
    pub reevaluate_ms: u64,
    /// Pre-notify the emergency contact at High tier
    pub emergency_contact_prenotify: bool,
}

impl Default for InterventionConfig {
    fn default() -> Self {
        Self {
            cooldown_ms: 120_000,
            acknowledge_timeout_ms: 30_000,
            reevaluate_ms: 30_000,
            emergency_contact_prenotify: true,
        }
    }
}

/// Escalation state machine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Budget for confirming the cause (ms)
    pub assessing_budget_ms: u64,
    /// Budget for the actuator to confirm securement commands (ms)
    pub securing_budget_ms: u64,
    /// Driver override window, from Securing entry (ms)
    pub override_window_ms: u64,
    /// Delay from Securing entry until the package is transmitted (ms)
    pub calling_delay_ms: u64,
    /// Budget for delivering the package, from Calling entry (ms)
    pub calling_budget_ms: u64,
    pub max_transmit_attempts: u32,
    /// Delay between a failed attempt and the retry (ms)
    pub retry_backoff_ms: u64,
    /// Budget for Monitoring before the case is closed anyway (ms)
    pub monitoring_budget_ms: u64,
    /// Composite score the driver must recover to during Monitoring
    pub recovery_score: f64,
    /// Consecutive critical-qualifying samples needed without corroboration
    pub required_consecutive: u32,
    /// Distinct sources reporting critical events that count as corroboration
    pub corroboration_sources: usize,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            assessing_budget_ms: 2_000,
            securing_budget_ms: 8_000,
            override_window_ms: 10_000,
            calling_delay_ms: 5_000,
            calling_budget_ms: 10_000,
            max_transmit_attempts: 3,
            retry_backoff_ms: 500,
            monitoring_budget_ms: 600_000,
            recovery_score: 70.0,
            required_consecutive: 2,
            corroboration_sources: 2,
        }
    }
}

/// Raw vehicle-state interpretation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub speeding_kmh: f64,
    /// Full braking above this speed is a hard brake
    pub hard_brake_min_kmh: f64,
    /// Throttle above `stuck_throttle` below this speed is stuck/blocked
    pub stuck_max_kmh: f64,
    pub stuck_throttle: f64,
    /// Roll or pitch at or beyond this angle is a rollover (degrees)
    pub rollover_deg: f64,
    /// Nearby vehicle count at which stress is attributed to traffic
    pub traffic_vehicle_threshold: u32,
    /// Widest counting radius for which `traffic_vehicle_threshold` applies (m)
    pub traffic_radius_m: f64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            speeding_kmh: 80.0,
            hard_brake_min_kmh: 30.0,
            stuck_max_kmh: 1.0,
            stuck_throttle: 0.5,
            rollover_deg: 60.0,
            traffic_vehicle_threshold: 10,
            traffic_radius_m: 50.0,
        }
    }
}
