//! Baseline management
//!
//! Per-driver running mean/variance for each raw feature channel and each
//! sub-score. Baselines turn absolute readings into personalized deviation
//! scores, are persisted across sessions, and decay toward population
//! defaults while a driver is not seen.

use crate::config::BaselineConfig;
use crate::error::EngineError;
use crate::types::{SignalKind, SubScoreKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Exponentially weighted mean and variance
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RunningStats {
    pub mean: f64,
    pub variance: f64,
}

impl RunningStats {
    pub fn new(mean: f64, std_dev: f64) -> Self {
        Self {
            mean,
            variance: std_dev * std_dev,
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt()
    }

    /// Fold one observation in with weight `alpha`
    pub fn update(&mut self, value: f64, alpha: f64) {
        let delta = value - self.mean;
        self.mean += alpha * delta;
        self.variance = (1.0 - alpha) * (self.variance + alpha * delta * delta);
    }

    /// Move `weight` of the way toward `target`
    fn blend_toward(&mut self, target: &RunningStats, weight: f64) {
        self.mean += weight * (target.mean - self.mean);
        self.variance += weight * (target.variance - self.variance);
    }
}

/// Raw scalar channels that are scored against a baseline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureChannel {
    EyeClosure,
    BlinkRate,
    HeartRate,
    SteeringStability,
    SpeedConsistency,
    LaneDeviation,
}

impl FeatureChannel {
    pub const ALL: [FeatureChannel; 6] = [
        FeatureChannel::EyeClosure,
        FeatureChannel::BlinkRate,
        FeatureChannel::HeartRate,
        FeatureChannel::SteeringStability,
        FeatureChannel::SpeedConsistency,
        FeatureChannel::LaneDeviation,
    ];

    pub fn from_kind(kind: SignalKind) -> Option<FeatureChannel> {
        match kind {
            SignalKind::EyeClosure => Some(FeatureChannel::EyeClosure),
            SignalKind::BlinkRate => Some(FeatureChannel::BlinkRate),
            SignalKind::HeartRate => Some(FeatureChannel::HeartRate),
            SignalKind::SteeringStability => Some(FeatureChannel::SteeringStability),
            SignalKind::SpeedConsistency => Some(FeatureChannel::SpeedConsistency),
            SignalKind::LaneDeviation => Some(FeatureChannel::LaneDeviation),
            _ => None,
        }
    }

    /// Population defaults used for new drivers and as the decay target
    pub fn population(&self) -> RunningStats {
        match self {
            FeatureChannel::EyeClosure => RunningStats::new(0.10, 0.08),
            FeatureChannel::BlinkRate => RunningStats::new(17.0, 5.0),
            FeatureChannel::HeartRate => RunningStats::new(72.0, 10.0),
            FeatureChannel::SteeringStability => RunningStats::new(0.85, 0.10),
            FeatureChannel::SpeedConsistency => RunningStats::new(0.85, 0.10),
            FeatureChannel::LaneDeviation => RunningStats::new(0.10, 0.08),
        }
    }

    /// Project a signed z-score onto the impairing direction.
    ///
    /// Blink rate is impairing both ways (staring and rapid blinking);
    /// stability and consistency are impairing when they fall.
    pub fn impairment(&self, z: f64) -> f64 {
        match self {
            FeatureChannel::BlinkRate => z.abs(),
            FeatureChannel::SteeringStability | FeatureChannel::SpeedConsistency => -z,
            FeatureChannel::EyeClosure
            | FeatureChannel::HeartRate
            | FeatureChannel::LaneDeviation => z,
        }
    }
}

fn sub_score_population() -> RunningStats {
    RunningStats::new(90.0, 8.0)
}

/// Raw values accepted into the baseline after one fusion
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BaselineObservation {
    pub features: Vec<(FeatureChannel, f64)>,
    pub sub_scores: Vec<(SubScoreKind, f64)>,
}

impl BaselineObservation {
    pub fn is_empty(&self) -> bool {
        self.features.is_empty() && self.sub_scores.is_empty()
    }
}

/// Historical statistics for one driver
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverBaseline {
    pub driver_id: String,
    pub features: BTreeMap<FeatureChannel, RunningStats>,
    pub sub_scores: BTreeMap<SubScoreKind, RunningStats>,
    /// Sessions this baseline has been used for
    pub sessions: u32,
    /// Observations folded in since creation
    #[serde(default)]
    pub observations: u64,
    pub last_seen: DateTime<Utc>,
}

impl DriverBaseline {
    /// A fresh baseline seeded with population defaults
    pub fn population(driver_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            driver_id: driver_id.into(),
            features: FeatureChannel::ALL
                .iter()
                .map(|c| (*c, c.population()))
                .collect(),
            sub_scores: SubScoreKind::ALL
                .iter()
                .map(|k| (*k, sub_score_population()))
                .collect(),
            sessions: 0,
            observations: 0,
            last_seen: now,
        }
    }

    /// Signed z-score of `value` on `channel`.
    ///
    /// The standard deviation is floored at a fraction of the population
    /// spread so a very consistent driver does not produce runaway scores.
    pub fn z_score(&self, channel: FeatureChannel, value: f64, config: &BaselineConfig) -> f64 {
        let population = channel.population();
        let stats = self.features.get(&channel).copied().unwrap_or(population);
        let floor = (population.std_dev() * config.min_std_fraction).max(f64::EPSILON);
        (value - stats.mean) / stats.std_dev().max(floor)
    }

    /// Fold an accepted observation in
    pub fn observe(&mut self, observation: &BaselineObservation, config: &BaselineConfig, now: DateTime<Utc>) {
        for (channel, value) in &observation.features {
            self.features
                .entry(*channel)
                .or_insert_with(|| channel.population())
                .update(*value, config.alpha);
        }
        for (kind, value) in &observation.sub_scores {
            self.sub_scores
                .entry(*kind)
                .or_insert_with(sub_score_population)
                .update(*value, config.alpha);
        }
        self.observations += 1;
        self.last_seen = now;
    }

    /// Decay toward population defaults for the time the driver went unseen
    pub fn decay(&mut self, now: DateTime<Utc>, config: &BaselineConfig) {
        let unseen_days = (now - self.last_seen).num_seconds() as f64 / 86_400.0;
        if unseen_days <= 0.0 || config.decay_half_life_days <= 0.0 {
            return;
        }
        let weight = 1.0 - 0.5_f64.powf(unseen_days / config.decay_half_life_days);
        for (channel, stats) in self.features.iter_mut() {
            stats.blend_toward(&channel.population(), weight);
        }
        let population = sub_score_population();
        for stats in self.sub_scores.values_mut() {
            stats.blend_toward(&population, weight);
        }
        tracing::debug!(driver_id = %self.driver_id, unseen_days, weight, "Decayed baseline");
    }
}

/// Baselines for every known driver
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaselineStore {
    drivers: BTreeMap<String, DriverBaseline>,
}

impl BaselineStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Baseline for a new session: created on first sight, otherwise decayed
    /// for the time unseen. The session owns the returned copy until it is
    /// handed back with [`BaselineStore::store`].
    pub fn session_for(&mut self, driver_id: &str, now: DateTime<Utc>, config: &BaselineConfig) -> DriverBaseline {
        let baseline = self
            .drivers
            .entry(driver_id.to_string())
            .and_modify(|b| b.decay(now, config))
            .or_insert_with(|| {
                tracing::info!(driver_id, "Created population baseline");
                DriverBaseline::population(driver_id, now)
            });
        baseline.sessions += 1;
        baseline.last_seen = now;
        baseline.clone()
    }

    /// Write a session's baseline back
    pub fn store(&mut self, baseline: DriverBaseline) {
        self.drivers.insert(baseline.driver_id.clone(), baseline);
    }

    pub fn get(&self, driver_id: &str) -> Option<&DriverBaseline> {
        self.drivers.get(driver_id)
    }

    pub fn driver_count(&self) -> usize {
        self.drivers.len()
    }

    /// Load baseline store from JSON
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize baseline store to JSON
    pub fn to_json(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Load from a file, starting empty when the file does not exist yet
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        match std::fs::read_to_string(path) {
            Ok(json) => Self::from_json(&json)
                .map_err(|e| EngineError::Persistence(format!("{}: {e}", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), EngineError> {
        std::fs::write(path, self.to_json()?)?;
        Ok(())
    }
}
