//! Wellness fusion
//!
//! Combines fresh signals into the fatigue, stress and attention sub-scores
//! and a composite score. All scores are wellness-oriented: 100 means no
//! impairment. Fusion is a pure function of (snapshot, prior state,
//! baseline); the caller applies the returned baseline observation.

use crate::baseline::{BaselineObservation, DriverBaseline, FeatureChannel};
use crate::config::{BaselineConfig, FusionConfig};
use crate::normalizer::SignalSnapshot;
use crate::types::{
    EmotionClass, FusionStatus, GazeClass, HeadPoseClass, SignalKind, SignalSample, SignalValue,
    SubScore, SubScoreKind, TrendPoint, WellnessState,
};
use chrono::{DateTime, Utc};

/// Fixed input weights per sub-score
const FATIGUE_INPUTS: [(SignalKind, f64); 4] = [
    (SignalKind::EyeClosure, 0.4),
    (SignalKind::BlinkRate, 0.2),
    (SignalKind::Yawn, 0.2),
    (SignalKind::HeadPose, 0.2),
];

const STRESS_INPUTS: [(SignalKind, f64); 4] = [
    (SignalKind::Emotion, 0.4),
    (SignalKind::SteeringStability, 0.2),
    (SignalKind::SpeedConsistency, 0.2),
    (SignalKind::HeartRate, 0.2),
];

const ATTENTION_INPUTS: [(SignalKind, f64); 3] = [
    (SignalKind::Gaze, 0.5),
    (SignalKind::HeadPose, 0.3),
    (SignalKind::LaneDeviation, 0.2),
];

fn inputs_for(kind: SubScoreKind) -> &'static [(SignalKind, f64)] {
    match kind {
        SubScoreKind::Fatigue => &FATIGUE_INPUTS,
        SubScoreKind::Stress => &STRESS_INPUTS,
        SubScoreKind::Attention => &ATTENTION_INPUTS,
    }
}

fn sub_score_index(kind: SubScoreKind) -> usize {
    match kind {
        SubScoreKind::Fatigue => 0,
        SubScoreKind::Stress => 1,
        SubScoreKind::Attention => 2,
    }
}

fn gaze_score(gaze: GazeClass) -> f64 {
    match gaze {
        GazeClass::Road => 100.0,
        GazeClass::Mirror => 85.0,
        GazeClass::Dashboard => 60.0,
        GazeClass::OffRoad => 0.0,
    }
}

fn emotion_score(emotion: EmotionClass) -> f64 {
    match emotion {
        EmotionClass::Neutral | EmotionClass::Happy => 100.0,
        EmotionClass::Surprise => 70.0,
        EmotionClass::Sad | EmotionClass::Disgust => 45.0,
        EmotionClass::Fear => 20.0,
        EmotionClass::Angry => 15.0,
    }
}

/// Head pose read as a drowsiness cue
fn head_pose_fatigue_score(pose: HeadPoseClass) -> f64 {
    match pose {
        HeadPoseClass::Nodding => 0.0,
        HeadPoseClass::Down => 30.0,
        HeadPoseClass::Forward | HeadPoseClass::TurnedAway => 100.0,
    }
}

/// Head pose read as a distraction cue
fn head_pose_attention_score(pose: HeadPoseClass) -> f64 {
    match pose {
        HeadPoseClass::Forward => 100.0,
        HeadPoseClass::TurnedAway => 20.0,
        HeadPoseClass::Down => 30.0,
        HeadPoseClass::Nodding => 10.0,
    }
}

/// Fusion result for one cycle
#[derive(Debug, Clone, PartialEq)]
pub struct FusionOutput {
    pub state: WellnessState,
    /// Present only when the composite sits in the normal band
    pub observation: Option<BaselineObservation>,
}

/// Sub-score and composite computation
#[derive(Debug, Clone, Default)]
pub struct FusionEngine {
    config: FusionConfig,
    baseline_config: BaselineConfig,
}

impl FusionEngine {
    pub fn new(config: FusionConfig, baseline_config: BaselineConfig) -> Self {
        Self {
            config,
            baseline_config,
        }
    }

    /// Score one input on the 0-100 wellness scale
    pub fn input_score(
        &self,
        sub_score: SubScoreKind,
        sample: &SignalSample,
        baseline: &DriverBaseline,
    ) -> Option<f64> {
        match (sample.kind, sample.value) {
            (SignalKind::Yawn, SignalValue::Flag(yawning)) => Some(if yawning { 0.0 } else { 100.0 }),
            (SignalKind::Gaze, SignalValue::Gaze(gaze)) => Some(gaze_score(gaze)),
            (SignalKind::Emotion, SignalValue::Emotion(emotion)) => Some(emotion_score(emotion)),
            (SignalKind::HeadPose, SignalValue::HeadPose(pose)) => Some(match sub_score {
                SubScoreKind::Attention => head_pose_attention_score(pose),
                _ => head_pose_fatigue_score(pose),
            }),
            (kind, SignalValue::Scalar(value)) => {
                let channel = FeatureChannel::from_kind(kind)?;
                let z = baseline.z_score(channel, value, &self.baseline_config);
                Some(self.deviation_score(channel.impairment(z)))
            }
            _ => None,
        }
    }

    /// Map an impairing-direction z-score to 0-100: z <= 0 is 100, z at
    /// the clip is 0.
    fn deviation_score(&self, impairing_z: f64) -> f64 {
        let clip = self.config.z_clip.max(f64::EPSILON);
        100.0 * (1.0 - impairing_z.clamp(0.0, clip) / clip)
    }

    /// Weighted mean of the fresh inputs, renormalized over what is present
    fn raw_sub_score(
        &self,
        kind: SubScoreKind,
        snapshot: &SignalSnapshot,
        baseline: &DriverBaseline,
    ) -> Option<f64> {
        let mut weighted = 0.0;
        let mut total = 0.0;
        for (signal, weight) in inputs_for(kind) {
            if let Some(score) = snapshot
                .fresh(*signal)
                .and_then(|sample| self.input_score(kind, sample, baseline))
            {
                weighted += weight * score;
                total += weight;
            }
        }
        (total > 0.0).then(|| weighted / total)
    }

    /// EMA weight for an update `dt_ms` after the previous one
    fn smoothing_alpha(&self, dt_ms: i64) -> f64 {
        if dt_ms <= 0 {
            return 0.0;
        }
        let half_life = self.config.half_life_ms.max(1) as f64;
        1.0 - 0.5_f64.powf(dt_ms as f64 / half_life)
    }

    /// Fuse a snapshot into the next wellness state
    pub fn fuse(
        &self,
        snapshot: &SignalSnapshot,
        prior: &WellnessState,
        baseline: &DriverBaseline,
        now: DateTime<Utc>,
    ) -> FusionOutput {
        let dt_ms = prior
            .updated_at
            .map(|at| (now - at).num_milliseconds())
            .unwrap_or(0);
        let alpha = self.smoothing_alpha(dt_ms);

        let window_start = now - crate::config::ms(self.config.trend_window_ms);
        let mut history = prior.history.clone();
        while history.front().is_some_and(|p| p.at < window_start) {
            history.pop_front();
        }

        let mut state = WellnessState {
            stale: snapshot.stale_kinds(),
            updated_at: Some(now),
            ..WellnessState::default()
        };

        let mut smoothed = [None; 3];
        for kind in SubScoreKind::ALL {
            let raw = self.raw_sub_score(kind, snapshot, baseline);
            let value = match (raw, prior.sub_score(kind)) {
                (Some(raw), Some(previous)) => Some(previous.value + alpha * (raw - previous.value)),
                (Some(raw), None) => Some(raw),
                // No fresh inputs: the sub-score drops out instead of holding a stale value
                (None, _) => None,
            };
            let value = value.map(|v| v.clamp(0.0, 100.0));
            let idx = sub_score_index(kind);
            smoothed[idx] = value;

            let score = value.map(|v| {
                let oldest = history.iter().find_map(|p| p.sub_scores[idx]);
                SubScore {
                    value: v,
                    trend: oldest.map(|o| v - o).unwrap_or(0.0),
                }
            });
            state.set_sub_score(kind, score);
        }

        let fatigue_fresh = FATIGUE_INPUTS.iter().any(|(k, _)| snapshot.fresh(*k).is_some());
        let attention_fresh = ATTENTION_INPUTS.iter().any(|(k, _)| snapshot.fresh(*k).is_some());

        if fatigue_fresh && attention_fresh {
            let weights = &self.config.composite_weights;
            let mut weighted = 0.0;
            let mut total = 0.0;
            for (kind, weight) in [
                (SubScoreKind::Fatigue, weights.fatigue),
                (SubScoreKind::Stress, weights.stress),
                (SubScoreKind::Attention, weights.attention),
            ] {
                if let Some(value) = smoothed[sub_score_index(kind)] {
                    weighted += weight * value;
                    total += weight;
                }
            }
            if total > 0.0 {
                let composite = (weighted / total).clamp(0.0, 100.0);
                state.composite = Some(composite);
                state.composite_trend = Some(
                    history
                        .iter()
                        .find_map(|p| p.composite)
                        .map(|oldest| composite - oldest)
                        .unwrap_or(0.0),
                );
                state.status = FusionStatus::Ok;
            }
        }

        if state.status == FusionStatus::Degraded && prior.status == FusionStatus::Ok {
            tracing::warn!(
                fatigue_fresh,
                attention_fresh,
                stale = ?state.stale,
                "Fusion degraded: too few fresh signals"
            );
        }

        history.push_back(TrendPoint {
            at: now,
            sub_scores: smoothed,
            composite: state.composite,
        });
        state.history = history;

        let observation = state
            .composite
            .filter(|c| *c >= self.config.normal_band_floor)
            .map(|_| self.observation(snapshot, &state))
            .filter(|o| !o.is_empty());

        FusionOutput { state, observation }
    }

    fn observation(&self, snapshot: &SignalSnapshot, state: &WellnessState) -> BaselineObservation {
        let features = FeatureChannel::ALL
            .iter()
            .filter_map(|channel| {
                let kind = match channel {
                    FeatureChannel::EyeClosure => SignalKind::EyeClosure,
                    FeatureChannel::BlinkRate => SignalKind::BlinkRate,
                    FeatureChannel::HeartRate => SignalKind::HeartRate,
                    FeatureChannel::SteeringStability => SignalKind::SteeringStability,
                    FeatureChannel::SpeedConsistency => SignalKind::SpeedConsistency,
                    FeatureChannel::LaneDeviation => SignalKind::LaneDeviation,
                };
                snapshot
                    .fresh(kind)
                    .and_then(|s| s.as_scalar())
                    .map(|v| (*channel, v))
            })
            .collect();
        let sub_scores = SubScoreKind::ALL
            .iter()
            .filter_map(|k| state.sub_score(*k).map(|s| (*k, s.value)))
            .collect();
        BaselineObservation {
            features,
            sub_scores,
        }
    }
}
