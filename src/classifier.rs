//! Risk classification with hysteresis
//!
//! Upgrades are applied on the cycle they are observed. A downgrade waits
//! until every reading for the dwell time has been in a less severe band,
//! then lands on the most severe band seen during that stretch.

use crate::config::ClassifierConfig;
use crate::types::{RiskTier, SignalSample, TierTransition, TransitionCause};
use chrono::{DateTime, Utc};

/// Composite score and trend for one cycle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreReading {
    pub score: f64,
    pub trend: Option<f64>,
}

#[derive(Debug, Clone, Copy)]
struct PendingDowngrade {
    target: RiskTier,
    since: DateTime<Utc>,
}

pub struct RiskClassifier {
    config: ClassifierConfig,
    tier: RiskTier,
    entered_at: Option<DateTime<Utc>>,
    pending: Option<PendingDowngrade>,
}

impl RiskClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self {
            config,
            tier: RiskTier::Nominal,
            entered_at: None,
            pending: None,
        }
    }

    pub fn tier(&self) -> RiskTier {
        self.tier
    }

    pub fn entered_at(&self) -> Option<DateTime<Utc>> {
        self.entered_at
    }

    /// Tier implied by a reading, before hysteresis
    pub fn target_for(&self, reading: ScoreReading) -> (RiskTier, TransitionCause) {
        let band = self.config.breakpoints.band(reading.score);
        match reading.trend {
            Some(trend) if trend <= self.config.rapid_decline_points && band < RiskTier::High => (
                band.escalated(),
                TransitionCause::RapidDecline {
                    score: reading.score,
                    trend,
                },
            ),
            trend => (
                band,
                TransitionCause::ScoreBand {
                    score: reading.score,
                    trend,
                },
            ),
        }
    }

    /// Advance one cycle. Returns a transition only when the tier changes.
    ///
    /// `events` are critical-event samples that arrived this cycle; any one
    /// of them forces Critical regardless of the score. A missing reading
    /// (degraded fusion) holds the current tier.
    pub fn update(
        &mut self,
        now: DateTime<Utc>,
        reading: Option<ScoreReading>,
        events: &[SignalSample],
        trigger: Option<&SignalSample>,
    ) -> Option<TierTransition> {
        if let Some((event_sample, event)) = events
            .iter()
            .find_map(|s| s.as_critical().map(|e| (s, e)))
        {
            self.pending = None;
            return self.transition(
                now,
                RiskTier::Critical,
                TransitionCause::CriticalEvent { event: event.event },
                Some(event_sample),
            );
        }

        let Some(reading) = reading else {
            self.pending = None;
            return None;
        };

        let (target, cause) = self.target_for(reading);
        if target > self.tier {
            self.pending = None;
            return self.transition(now, target, cause, trigger);
        }
        if target == self.tier {
            if self.pending.take().is_some() {
                tracing::debug!(tier = %self.tier, "Downgrade cancelled, score back in band");
            }
            return None;
        }

        let pending = match self.pending {
            Some(p) => PendingDowngrade {
                target: p.target.max(target),
                since: p.since,
            },
            None => PendingDowngrade { target, since: now },
        };
        self.pending = Some(pending);

        if now - pending.since >= crate::config::ms(self.config.dwell_ms) {
            self.pending = None;
            let cause = TransitionCause::ScoreBand {
                score: reading.score,
                trend: reading.trend,
            };
            return self.transition(now, pending.target, cause, trigger);
        }
        None
    }

    fn transition(
        &mut self,
        now: DateTime<Utc>,
        to: RiskTier,
        cause: TransitionCause,
        trigger: Option<&SignalSample>,
    ) -> Option<TierTransition> {
        if to == self.tier {
            return None;
        }
        let transition = TierTransition {
            from: self.tier,
            to,
            at: now,
            cause,
            trigger: trigger.cloned(),
        };
        tracing::info!(
            from = %transition.from,
            to = %transition.to,
            cause = ?transition.cause,
            "Risk tier changed"
        );
        self.tier = to;
        self.entered_at = Some(now);
        Some(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CriticalEventKind;
    use chrono::{Duration, TimeZone};
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
    }

    fn at(cycle: i64) -> DateTime<Utc> {
        t0() + Duration::milliseconds(cycle * 100)
    }

    fn reading(score: f64) -> Option<ScoreReading> {
        Some(ScoreReading { score, trend: None })
    }

    #[test]
    fn test_steady_nominal_no_transitions() {
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        for cycle in 0..300 {
            let out = classifier.update(at(cycle), reading(90.0), &[], None);
            assert_eq!(out, None);
        }
        assert_eq!(classifier.tier(), RiskTier::Nominal);
    }

    #[test]
    fn test_upgrade_is_immediate() {
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        classifier.update(at(0), reading(90.0), &[], None);
        let transition = classifier.update(at(1), reading(40.0), &[], None).unwrap();
        assert_eq!(transition.from, RiskTier::Nominal);
        assert_eq!(transition.to, RiskTier::High);
        assert!(transition.is_upgrade());
    }

    #[test]
    fn test_downgrade_waits_for_dwell() {
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        classifier.update(at(0), reading(60.0), &[], None);
        assert_eq!(classifier.tier(), RiskTier::Medium);

        // 2.9 s in the Low band is not enough
        for cycle in 1..=29 {
            assert_eq!(classifier.update(at(cycle), reading(75.0), &[], None), None);
        }
        // Reaches 3 s at cycle 31 since the first Low reading at cycle 1
        assert_eq!(classifier.update(at(30), reading(75.0), &[], None), None);
        let transition = classifier.update(at(31), reading(75.0), &[], None).unwrap();
        assert_eq!(transition.to, RiskTier::Low);
    }

    #[test]
    fn test_flapping_near_boundary_holds_tier() {
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        classifier.update(at(0), reading(65.0), &[], None);
        for cycle in 1..200 {
            let score = if cycle % 10 < 5 { 71.0 } else { 69.0 };
            assert_eq!(classifier.update(at(cycle), reading(score), &[], None), None);
        }
        assert_eq!(classifier.tier(), RiskTier::Medium);
    }

    #[test]
    fn test_rapid_decline_reads_worse_capped_at_high() {
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        let falling = Some(ScoreReading { score: 60.0, trend: Some(-20.0) });
        let transition = classifier.update(at(0), falling, &[], None).unwrap();
        assert_eq!(transition.to, RiskTier::High);
        assert!(matches!(transition.cause, TransitionCause::RapidDecline { .. }));

        let falling = Some(ScoreReading { score: 35.0, trend: Some(-40.0) });
        assert_eq!(classifier.update(at(1), falling, &[], None), None);
        assert_eq!(classifier.tier(), RiskTier::High);
    }

    #[test]
    fn test_critical_event_short_circuits() {
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        classifier.update(at(0), reading(95.0), &[], None);
        let event = SignalSample::critical(CriticalEventKind::Collision, at(1), "imu");
        let transition = classifier
            .update(at(1), reading(95.0), std::slice::from_ref(&event), None)
            .unwrap();
        assert_eq!(transition.to, RiskTier::Critical);
        assert_eq!(transition.trigger, Some(event));
        assert_eq!(
            transition.cause,
            TransitionCause::CriticalEvent { event: CriticalEventKind::Collision }
        );
    }

    #[test]
    fn test_degraded_holds_tier() {
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        classifier.update(at(0), reading(40.0), &[], None);
        for cycle in 1..100 {
            assert_eq!(classifier.update(at(cycle), None, &[], None), None);
        }
        assert_eq!(classifier.tier(), RiskTier::High);
    }

    #[test]
    fn test_descent_never_returns_to_low() {
        // 90 -> 45 over 5 s, then held
        let mut classifier = RiskClassifier::new(ClassifierConfig::default());
        let mut tiers = Vec::new();
        for cycle in 0..=100 {
            let score = if cycle <= 50 { 90.0 - 0.9 * cycle as f64 } else { 45.0 };
            if let Some(t) = classifier.update(at(cycle), reading(score), &[], None) {
                tiers.push(t.to);
            }
        }
        assert_eq!(tiers, vec![RiskTier::Low, RiskTier::Medium, RiskTier::High]);
    }

    proptest! {
        #[test]
        fn prop_hysteresis(scores in proptest::collection::vec(0.0f64..100.0, 1..200)) {
            let config = ClassifierConfig::default();
            let dwell = crate::config::ms(config.dwell_ms);
            let breakpoints = config.breakpoints.clone();
            let mut classifier = RiskClassifier::new(config);

            for (cycle, score) in scores.iter().enumerate() {
                let now = at(cycle as i64);
                let before = classifier.tier();
                let band = breakpoints.band(*score);
                let transition = classifier.update(now, reading(*score), &[], None);

                if band > before {
                    // Upgrade within the same cycle
                    prop_assert_eq!(classifier.tier(), band);
                }
                if let Some(t) = transition.filter(|t| !t.is_upgrade()) {
                    // Every reading in the dwell window was at or below the new tier
                    for (c, s) in scores.iter().enumerate().take(cycle + 1) {
                        if at(c as i64) >= now - dwell {
                            prop_assert!(breakpoints.band(*s) <= t.to);
                        }
                    }
                }
            }
        }
    }
}
