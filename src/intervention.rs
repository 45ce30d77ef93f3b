//! Intervention selection
//!
//! A rate-limited policy over a fixed priority table. At most one open
//! record exists per category and two records of a category are always at
//! least one cooldown apart, across tier re-entries. Outcomes are tallied
//! in an [`EffectivenessLedger`] for later policy tuning.

use crate::config::InterventionConfig;
use crate::telemetry::StressContext;
use crate::types::{
    InterventionCategory, InterventionOutcome, InterventionRecord, RiskTier, SubScoreKind,
    TierTransition,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use uuid::Uuid;

/// Closed records kept for the status surface and audit
const MAX_CLOSED_RECORDS: usize = 256;

/// Inputs the priority table looks at
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectionContext {
    pub tier: RiskTier,
    /// Weakest sub-score, if known
    pub dominant: Option<SubScoreKind>,
    pub stress_context: StressContext,
    /// An escalation case is open; everything non-critical is withheld
    pub escalation_active: bool,
}

/// Per-category outcome tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutcomeCounts {
    pub issued: u32,
    pub acknowledged: u32,
    pub ignored: u32,
    pub suppressed: u32,
}

impl OutcomeCounts {
    /// Share of closed, driver-facing records that were acknowledged
    pub fn acknowledgement_rate(&self) -> Option<f64> {
        let answered = self.acknowledged + self.ignored;
        (answered > 0).then(|| self.acknowledged as f64 / answered as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EffectivenessLedger {
    pub categories: BTreeMap<InterventionCategory, OutcomeCounts>,
}

impl EffectivenessLedger {
    fn entry(&mut self, category: InterventionCategory) -> &mut OutcomeCounts {
        self.categories.entry(category).or_default()
    }

    pub fn counts(&self, category: InterventionCategory) -> OutcomeCounts {
        self.categories.get(&category).copied().unwrap_or_default()
    }
}

/// Categories the priority table asks for, most urgent first.
///
/// Critical is handled by escalation; while no case is open (an assessment
/// that did not confirm, or a case the driver cancelled) it gets the High
/// row so the driver is not left without prompts.
pub fn plan(context: &SelectionContext, config: &InterventionConfig) -> Vec<InterventionCategory> {
    match context.tier {
        RiskTier::Nominal => Vec::new(),
        RiskTier::Low => vec![InterventionCategory::Reminder],
        RiskTier::Medium => match context.dominant {
            Some(SubScoreKind::Fatigue) | None => vec![InterventionCategory::BreakSuggestion],
            Some(_) => vec![InterventionCategory::Engagement],
        },
        RiskTier::High | RiskTier::Critical => {
            let mut categories = vec![InterventionCategory::Engagement];
            if context.stress_context == StressContext::Traffic {
                categories.push(InterventionCategory::RouteChange);
            } else {
                categories.push(InterventionCategory::BreakSuggestion);
            }
            if config.emergency_contact_prenotify {
                categories.push(InterventionCategory::EmergencyContact);
            }
            categories
        }
    }
}

pub struct InterventionSelector {
    config: InterventionConfig,
    open: BTreeMap<InterventionCategory, InterventionRecord>,
    closed: VecDeque<InterventionRecord>,
    last_issued: HashMap<InterventionCategory, DateTime<Utc>>,
    last_evaluated: Option<DateTime<Utc>>,
    ledger: EffectivenessLedger,
}

impl InterventionSelector {
    pub fn new(config: InterventionConfig) -> Self {
        Self {
            config,
            open: BTreeMap::new(),
            closed: VecDeque::new(),
            last_issued: HashMap::new(),
            last_evaluated: None,
            ledger: EffectivenessLedger::default(),
        }
    }

    /// Run the policy for one cycle and return newly issued records.
    ///
    /// Evaluation happens on a tier transition, and every re-evaluation
    /// period while the tier stays at Medium or above.
    pub fn on_cycle(
        &mut self,
        now: DateTime<Utc>,
        context: &SelectionContext,
        transition: Option<&TierTransition>,
    ) -> Vec<InterventionRecord> {
        self.expire(now);

        if context.escalation_active {
            self.suppress_all(now);
            return Vec::new();
        }

        let periodic = context.tier >= RiskTier::Medium
            && self
                .last_evaluated
                .map(|last| now - last >= crate::config::ms(self.config.reevaluate_ms))
                .unwrap_or(true);
        if transition.is_none() && !periodic {
            return Vec::new();
        }
        self.last_evaluated = Some(now);

        let mut issued = Vec::new();
        for category in plan(context, &self.config) {
            if let Some(record) = self.try_issue(category, context.tier, now) {
                issued.push(record);
            }
        }
        issued
    }

    fn try_issue(
        &mut self,
        category: InterventionCategory,
        tier: RiskTier,
        now: DateTime<Utc>,
    ) -> Option<InterventionRecord> {
        if self.open.contains_key(&category) {
            return None;
        }
        if let Some(last) = self.last_issued.get(&category) {
            if now - *last < crate::config::ms(self.config.cooldown_ms) {
                tracing::debug!(%category, "Intervention in cooldown");
                return None;
            }
        }

        let record = InterventionRecord {
            id: Uuid::new_v4(),
            category,
            tier_at_trigger: tier,
            issued_at: now,
            acknowledged: false,
            outcome: InterventionOutcome::Pending,
            closed_at: None,
        };
        tracing::info!(
            intervention_id = %record.id,
            %category,
            tier = %tier,
            "Intervention issued"
        );
        self.last_issued.insert(category, now);
        self.ledger.entry(category).issued += 1;
        self.open.insert(category, record.clone());
        Some(record)
    }

    /// Close records the driver did not acknowledge in time
    fn expire(&mut self, now: DateTime<Utc>) {
        let timeout = crate::config::ms(self.config.acknowledge_timeout_ms);
        let expired: Vec<_> = self
            .open
            .values()
            .filter(|r| now - r.issued_at >= timeout)
            .map(|r| r.category)
            .collect();
        for category in expired {
            self.close(category, InterventionOutcome::Ignored, now);
        }
    }

    /// Driver acknowledgement; `None` acknowledges every open record
    pub fn acknowledge(&mut self, category: Option<InterventionCategory>, now: DateTime<Utc>) -> usize {
        let targets: Vec<_> = match category {
            Some(c) => self.open.contains_key(&c).then_some(c).into_iter().collect(),
            None => self.open.keys().copied().collect(),
        };
        for category in &targets {
            self.close(*category, InterventionOutcome::Acknowledged, now);
        }
        targets.len()
    }

    /// Withdraw all open records because an emergency took over
    pub fn suppress_all(&mut self, now: DateTime<Utc>) -> usize {
        let targets: Vec<_> = self.open.keys().copied().collect();
        for category in &targets {
            self.close(*category, InterventionOutcome::Suppressed, now);
        }
        if !targets.is_empty() {
            tracing::info!(count = targets.len(), "Suppressed interventions during escalation");
        }
        targets.len()
    }

    fn close(&mut self, category: InterventionCategory, outcome: InterventionOutcome, now: DateTime<Utc>) {
        let Some(mut record) = self.open.remove(&category) else {
            return;
        };
        record.outcome = outcome;
        record.acknowledged = outcome == InterventionOutcome::Acknowledged;
        record.closed_at = Some(now);

        let counts = self.ledger.entry(category);
        match outcome {
            InterventionOutcome::Acknowledged => counts.acknowledged += 1,
            InterventionOutcome::Ignored => counts.ignored += 1,
            InterventionOutcome::Suppressed => counts.suppressed += 1,
            InterventionOutcome::Pending => {}
        }
        tracing::debug!(intervention_id = %record.id, %category, ?outcome, "Intervention closed");

        if self.closed.len() >= MAX_CLOSED_RECORDS {
            self.closed.pop_front();
        }
        self.closed.push_back(record);
    }

    pub fn open_records(&self) -> impl Iterator<Item = &InterventionRecord> {
        self.open.values()
    }

    pub fn closed_records(&self) -> impl Iterator<Item = &InterventionRecord> {
        self.closed.iter()
    }

    pub fn ledger(&self) -> &EffectivenessLedger {
        &self.ledger
    }
}
