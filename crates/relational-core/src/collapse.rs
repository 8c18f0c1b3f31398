//! Turn-level risk scoring and the collapse criterion.
//!
//! Coordination cost (CoC) is the mean aggregate risk over a rolling window plus a
//! crisis load term taken from the event's predicted per-party collapse. Value of
//! connection (VOC) integrates pre-crisis homeostasis and is frozen when the crisis
//! lands. From the crisis turn on, `CoC > VOC` declares collapse, and collapse is
//! terminal.
//!
//! Each assessment also names the dominant signal, projects how many turns remain
//! at the recent rate of climb, and suggests an intervention at HIGH or CRITICAL.

use contracts::{
    BeliefSnapshot, CollapseSignal, CrisisEvent, EngineConfig, Intervention, RiskLevel,
    RiskThresholds, SignalBreakdown, SignalWeights,
};
use tracing::debug;

use crate::linguistics::{defensive_frequency, latency_proxy, withdrawal_trend};
use crate::tom::BeliefState;

const DEFENSIVE_SPAN: usize = 3;
const RESILIENCE_SPAN: usize = 5;
const HOMEOSTASIS_WEIGHT: f64 = 0.7;
const CONVERGENCE_WEIGHT: f64 = 0.3;
const CONVERGENCE_GAIN_WEIGHT: f64 = 0.3;
const VELOCITY_SPAN: usize = 5;
const VELOCITY_MIN_ASSESSMENTS: usize = 3;
const VELOCITY_FLOOR: f64 = 0.01;
const GROWTH_MIN_ASSESSMENTS: usize = 5;
const GROWTH_PEAK_FLOOR: f64 = 0.5;
const GROWTH_RECOVERY_RATIO: f64 = 0.6;
const GROWTH_PEAK_LAG: usize = 2;

#[derive(Debug, Clone)]
pub struct BeliefCollapseDetector {
    weights: SignalWeights,
    thresholds: RiskThresholds,
    window: usize,
    voc_scale: f64,
    crisis_load_weight: f64,
    crisis_turn: u32,
    crisis_load: f64,
    history: Vec<BeliefSnapshot>,
    convergence_at_crisis: Option<f64>,
    frozen_voc: Option<f64>,
    collapsed_at: Option<u32>,
}

impl BeliefCollapseDetector {
    pub fn new(config: &EngineConfig, crisis: &CrisisEvent) -> Self {
        Self {
            weights: config.signal_weights,
            thresholds: config.risk_thresholds,
            window: config.collapse_window.max(1),
            voc_scale: config.voc_scale,
            crisis_load_weight: config.crisis_load_weight,
            crisis_turn: crisis.turn,
            crisis_load: crisis.predicted_collapse.mean().clamp(0.0, 1.0),
            history: Vec::new(),
            convergence_at_crisis: None,
            frozen_voc: None,
            collapsed_at: None,
        }
    }

    /// The five collapse signals, read from both agents' belief states.
    pub fn signals(a: &BeliefState, b: &BeliefState) -> SignalBreakdown {
        let mut divergences = vec![a.l2.distance(&b.l1), b.l2.distance(&a.l1)];
        if let (Some(a3), Some(b3)) = (a.l3.as_ref(), b.l3.as_ref()) {
            divergences.push(a3.distance(&b.l2));
            divergences.push(b3.distance(&a.l2));
        }
        let cross = mean(&divergences);
        let meta = (a.meta_discrepancy + b.meta_discrepancy) / 2.0;

        let observed_a = a.observed_window();
        let observed_b = b.observed_window();

        SignalBreakdown {
            epistemic_divergence: (cross + meta).clamp(0.0, 1.0),
            linguistic_withdrawal: mean(&[withdrawal_trend(&observed_a), withdrawal_trend(&observed_b)]),
            defensive_attribution: mean(&[
                defensive_frequency(&observed_a, DEFENSIVE_SPAN),
                defensive_frequency(&observed_b, DEFENSIVE_SPAN),
            ]),
            narrative_incoherence: ((a.intent_gap + b.intent_gap) / 2.0).clamp(0.0, 1.0),
            response_latency_proxy: mean(&[latency_proxy(&observed_a), latency_proxy(&observed_b)]),
        }
    }

    /// Score `turn` and evaluate the collapse criterion.
    pub fn assess(
        &mut self,
        a: &BeliefState,
        b: &BeliefState,
        convergence: f64,
        turn: u32,
    ) -> BeliefSnapshot {
        let signal_breakdown = Self::signals(a, b);
        let risk = signal_breakdown.weighted(&self.weights);
        let convergence = convergence.clamp(0.0, 1.0);

        let post_crisis = turn >= self.crisis_turn;
        if post_crisis && self.frozen_voc.is_none() {
            let at_crisis = self
                .history
                .iter()
                .rev()
                .find(|snapshot| snapshot.turn < self.crisis_turn)
                .map_or(convergence, |snapshot| snapshot.convergence);
            self.convergence_at_crisis = Some(at_crisis);
            self.frozen_voc = Some(self.value_of_connection(at_crisis));
        }

        let coordination_cost = self.coordination_cost(risk, post_crisis);
        let value_of_connection = self
            .frozen_voc
            .unwrap_or_else(|| self.value_of_connection(convergence));

        if post_crisis && self.collapsed_at.is_none() && coordination_cost > value_of_connection {
            debug!(
                turn,
                coordination_cost, value_of_connection, "detector.threshold_crossed"
            );
            self.collapsed_at = Some(turn);
        }

        let risk_level = RiskLevel::classify(risk, &self.thresholds);
        let primary_driver = signal_breakdown.primary_driver();
        let intervention_recommended = risk_level >= RiskLevel::High;
        let risks = self
            .history
            .iter()
            .map(|snapshot| snapshot.risk)
            .chain(std::iter::once(risk))
            .collect::<Vec<_>>();

        let snapshot = BeliefSnapshot {
            turn,
            risk,
            risk_level,
            signal_breakdown,
            convergence,
            coordination_cost,
            value_of_connection,
            primary_driver,
            turns_until_likely_collapse: turns_until_likely_collapse(&risks),
            intervention_recommended,
            intervention: intervention_recommended
                .then(|| suggest_intervention(primary_driver, risk_level)),
            post_traumatic_growth: post_traumatic_growth(&risks),
        };
        self.history.push(snapshot.clone());
        snapshot
    }

    fn coordination_cost(&self, current_risk: f64, post_crisis: bool) -> f64 {
        let recent = self
            .history
            .iter()
            .rev()
            .take(self.window - 1)
            .map(|snapshot| snapshot.risk)
            .chain(std::iter::once(current_risk))
            .collect::<Vec<_>>();
        let load = if post_crisis {
            self.crisis_load_weight * self.crisis_load
        } else {
            0.0
        };
        mean(&recent) + load
    }

    /// Mean `1 - risk` over pre-crisis turns, blended with convergence at the crisis.
    fn value_of_connection(&self, convergence: f64) -> f64 {
        let pre_crisis = self
            .history
            .iter()
            .filter(|snapshot| snapshot.turn < self.crisis_turn)
            .map(|snapshot| 1.0 - snapshot.risk)
            .collect::<Vec<_>>();
        let homeostasis = if pre_crisis.is_empty() {
            1.0
        } else {
            mean(&pre_crisis)
        };
        self.voc_scale * (HOMEOSTASIS_WEIGHT * homeostasis + CONVERGENCE_WEIGHT * convergence)
    }

    pub fn collapsed_at(&self) -> Option<u32> {
        self.collapsed_at
    }

    pub fn convergence_at_crisis(&self) -> Option<f64> {
        self.convergence_at_crisis
    }

    pub fn snapshots(&self) -> &[BeliefSnapshot] {
        &self.history
    }

    pub fn into_snapshots(self) -> Vec<BeliefSnapshot> {
        self.history
    }
}

/// Resilience at the end of `snapshots`: `1 - mean(recent risk)` plus credit for
/// convergence gained since the crisis.
pub fn resilience(snapshots: &[BeliefSnapshot], convergence_now: f64, convergence_at_crisis: f64) -> f64 {
    if snapshots.is_empty() {
        return 1.0;
    }
    let start = snapshots.len().saturating_sub(RESILIENCE_SPAN);
    let recent = snapshots[start..]
        .iter()
        .map(|snapshot| snapshot.risk)
        .collect::<Vec<_>>();
    let gain = (convergence_now - convergence_at_crisis).max(0.0);
    (1.0 - mean(&recent) + CONVERGENCE_GAIN_WEIGHT * gain).clamp(0.0, 1.0)
}

/// Rule table over the dominant signal, falling back on the risk level.
pub fn suggest_intervention(driver: CollapseSignal, level: RiskLevel) -> Intervention {
    match (driver, level) {
        (CollapseSignal::EpistemicDivergence, RiskLevel::Critical) => Intervention::Reanchor,
        (CollapseSignal::DefensiveAttribution, _) => Intervention::Deescalate,
        (CollapseSignal::LinguisticWithdrawal, RiskLevel::High | RiskLevel::Critical) => {
            Intervention::Validate
        }
        (CollapseSignal::NarrativeIncoherence, _) => Intervention::Reframe,
        (_, RiskLevel::Critical) => Intervention::Deescalate,
        (_, RiskLevel::High) => Intervention::Validate,
        _ => Intervention::Reframe,
    }
}

/// Turns until risk reaches 1.0 at the mean per-turn climb over the last few
/// assessments, the newest being the last entry of `risks`.
pub fn turns_until_likely_collapse(risks: &[f64]) -> Option<u32> {
    if risks.len() < VELOCITY_MIN_ASSESSMENTS {
        return None;
    }
    let recent = &risks[risks.len().saturating_sub(VELOCITY_SPAN)..];
    let (first, current) = (recent[0], recent[recent.len() - 1]);
    let velocity = (current - first) / (recent.len() - 1) as f64;
    if velocity <= VELOCITY_FLOOR {
        return None;
    }

    let remaining = (1.0 - current).max(0.0);
    Some(((remaining / velocity).floor() as u32).max(1))
}

/// Risk peaked above one half before the last two assessments and the newest
/// reading has fallen below 60% of that peak.
pub fn post_traumatic_growth(risks: &[f64]) -> bool {
    if risks.len() < GROWTH_MIN_ASSESSMENTS {
        return false;
    }
    let (peak_index, peak) = risks
        .iter()
        .copied()
        .enumerate()
        .fold((0, f64::MIN), |best, (index, risk)| {
            if risk > best.1 {
                (index, risk)
            } else {
                best
            }
        });
    let current = risks[risks.len() - 1];

    peak_index < risks.len() - GROWTH_PEAK_LAG
        && peak > GROWTH_PEAK_FLOOR
        && current < peak * GROWTH_RECOVERY_RATIO
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
