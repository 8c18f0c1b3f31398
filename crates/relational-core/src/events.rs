//! Crisis selection. One event per timeline, biased toward the pair's shared
//! vulnerability and immutable once drawn.

use std::collections::BTreeMap;

use contracts::{
    Aftershock, CrisisEvent, CrisisKind, EngineConfig, PartyPair, SeverityDistribution,
    ShadowVectorProfile, Speaker, VulnerabilityAxis,
};
use rand::Rng;

use crate::error::ProfileError;
use crate::profile::{secure_count, shared_top_axes, shared_vulnerability, validate_pair};
use crate::seed::{stream_rng, STREAM_AFTERSHOCK, STREAM_CRISIS};

const SEVERITY_JITTER: f64 = 0.08;
const AFTERSHOCK_RATIO: f64 = 0.6;
const AFTERSHOCK_DECAY: f64 = 0.8;
const AFTERSHOCK_FLOOR: f64 = 0.05;
const COLLAPSE_SCALE: f64 = 1.3;
const PARETO_CEILING: f64 = 5.0;
const BETA_GRID: usize = 512;

#[derive(Debug, Clone)]
pub struct StochasticEventGenerator {
    profile_a: ShadowVectorProfile,
    profile_b: ShadowVectorProfile,
    shared: Vec<(VulnerabilityAxis, f64)>,
    vulnerability: BTreeMap<VulnerabilityAxis, f64>,
    elasticity_threshold: f64,
    severity_range: (f64, f64),
    severity_shape: SeverityQuantile,
    aftershock_count: u8,
}

impl StochasticEventGenerator {
    pub fn new(
        profile_a: &ShadowVectorProfile,
        profile_b: &ShadowVectorProfile,
        config: &EngineConfig,
    ) -> Result<Self, ProfileError> {
        validate_pair(profile_a, profile_b)?;

        let mean_entropy = (profile_a.entropy_tolerance + profile_b.entropy_tolerance) / 2.0;
        let secure = secure_count(profile_a, profile_b) as f64;
        let elasticity_threshold = (0.4 - 0.1 * mean_entropy - 0.05 * secure).clamp(0.1, 0.4);

        Ok(Self {
            profile_a: profile_a.clone(),
            profile_b: profile_b.clone(),
            shared: shared_top_axes(profile_a, profile_b),
            vulnerability: shared_vulnerability(profile_a, profile_b),
            elasticity_threshold,
            severity_range: config.severity_range,
            severity_shape: SeverityQuantile::new(config.severity_distribution),
            aftershock_count: config.aftershock_count,
        })
    }

    /// Axes eligible for a biased draw, strongest first.
    pub fn shared_axes(&self) -> &[(VulnerabilityAxis, f64)] {
        &self.shared
    }

    /// Draw the crisis for one timeline.
    ///
    /// `percentile` in [0, 1] is the stress level the runner assigned to this
    /// trial; severity lands near that point of the configured range.
    pub fn generate(&self, seed: u64, percentile: f64, max_turns: u32) -> CrisisEvent {
        let mut rng = stream_rng(seed, STREAM_CRISIS);
        let axis = self.draw_axis(&mut rng);
        let severity = self.draw_severity(&mut rng, percentile);
        let turn = draw_injection_turn(&mut rng, max_turns);
        let crisis = self.build(axis, severity, turn);

        let mut aftershock_rng = stream_rng(seed, STREAM_AFTERSHOCK);
        let aftershocks = self.draw_aftershocks(&mut aftershock_rng, &crisis, max_turns);
        CrisisEvent {
            aftershocks,
            ..crisis
        }
    }

    /// Event for a caller-chosen axis, severity and turn.
    pub fn build(&self, axis: VulnerabilityAxis, severity: f64, turn: u32) -> CrisisEvent {
        let severity = severity.clamp(0.0, 1.0);
        let predicted = |profile: &ShadowVectorProfile| {
            (severity * (1.0 - profile.entropy_tolerance) * profile.value(axis) * COLLAPSE_SCALE)
                .clamp(0.0, 1.0)
        };
        let predicted_collapse = PartyPair {
            agent_a: predicted(&self.profile_a),
            agent_b: predicted(&self.profile_b),
        };
        let kind = CrisisKind::for_axis(axis);
        let exposed = if predicted_collapse.agent_a >= predicted_collapse.agent_b {
            Speaker::AgentA
        } else {
            Speaker::AgentB
        };
        let (narrative, decision_point) = narrate(kind, exposed);

        CrisisEvent {
            axis,
            severity,
            turn: turn.max(1),
            kind,
            vulnerability_score: self
                .vulnerability
                .get(&axis)
                .copied()
                .unwrap_or(0.0)
                .clamp(0.0, 1.0),
            elasticity_threshold: self.elasticity_threshold,
            predicted_collapse,
            narrative,
            decision_point,
            aftershocks: Vec::new(),
        }
    }

    fn draw_axis<R: Rng + ?Sized>(&self, rng: &mut R) -> VulnerabilityAxis {
        let total = self.shared.iter().map(|(_, score)| score.max(0.0)).sum::<f64>();
        if self.shared.is_empty() || total <= 0.0 {
            let index = rng.gen_range(0..VulnerabilityAxis::ALL.len());
            return VulnerabilityAxis::ALL[index];
        }

        let mut remaining = rng.gen::<f64>() * total;
        for (axis, score) in &self.shared {
            remaining -= score.max(0.0);
            if remaining < 0.0 {
                return *axis;
            }
        }
        self.shared[self.shared.len() - 1].0
    }

    /// Jitter the stratum's percentile, then map it through the distribution.
    fn draw_severity<R: Rng + ?Sized>(&self, rng: &mut R, percentile: f64) -> f64 {
        let (low, high) = self.severity_range;
        let jitter = (rng.gen::<f64>() + rng.gen::<f64>() - 1.0) * SEVERITY_JITTER;
        let u = (percentile.clamp(0.0, 1.0) + jitter).clamp(0.0, 1.0);
        (low + (high - low) * self.severity_shape.quantile(u)).clamp(low, high)
    }

    fn draw_aftershocks<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        crisis: &CrisisEvent,
        max_turns: u32,
    ) -> Vec<Aftershock> {
        let mut shocks = Vec::with_capacity(usize::from(self.aftershock_count));
        let mut turn = crisis.turn;
        let mut severity = crisis.severity * AFTERSHOCK_RATIO;
        for _ in 0..self.aftershock_count {
            turn += rng.gen_range(2..=4);
            if turn > max_turns {
                break;
            }
            shocks.push(Aftershock {
                axis: self.draw_axis(rng),
                severity: severity.max(AFTERSHOCK_FLOOR),
                turn,
            });
            severity *= AFTERSHOCK_DECAY;
        }
        shocks
    }
}

/// Uniform over the middle third of the conversation.
/// Inverse CDF on `[0, 1]` for a [`SeverityDistribution`].
#[derive(Debug, Clone)]
enum SeverityQuantile {
    Uniform,
    Pareto { alpha: f64 },
    /// Cumulative mass at `i / BETA_GRID` for `i` in `0..=BETA_GRID`.
    Tabulated(Vec<f64>),
}

impl SeverityQuantile {
    fn new(distribution: SeverityDistribution) -> Self {
        match distribution {
            SeverityDistribution::Uniform => Self::Uniform,
            SeverityDistribution::Pareto { alpha } => Self::Pareto { alpha },
            SeverityDistribution::Beta { alpha, beta } => Self::Tabulated(beta_cdf(alpha, beta)),
        }
    }

    fn quantile(&self, u: f64) -> f64 {
        let value = match self {
            Self::Uniform => u,
            Self::Pareto { alpha } => {
                let tail = 1.0 - PARETO_CEILING.powf(-alpha);
                let x = (1.0 - u * tail).powf(-1.0 / alpha);
                (x - 1.0) / (PARETO_CEILING - 1.0)
            }
            Self::Tabulated(cdf) => {
                let upper = cdf.partition_point(|mass| *mass < u).clamp(1, cdf.len() - 1);
                let (below, above) = (cdf[upper - 1], cdf[upper]);
                let within = if above > below {
                    (u - below) / (above - below)
                } else {
                    0.0
                };
                (upper as f64 - 1.0 + within) / BETA_GRID as f64
            }
        };
        if value.is_finite() {
            value.clamp(0.0, 1.0)
        } else {
            u
        }
    }
}

/// Midpoint-rule CDF of Beta(alpha, beta); cells avoid the endpoint poles.
fn beta_cdf(alpha: f64, beta: f64) -> Vec<f64> {
    let step = 1.0 / BETA_GRID as f64;
    let mut cdf = Vec::with_capacity(BETA_GRID + 1);
    cdf.push(0.0);
    let mut mass = 0.0;
    for cell in 0..BETA_GRID {
        let x = (cell as f64 + 0.5) * step;
        mass += x.powf(alpha - 1.0) * (1.0 - x).powf(beta - 1.0) * step;
        cdf.push(mass);
    }
    if mass > 0.0 && mass.is_finite() {
        for value in &mut cdf {
            *value /= mass;
        }
    }
    cdf
}

fn draw_injection_turn<R: Rng + ?Sized>(rng: &mut R, max_turns: u32) -> u32 {
    let max_turns = max_turns.max(1);
    let low = (max_turns / 3 + 1).min(max_turns);
    let high = (2 * max_turns / 3).clamp(low, max_turns);
    rng.gen_range(low..=high)
}

fn narrate(kind: CrisisKind, exposed: Speaker) -> (String, String) {
    let partner = exposed.other();
    match kind {
        CrisisKind::Betrayal => (
            format!("{exposed} finds messages showing {partner} confided in an ex about the relationship."),
            format!("Does {exposed} confront {partner} now or keep quiet to avoid a fight?"),
        ),
        CrisisKind::CareerDisruption => (
            format!("{exposed} is passed over for a promotion after months of late nights."),
            format!("Does {partner} push {exposed} to move cities for a new role?"),
        ),
        CrisisKind::FinancialCollapse => (
            format!("A failed investment wipes out the savings {exposed} and {partner} shared."),
            "Who takes on the debt, and who decides what gets cut?".to_string(),
        ),
        CrisisKind::ExternalThreat => (
            format!("{partner}'s family openly questions whether {exposed} belongs in the relationship."),
            format!("Does {partner} take a side in front of the family?"),
        ),
        CrisisKind::Loss => (
            format!("{exposed} loses a close friend and pulls away from shared plans."),
            format!("How much space does {partner} give before reaching out?"),
        ),
        CrisisKind::ValuesConflict => (
            format!("{partner} wants to quit a stable job for a risky venture; {exposed} does not."),
            "Is the venture a shared bet or one partner's gamble?".to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::sample_pair;

    fn generator() -> StochasticEventGenerator {
        let (a, b) = sample_pair();
        StochasticEventGenerator::new(&a, &b, &EngineConfig::default()).expect("valid pair")
    }

    #[test]
    fn injection_turn_lies_in_middle_third() {
        let generator = generator();
        for seed in 0..200 {
            let crisis = generator.generate(seed, 0.5, 30);
            assert!((11..=20).contains(&crisis.turn), "turn {}", crisis.turn);
        }
    }

    #[test]
    fn axis_draw_stays_within_shared_set() {
        let generator = generator();
        let shared = generator
            .shared_axes()
            .iter()
            .map(|(axis, _)| *axis)
            .collect::<Vec<_>>();
        for seed in 0..200 {
            assert!(shared.contains(&generator.generate(seed, 0.5, 20).axis));
        }
    }

    #[test]
    fn disjoint_pair_falls_back_to_uniform_draw() {
        let (mut a, mut b) = sample_pair();
        a.fears.clear();
        b.fears.clear();
        let generator =
            StochasticEventGenerator::new(&a, &b, &EngineConfig::default()).expect("valid pair");
        assert!(generator.shared_axes().is_empty());
        let distinct = (0..400)
            .map(|seed| generator.generate(seed, 0.5, 20).axis)
            .collect::<std::collections::BTreeSet<_>>();
        assert_eq!(distinct.len(), VulnerabilityAxis::ALL.len());
    }

    #[test]
    fn severity_tracks_requested_percentile() {
        let generator = generator();
        for seed in 0..100 {
            let low = generator.generate(seed, 0.0, 20).severity;
            let high = generator.generate(seed, 1.0, 20).severity;
            assert!(low <= 0.05 + SEVERITY_JITTER);
            assert!(high >= 0.95 - SEVERITY_JITTER);
        }
    }

    #[test]
    fn every_severity_shape_stays_within_range() {
        let (a, b) = sample_pair();
        for shape in [
            SeverityDistribution::Uniform,
            SeverityDistribution::Pareto { alpha: 1.5 },
            SeverityDistribution::Beta {
                alpha: 2.0,
                beta: 5.0,
            },
            SeverityDistribution::Beta {
                alpha: 0.5,
                beta: 0.5,
            },
        ] {
            let config = EngineConfig {
                severity_range: (0.2, 0.7),
                severity_distribution: shape,
                ..EngineConfig::default()
            };
            let generator = StochasticEventGenerator::new(&a, &b, &config).expect("valid pair");
            for seed in 0..100 {
                let percentile = seed as f64 / 99.0;
                let severity = generator.generate(seed, percentile, 20).severity;
                assert!((0.2..=0.7).contains(&severity), "{shape:?} gave {severity}");
            }
        }
    }

    #[test]
    fn quantiles_are_monotone_and_skewed_as_configured() {
        let shapes = [
            SeverityQuantile::new(SeverityDistribution::Pareto { alpha: 1.5 }),
            SeverityQuantile::new(SeverityDistribution::Beta {
                alpha: 2.0,
                beta: 5.0,
            }),
        ];
        for shape in &shapes {
            assert_eq!(shape.quantile(0.0), 0.0);
            assert!((shape.quantile(1.0) - 1.0).abs() < 1e-9);
            let grid = (0..=50).map(|i| shape.quantile(i as f64 / 50.0)).collect::<Vec<_>>();
            assert!(grid.windows(2).all(|pair| pair[0] <= pair[1]));
            // Both put most of their mass on minor crises.
            assert!(shape.quantile(0.5) < 0.35, "median {}", shape.quantile(0.5));
        }
        // Beta(2, 5) has its median near 0.264.
        assert!((shapes[1].quantile(0.5) - 0.264).abs() < 0.01);
    }

    #[test]
    fn same_seed_yields_same_event() {
        let generator = generator();
        assert_eq!(generator.generate(42, 0.3, 20), generator.generate(42, 0.3, 20));
    }

    #[test]
    fn aftershocks_decay_and_stay_in_conversation() {
        let (a, b) = sample_pair();
        let config = EngineConfig {
            aftershock_count: 3,
            ..EngineConfig::default()
        };
        let generator = StochasticEventGenerator::new(&a, &b, &config).expect("valid pair");
        for seed in 0..50 {
            let crisis = generator.generate(seed, 0.8, 40);
            let mut previous = (crisis.turn, crisis.severity);
            for shock in &crisis.aftershocks {
                assert!(shock.turn > previous.0 && shock.turn <= 40);
                assert!(shock.severity < previous.1);
                previous = (shock.turn, shock.severity);
            }
        }
    }

    #[test]
    fn elasticity_threshold_and_predicted_collapse_are_bounded() {
        let crisis = generator().build(VulnerabilityAxis::Intimacy, 1.0, 5);
        assert!((0.1..=0.4).contains(&crisis.elasticity_threshold));
        assert!(crisis.predicted_collapse.agent_a > crisis.predicted_collapse.agent_b);
        assert_eq!(crisis.kind, CrisisKind::Betrayal);
        assert!(crisis.narrative.contains("agent_a"));
    }

    #[test]
    fn incomplete_profile_is_rejected() {
        let (mut a, b) = sample_pair();
        a.values.clear();
        assert!(StochasticEventGenerator::new(&a, &b, &EngineConfig::default()).is_err());
    }

    #[test]
    fn tiny_conversations_still_place_the_crisis() {
        let generator = generator();
        assert_eq!(generator.generate(1, 0.5, 1).turn, 1);
        assert!((2..=2).contains(&generator.generate(1, 0.5, 3).turn));
    }
}
