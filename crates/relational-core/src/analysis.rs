//! Post-hoc analysis of a finished batch: severity bands, survival curve,
//! bootstrap intervals and the axes most prone to collapse.

use std::collections::BTreeMap;

use contracts::{
    BatchAnalysis, ConfidenceInterval, EngineConfig, Recommendation, RiskScenario, SeverityBand,
    SimulationResult, SurvivalPoint, Timeline, VulnerabilityAxis, SCHEMA_VERSION_V1,
};
use rand::Rng;
use rayon::prelude::*;
use tracing::debug;

use crate::seed::{mix_seed, stream_rng, STREAM_BOOTSTRAP};

const CONFIDENCE_LEVEL: f64 = 0.95;
const SURVIVAL_DIVISIONS: usize = 20;
const SURVIVAL_POINTS: usize = SURVIVAL_DIVISIONS - 1;
const TOP_SCENARIOS: usize = 3;

pub struct BatchAnalyzer {
    resamples: usize,
    pool: Option<rayon::ThreadPool>,
}

impl BatchAnalyzer {
    pub fn new(config: &EngineConfig) -> Self {
        let threads = usize::from(config.analysis_threads.max(1));
        let pool = if threads > 1 {
            rayon::ThreadPoolBuilder::new().num_threads(threads).build().ok()
        } else {
            None
        };
        Self {
            resamples: config.bootstrap_resamples,
            pool,
        }
    }

    pub fn analyze(&self, result: &SimulationResult) -> BatchAnalysis {
        let timelines = &result.timelines;
        let homeostasis = timelines
            .iter()
            .map(|timeline| if timeline.reached_homeostasis { 1.0 } else { 0.0 })
            .collect::<Vec<_>>();
        let elasticity = timelines
            .iter()
            .map(|timeline| timeline.narrative_elasticity)
            .collect::<Vec<_>>();
        let resilience = timelines
            .iter()
            .map(|timeline| timeline.final_resilience_score)
            .collect::<Vec<_>>();

        let [homeostasis_ci, elasticity_ci, resilience_ci] =
            self.bootstrap(
            result.base_seed,
            [homeostasis.as_slice(), elasticity.as_slice(), resilience.as_slice()],
        );
        debug!(
            batch_id = %result.batch_id,
            resamples = self.resamples,
            lower = homeostasis_ci.lower,
            upper = homeostasis_ci.upper,
            "analysis.bootstrap_finished"
        );

        BatchAnalysis {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            batch_id: result.batch_id.clone(),
            severity_quartiles: severity_quartiles(timelines),
            survival_curve: survival_curve(timelines),
            homeostasis_ci,
            elasticity_ci,
            resilience_ci,
            top_risk_scenarios: top_risk_scenarios(timelines),
            recommendation: recommend(result.homeostasis_rate),
        }
    }

    /// Percentile intervals for the mean of each series, resampled jointly.
    fn bootstrap<const K: usize>(
        &self,
        base_seed: u64,
        series: [&[f64]; K],
    ) -> [ConfidenceInterval; K] {
        let n = series.first().map_or(0, |values| values.len());
        if n == 0 || self.resamples == 0 {
            return series.map(|values| point_interval(mean(values)));
        }

        let resample = |round: usize| {
            let mut rng = stream_rng(mix_seed(base_seed, round as u64), STREAM_BOOTSTRAP);
            let mut sums = [0.0; K];
            for _ in 0..n {
                let pick = rng.gen_range(0..n);
                for (sum, values) in sums.iter_mut().zip(series) {
                    *sum += values[pick];
                }
            }
            sums.map(|sum| sum / n as f64)
        };

        let means = if let Some(pool) = &self.pool {
            pool.install(|| {
                (0..self.resamples)
                    .into_par_iter()
                    .map(resample)
                    .collect::<Vec<_>>()
            })
        } else {
            (0..self.resamples).map(resample).collect::<Vec<_>>()
        };

        std::array::from_fn(|k| {
            let mut column = means.iter().map(|round| round[k]).collect::<Vec<_>>();
            percentile_interval(&mut column)
        })
    }
}

fn point_interval(value: f64) -> ConfidenceInterval {
    ConfidenceInterval {
        lower: value,
        upper: value,
        level: CONFIDENCE_LEVEL,
    }
}

fn percentile_interval(values: &mut [f64]) -> ConfidenceInterval {
    values.sort_by(f64::total_cmp);
    let last = (values.len() - 1) as f64;
    let tail = (1.0 - CONFIDENCE_LEVEL) / 2.0;
    let lower = values[(tail * last).floor() as usize];
    let upper = values[((1.0 - tail) * last).ceil() as usize];
    ConfidenceInterval {
        lower,
        upper,
        level: CONFIDENCE_LEVEL,
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

fn homeostasis_rate(timelines: &[&Timeline]) -> f64 {
    if timelines.is_empty() {
        return 1.0;
    }
    timelines
        .iter()
        .filter(|timeline| timeline.reached_homeostasis)
        .count() as f64
        / timelines.len() as f64
}

pub fn severity_quartiles(timelines: &[Timeline]) -> Vec<SeverityBand> {
    let mut ordered = timelines.iter().collect::<Vec<_>>();
    ordered.sort_by(|left, right| {
        left.crisis_severity
            .total_cmp(&right.crisis_severity)
            .then(left.index.cmp(&right.index))
    });
    let len = ordered.len();

    (0..4)
        .map(|quartile| {
            let band = &ordered[quartile * len / 4..(quartile + 1) * len / 4];
            SeverityBand {
                label: format!("Q{}", quartile + 1),
                min_severity: band.first().map_or(0.0, |timeline| timeline.crisis_severity),
                max_severity: band.last().map_or(0.0, |timeline| timeline.crisis_severity),
                count: band.len(),
                homeostasis_rate: homeostasis_rate(band),
            }
        })
        .collect()
}

/// Homeostasis rate among timelines at or above each severity threshold.
pub fn survival_curve(timelines: &[Timeline]) -> Vec<SurvivalPoint> {
    (1..=SURVIVAL_POINTS)
        .map(|step| {
            let threshold = step as f64 / SURVIVAL_DIVISIONS as f64;
            let exposed = timelines
                .iter()
                .filter(|timeline| timeline.crisis_severity >= threshold)
                .collect::<Vec<_>>();
            SurvivalPoint {
                threshold,
                homeostasis_rate: homeostasis_rate(&exposed),
                count: exposed.len(),
            }
        })
        .collect()
}

/// Crisis axes ranked by how often a crisis on them ends without homeostasis.
pub fn top_risk_scenarios(timelines: &[Timeline]) -> Vec<RiskScenario> {
    let mut exposure = BTreeMap::<VulnerabilityAxis, usize>::new();
    let mut collapses = BTreeMap::<VulnerabilityAxis, Vec<f64>>::new();
    for timeline in timelines {
        *exposure.entry(timeline.crisis_axis).or_default() += 1;
        if !timeline.reached_homeostasis {
            collapses
                .entry(timeline.crisis_axis)
                .or_default()
                .push(timeline.crisis_severity);
        }
    }

    let mut scenarios = collapses
        .into_iter()
        .map(|(axis, severities)| RiskScenario {
            axis,
            n_collapses: severities.len(),
            mean_severity: mean(&severities),
            collapse_rate: severities.len() as f64
                / exposure.get(&axis).copied().unwrap_or(0).max(1) as f64,
        })
        .collect::<Vec<_>>();
    // Stable sort keeps axis order among equal rates.
    scenarios.sort_by(|left, right| right.collapse_rate.total_cmp(&left.collapse_rate));
    scenarios.truncate(TOP_SCENARIOS);
    scenarios
}

pub fn recommend(homeostasis_rate: f64) -> Recommendation {
    if homeostasis_rate >= 0.80 {
        Recommendation::Thriving
    } else if homeostasis_rate >= 0.60 {
        Recommendation::Resilient
    } else if homeostasis_rate >= 0.40 {
        Recommendation::Fragile
    } else {
        Recommendation::AtRisk
    }
}

#[cfg(test)]
mod tests {
    use contracts::{BatchStatus, CrisisEvent, CrisisKind, PartyPair};

    use super::*;

    fn timeline(index: usize, severity: f64, homeostasis: bool) -> Timeline {
        Timeline {
            timeline_id: format!("timeline-{index:04}"),
            index,
            seed: index as u64,
            crisis: CrisisEvent {
                axis: VulnerabilityAxis::Security,
                severity,
                turn: 4,
                kind: CrisisKind::FinancialCollapse,
                vulnerability_score: 0.4,
                elasticity_threshold: 0.3,
                predicted_collapse: PartyPair::default(),
                narrative: String::new(),
                decision_point: String::new(),
                aftershocks: Vec::new(),
            },
            crisis_severity: severity,
            crisis_axis: VulnerabilityAxis::Security,
            reached_homeostasis: homeostasis,
            collapsed_at_turn: (!homeostasis).then_some(6),
            antifragile: false,
            narrative_elasticity: if homeostasis { 0.8 } else { 0.2 },
            baseline_resilience: 0.6,
            final_resilience_score: 0.6,
            turns_total: 10,
            belief_collapse_events: 0,
            linguistic_convergence_final: 0.5,
            post_traumatic_growth: false,
            interventions_recommended: 0,
            full_transcript: Vec::new(),
            belief_state_snapshots: Vec::new(),
        }
    }

    fn result(timelines: Vec<Timeline>) -> SimulationResult {
        let rate = timelines.iter().filter(|t| t.reached_homeostasis).count() as f64
            / timelines.len().max(1) as f64;
        SimulationResult {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            batch_id: "batch-test".to_string(),
            base_seed: 5,
            status: BatchStatus::Completed,
            cancelled: false,
            n_requested: timelines.len(),
            n_simulations: timelines.len(),
            homeostasis_rate: rate,
            antifragility_rate: 0.0,
            median_elasticity: 0.5,
            collapse_attribution: BTreeMap::new(),
            primary_collapse_vector: None,
            p20_homeostasis: 1.0,
            p80_homeostasis: 1.0,
            exclusions: Vec::new(),
            timelines,
        }
    }

    fn batch() -> SimulationResult {
        result(
            (0..20)
                .map(|i| timeline(i, 0.05 + i as f64 * 0.045, i < 12))
                .collect(),
        )
    }

    #[test]
    fn quartiles_partition_every_timeline() {
        let bands = severity_quartiles(&batch().timelines);
        assert_eq!(bands.len(), 4);
        assert_eq!(bands.iter().map(|band| band.count).sum::<usize>(), 20);
        assert_eq!(bands[0].homeostasis_rate, 1.0);
        assert_eq!(bands[3].homeostasis_rate, 0.0);
        assert!(bands[0].max_severity <= bands[1].min_severity);
    }

    #[test]
    fn survival_curve_is_defined_at_every_threshold() {
        let curve = survival_curve(&batch().timelines);
        assert_eq!(curve.len(), SURVIVAL_POINTS);
        assert!(curve.iter().all(|point| point.homeostasis_rate.is_finite()));
        assert!(curve[0].count >= curve[SURVIVAL_POINTS - 1].count);
    }

    #[test]
    fn survival_thresholds_are_exact_twentieths() {
        let curve = survival_curve(&batch().timelines);
        for (i, point) in curve.iter().enumerate() {
            assert_eq!(point.threshold, (i + 1) as f64 / 20.0);
        }
        // 0.15 is not representable as 3 * 0.05; a crisis of exactly 0.15 must count.
        let exact = vec![timeline(0, 0.15, true)];
        assert_eq!(survival_curve(&exact)[2].count, 1);
    }

    #[test]
    fn risk_scenarios_rank_axes_by_collapse_rate() {
        let on_axis = |index: usize, axis: VulnerabilityAxis, severity: f64, homeostasis: bool| {
            let mut timeline = timeline(index, severity, homeostasis);
            timeline.crisis_axis = axis;
            timeline
        };
        let timelines = vec![
            // Security: 2 of 4 collapse.
            on_axis(0, VulnerabilityAxis::Security, 0.2, true),
            on_axis(1, VulnerabilityAxis::Security, 0.3, true),
            on_axis(2, VulnerabilityAxis::Security, 0.6, false),
            on_axis(3, VulnerabilityAxis::Security, 0.8, false),
            // Power: 1 of 1.
            on_axis(4, VulnerabilityAxis::Power, 0.5, false),
            // Intimacy: 1 of 3.
            on_axis(5, VulnerabilityAxis::Intimacy, 0.9, false),
            on_axis(6, VulnerabilityAxis::Intimacy, 0.1, true),
            on_axis(7, VulnerabilityAxis::Intimacy, 0.1, true),
            // Belonging: 1 of 4, ranked out of the top three.
            on_axis(8, VulnerabilityAxis::Belonging, 0.4, false),
            on_axis(9, VulnerabilityAxis::Belonging, 0.1, true),
            on_axis(10, VulnerabilityAxis::Belonging, 0.1, true),
            on_axis(11, VulnerabilityAxis::Belonging, 0.1, true),
        ];

        let scenarios = top_risk_scenarios(&timelines);
        assert_eq!(scenarios.len(), 3);
        assert_eq!(scenarios[0].axis, VulnerabilityAxis::Power);
        assert_eq!(scenarios[0].collapse_rate, 1.0);
        assert_eq!(scenarios[1].axis, VulnerabilityAxis::Security);
        assert_eq!(scenarios[1].n_collapses, 2);
        assert!((scenarios[1].mean_severity - 0.7).abs() < 1e-12);
        assert_eq!(scenarios[1].collapse_rate, 0.5);
        assert_eq!(scenarios[2].axis, VulnerabilityAxis::Intimacy);
        assert!((scenarios[2].collapse_rate - 1.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn axis_without_collapses_is_not_a_risk_scenario() {
        let timelines = (0..5).map(|i| timeline(i, 0.9, true)).collect::<Vec<_>>();
        assert!(top_risk_scenarios(&timelines).is_empty());
    }

    #[test]
    fn bootstrap_interval_brackets_the_point_estimate() {
        let config = EngineConfig {
            bootstrap_resamples: 400,
            ..EngineConfig::default()
        };
        let analysis = BatchAnalyzer::new(&config).analyze(&batch());
        assert!(analysis.homeostasis_ci.lower <= 0.6 && 0.6 <= analysis.homeostasis_ci.upper);
        assert!(analysis.elasticity_ci.lower <= analysis.elasticity_ci.upper);
        assert_eq!(analysis.recommendation, Recommendation::Resilient);
    }

    #[test]
    fn resilience_interval_brackets_the_mean_score() {
        let mut batch = batch();
        for timeline in &mut batch.timelines {
            timeline.final_resilience_score = if timeline.index % 2 == 0 { 0.4 } else { 0.8 };
        }
        let config = EngineConfig {
            bootstrap_resamples: 400,
            ..EngineConfig::default()
        };
        let ci = BatchAnalyzer::new(&config).analyze(&batch).resilience_ci;
        assert!(ci.lower <= 0.6 && 0.6 <= ci.upper, "{ci:?}");
        assert!(ci.lower >= 0.4 && ci.upper <= 0.8);
        assert!(ci.lower < ci.upper);
    }

    #[test]
    fn bootstrap_is_identical_across_thread_counts() {
        let single = EngineConfig {
            analysis_threads: 1,
            bootstrap_resamples: 200,
            ..EngineConfig::default()
        };
        let pooled = EngineConfig {
            analysis_threads: 4,
            ..single.clone()
        };
        let batch = batch();
        assert_eq!(
            BatchAnalyzer::new(&single).analyze(&batch),
            BatchAnalyzer::new(&pooled).analyze(&batch)
        );
    }

    #[test]
    fn empty_batch_degrades_to_point_intervals() {
        let analysis = BatchAnalyzer::new(&EngineConfig::default()).analyze(&result(Vec::new()));
        assert_eq!(analysis.homeostasis_ci.lower, analysis.homeostasis_ci.upper);
        assert_eq!(analysis.resilience_ci.lower, analysis.resilience_ci.upper);
        assert!(analysis.top_risk_scenarios.is_empty());
        assert!(analysis.severity_quartiles.iter().all(|band| band.count == 0));
    }

    #[test]
    fn recommendation_bands() {
        assert_eq!(recommend(0.8), Recommendation::Thriving);
        assert_eq!(recommend(0.6), Recommendation::Resilient);
        assert_eq!(recommend(0.4), Recommendation::Fragile);
        assert_eq!(recommend(0.39), Recommendation::AtRisk);
    }
}
