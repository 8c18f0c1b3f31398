//! Batch orchestration and population statistics.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use contracts::{
    BatchRequest, BatchStatus, EngineConfig, ExclusionReason, ProgressEvent, SimulationResult,
    Timeline, TimelineExclusion, VulnerabilityAxis, SCHEMA_VERSION_V1,
};
use rand::seq::SliceRandom;
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{info, warn};

use crate::config::validate_config;
use crate::dialogue::{DialogueBackend, ThrottledBackend};
use crate::error::{BatchError, ConfigError, TimelineError};
use crate::profile::validate_pair;
use crate::seed::{hash_bytes, stream_rng, timeline_seed, STREAM_STRATA};
use crate::simulator::{ConversationSimulator, TimelineSpec};

const QUINTILE: f64 = 0.2;

// ---------------------------------------------------------------------------
// Cancellation and progress
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared by every timeline of a batch.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Receives one event per finished timeline.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards progress.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn emit(&self, _event: ProgressEvent) {}
}

impl ProgressSink for broadcast::Sender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.send(event);
    }
}

impl ProgressSink for mpsc::UnboundedSender<ProgressEvent> {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.send(event);
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

pub struct RelationalMonteCarloRunner {
    config: Arc<EngineConfig>,
    backend: Arc<dyn DialogueBackend>,
}

impl RelationalMonteCarloRunner {
    /// The backend is wrapped so that at most `max_inflight_generations` calls are
    /// outstanding across the whole batch.
    pub fn new(config: EngineConfig, backend: Arc<dyn DialogueBackend>) -> Result<Self, BatchError> {
        validate_config(&config)?;
        let throttled: Arc<dyn DialogueBackend> =
            Arc::new(ThrottledBackend::new(backend, config.max_inflight_generations));
        Ok(Self {
            config: Arc::new(config),
            backend: throttled,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Batch id used when the request does not carry one.
    pub fn default_batch_id(request: &BatchRequest) -> String {
        let key = format!(
            "{}|{}|{}|{}",
            request.profile_a.profile_id, request.profile_b.profile_id, request.base_seed, request.n
        );
        format!("batch-{:016x}", hash_bytes(key.as_bytes()))
    }

    pub async fn run(
        &self,
        request: BatchRequest,
        progress: &dyn ProgressSink,
        cancel: CancelHandle,
    ) -> Result<SimulationResult, BatchError> {
        validate_pair(&request.profile_a, &request.profile_b)?;
        if request.n == 0 {
            return Err(ConfigError::Zero { field: "n" }.into());
        }
        let max_turns = request.max_turns.unwrap_or(self.config.max_turns);
        if max_turns == 0 {
            return Err(ConfigError::Zero { field: "max_turns" }.into());
        }
        let depth = request
            .recursion_depth
            .unwrap_or_else(|| self.config.effective_recursion_depth());

        let batch_id = request
            .batch_id
            .clone()
            .unwrap_or_else(|| Self::default_batch_id(&request));
        let total = request.n;
        let base_seed = request.base_seed;
        info!(batch_id = %batch_id, n = total, base_seed, max_turns, depth, "runner.batch_started");

        let simulator = ConversationSimulator::new(
            Arc::clone(&self.config),
            Arc::new(request.profile_a),
            Arc::new(request.profile_b),
            Arc::clone(&self.backend),
        )
        .with_max_turns(max_turns)
        .with_recursion_depth(depth);

        let percentiles = stratified_percentiles(base_seed, total);
        let workers = Arc::new(Semaphore::new(self.config.max_concurrency));
        let (tx, mut rx) = mpsc::channel(self.config.max_concurrency.max(1) * 2);

        let mut handles = Vec::with_capacity(total);
        for (index, percentile) in percentiles.into_iter().enumerate() {
            let spec = TimelineSpec {
                index,
                seed: timeline_seed(base_seed, index),
                percentile,
            };
            let simulator = simulator.clone();
            let workers = Arc::clone(&workers);
            let cancel = cancel.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                let outcome = match workers.acquire_owned().await {
                    Ok(_permit) if !cancel.is_cancelled() => simulator.run(spec, &cancel).await,
                    _ => Err(TimelineError::Cancelled { turn: 0 }),
                };
                let _ = tx.send((spec, outcome)).await;
            }));
        }
        drop(tx);

        let mut timelines = BTreeMap::new();
        let mut exclusions = BTreeMap::new();
        while let Some((spec, outcome)) = rx.recv().await {
            match outcome {
                Ok(timeline) => {
                    timelines.insert(spec.index, timeline);
                }
                Err(error) => {
                    let reason = exclusion_reason(&error);
                    match reason {
                        ExclusionReason::Cancelled => {}
                        ExclusionReason::InvariantViolation => warn!(
                            batch_id = %batch_id,
                            timeline = spec.index,
                            seed = %spec.seed,
                            error = %error,
                            "runner.timeline_invariant_violation"
                        ),
                        ExclusionReason::GenerationFailed => warn!(
                            batch_id = %batch_id,
                            timeline = spec.index,
                            seed = %spec.seed,
                            error = %error,
                            "runner.timeline_failed"
                        ),
                    }
                    exclusions.insert(
                        spec.index,
                        TimelineExclusion {
                            index: spec.index,
                            seed: spec.seed,
                            reason,
                            message: error.to_string(),
                        },
                    );
                }
            }
            progress.emit(ProgressEvent::new(
                batch_id.clone(),
                timelines.len() + exclusions.len(),
                exclusions.len(),
                total,
            ));
        }

        for handle in handles {
            if let Err(error) = handle.await {
                warn!(batch_id = %batch_id, error = %error, "runner.worker_aborted");
            }
        }
        for index in 0..total {
            if !timelines.contains_key(&index) && !exclusions.contains_key(&index) {
                exclusions.insert(
                    index,
                    TimelineExclusion {
                        index,
                        seed: timeline_seed(base_seed, index),
                        reason: ExclusionReason::InvariantViolation,
                        message: "timeline worker ended without a result".to_string(),
                    },
                );
            }
        }

        let failed = exclusions
            .values()
            .filter(|exclusion| exclusion.reason != ExclusionReason::Cancelled)
            .count();
        let max_fraction = self.config.max_failure_fraction;
        if failed as f64 > max_fraction * total as f64 || (timelines.is_empty() && failed > 0) {
            warn!(batch_id = %batch_id, failed, total, "runner.batch_failed");
            return Err(BatchError::TooManyFailures {
                failed,
                total,
                max_fraction,
            });
        }
        if timelines.is_empty() {
            info!(batch_id = %batch_id, "runner.batch_cancelled");
            return Err(BatchError::Cancelled);
        }

        let result = aggregate(
            batch_id,
            base_seed,
            total,
            timelines.into_values().collect(),
            exclusions.into_values().collect(),
            cancel.is_cancelled(),
        );
        info!(
            batch_id = %result.batch_id,
            status = %result.status,
            n = result.n_simulations,
            homeostasis_rate = result.homeostasis_rate,
            "runner.batch_finished"
        );
        Ok(result)
    }
}

fn exclusion_reason(error: &TimelineError) -> ExclusionReason {
    if matches!(error, TimelineError::Cancelled { .. }) {
        ExclusionReason::Cancelled
    } else if error.is_invariant_violation() {
        ExclusionReason::InvariantViolation
    } else {
        ExclusionReason::GenerationFailed
    }
}

/// One stress percentile per trial: evenly spaced strata, shuffled from the base seed.
pub fn stratified_percentiles(base_seed: u64, n: usize) -> Vec<f64> {
    let mut percentiles = (0..n)
        .map(|i| (i as f64 + 0.5) / n as f64)
        .collect::<Vec<_>>();
    let mut rng = stream_rng(base_seed, STREAM_STRATA);
    percentiles.shuffle(&mut rng);
    percentiles
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Population statistics over completed timelines. Exclusions are reported but
/// never enter a denominator.
pub fn aggregate(
    batch_id: String,
    base_seed: u64,
    n_requested: usize,
    timelines: Vec<Timeline>,
    exclusions: Vec<TimelineExclusion>,
    cancelled: bool,
) -> SimulationResult {
    let homeostasis_rate = share(&timelines, |timeline| timeline.reached_homeostasis);
    let antifragility_rate = share(&timelines, |timeline| timeline.antifragile);

    let elasticities = timelines
        .iter()
        .map(|timeline| timeline.narrative_elasticity)
        .collect::<Vec<_>>();
    let collapse_attribution = collapse_attribution(&timelines);
    let primary_collapse_vector = primary_vector(&collapse_attribution);
    let (p20_homeostasis, p80_homeostasis) = severity_quintiles(&timelines);

    let status = if exclusions.is_empty() {
        BatchStatus::Completed
    } else {
        BatchStatus::PartiallyCompletedWithExclusions
    };

    SimulationResult {
        schema_version: SCHEMA_VERSION_V1.to_string(),
        batch_id,
        base_seed,
        status,
        cancelled,
        n_requested,
        n_simulations: timelines.len(),
        homeostasis_rate,
        antifragility_rate,
        median_elasticity: median(&elasticities),
        collapse_attribution,
        primary_collapse_vector,
        p20_homeostasis,
        p80_homeostasis,
        exclusions,
        timelines,
    }
}

fn share<F>(timelines: &[Timeline], predicate: F) -> f64
where
    F: Fn(&Timeline) -> bool,
{
    if timelines.is_empty() {
        return 0.0;
    }
    timelines.iter().filter(|timeline| predicate(timeline)).count() as f64 / timelines.len() as f64
}

pub fn collapse_attribution(timelines: &[Timeline]) -> BTreeMap<VulnerabilityAxis, f64> {
    let mut counts = BTreeMap::<VulnerabilityAxis, usize>::new();
    for timeline in timelines.iter().filter(|timeline| timeline.collapsed()) {
        *counts.entry(timeline.crisis_axis).or_default() += 1;
    }
    let total = counts.values().sum::<usize>();
    counts
        .into_iter()
        .map(|(axis, count)| (axis, count as f64 / total as f64))
        .collect()
}

/// Arg-max axis; ties go to the earlier axis.
fn primary_vector(attribution: &BTreeMap<VulnerabilityAxis, f64>) -> Option<VulnerabilityAxis> {
    let mut best: Option<(VulnerabilityAxis, f64)> = None;
    for (axis, share) in attribution {
        if best.map_or(true, |(_, top)| *share > top) {
            best = Some((*axis, *share));
        }
    }
    best.map(|(axis, _)| axis)
}

/// Homeostasis rate in the lowest and highest severity quintiles. An empty
/// quintile counts as fully homeostatic.
pub fn severity_quintiles(timelines: &[Timeline]) -> (f64, f64) {
    let mut ordered = timelines.iter().collect::<Vec<_>>();
    ordered.sort_by(|left, right| {
        left.crisis_severity
            .total_cmp(&right.crisis_severity)
            .then(left.index.cmp(&right.index))
    });
    let size = (QUINTILE * ordered.len() as f64).round() as usize;
    let rate = |bin: &[&Timeline]| {
        if bin.is_empty() {
            return 1.0;
        }
        bin.iter().filter(|timeline| timeline.reached_homeostasis).count() as f64 / bin.len() as f64
    };
    (rate(&ordered[..size]), rate(&ordered[ordered.len() - size..]))
}

pub fn median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}
