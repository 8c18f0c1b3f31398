//! One timeline, end to end.
//!
//! Turns are strictly sequential. Each turn generates one utterance, appends it to
//! the transcript, and revises both belief states. It then scores convergence and
//! lets the collapse detector assess the pair. Cancellation is checked between
//! turns only, so a cancelled timeline never leaves a half-updated belief state
//! behind: it is dropped whole.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use contracts::{
    BeliefSnapshot, CrisisEvent, EngineConfig, RiskLevel, ShadowVectorProfile, Speaker, Timeline,
    TranscriptEntry,
};
use tracing::{info, warn};

use crate::alignment::{ConvergenceTrend, LinguisticAlignmentScorer};
use crate::collapse::{resilience, BeliefCollapseDetector};
use crate::dialogue::{DialogueBackend, UtteranceRequest};
use crate::error::{GenerationError, TimelineError};
use crate::events::StochasticEventGenerator;
use crate::linguistics::{is_future_oriented, tokenize};
use crate::runner::CancelHandle;
use crate::seed::turn_seed;
use crate::tom::TheoryOfMindTracker;

const OUTCOME_SPAN: usize = 5;
const IDENTITY_TOKENS: &[&str] = &["we", "us", "our", "together"];

/// Identity of one trial inside a batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimelineSpec {
    pub index: usize,
    pub seed: u64,
    /// Stress percentile in [0, 1] the runner assigned to this trial.
    pub percentile: f64,
}

#[derive(Clone)]
pub struct ConversationSimulator {
    config: Arc<EngineConfig>,
    profile_a: Arc<ShadowVectorProfile>,
    profile_b: Arc<ShadowVectorProfile>,
    backend: Arc<dyn DialogueBackend>,
    scorer: LinguisticAlignmentScorer,
    max_turns: u32,
    recursion_depth: u8,
}

impl ConversationSimulator {
    /// Uses the turn limit and recursion depth from `config`.
    pub fn new(
        config: Arc<EngineConfig>,
        profile_a: Arc<ShadowVectorProfile>,
        profile_b: Arc<ShadowVectorProfile>,
        backend: Arc<dyn DialogueBackend>,
    ) -> Self {
        let max_turns = config.max_turns;
        let recursion_depth = config.effective_recursion_depth();
        Self {
            config,
            profile_a,
            profile_b,
            backend,
            scorer: LinguisticAlignmentScorer,
            max_turns,
            recursion_depth,
        }
    }

    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns.max(1);
        self
    }

    pub fn with_recursion_depth(mut self, depth: u8) -> Self {
        self.recursion_depth = depth.clamp(1, contracts::MAX_RECURSION_DEPTH);
        self
    }

    pub fn max_turns(&self) -> u32 {
        self.max_turns
    }

    /// Draw this trial's crisis from its seed, then run it.
    pub async fn run(&self, spec: TimelineSpec, cancel: &CancelHandle) -> Result<Timeline, TimelineError> {
        let generator = StochasticEventGenerator::new(&self.profile_a, &self.profile_b, &self.config)?;
        let crisis = generator.generate(spec.seed, spec.percentile, self.max_turns);
        self.run_with_crisis(spec, crisis, cancel).await
    }

    /// Run against a fixed crisis. Scenario tests use this to hold severity constant.
    pub async fn run_with_crisis(
        &self,
        spec: TimelineSpec,
        crisis: CrisisEvent,
        cancel: &CancelHandle,
    ) -> Result<Timeline, TimelineError> {
        let tracker_a = TheoryOfMindTracker::new(Arc::clone(&self.profile_a), self.recursion_depth);
        let tracker_b = TheoryOfMindTracker::new(Arc::clone(&self.profile_b), self.recursion_depth);
        let mut state_a = tracker_a.initial_state();
        let mut state_b = tracker_b.initial_state();
        let mut detector = BeliefCollapseDetector::new(&self.config, &crisis);

        let mut transcript: Vec<TranscriptEntry> = Vec::with_capacity(self.max_turns as usize);
        let mut evidence = Vec::with_capacity(self.max_turns as usize);
        let mut convergence = self
            .scorer
            .score(&transcript, &self.profile_a, &self.profile_b);

        for turn in 1..=self.max_turns {
            if cancel.is_cancelled() {
                return Err(TimelineError::Cancelled { turn });
            }

            let speaker = Speaker::for_turn(turn);
            let (profile, belief) = match speaker {
                Speaker::AgentA => (self.profile_a.as_ref(), &state_a),
                Speaker::AgentB => (self.profile_b.as_ref(), &state_b),
            };
            let request = UtteranceRequest {
                speaker,
                profile,
                belief,
                transcript: &transcript,
                crisis: (turn >= crisis.turn).then_some(&crisis),
                turn,
                seed: turn_seed(spec.seed, turn),
            };
            let content = self.generate_with_retry(request, turn).await?;

            let (next_a, next_b) = match speaker {
                Speaker::AgentA => (
                    tracker_a.update(&state_a, Some(&content), None, turn)?,
                    tracker_b.update(&state_b, None, Some(&content), turn)?,
                ),
                Speaker::AgentB => (
                    tracker_a.update(&state_a, None, Some(&content), turn)?,
                    tracker_b.update(&state_b, Some(&content), None, turn)?,
                ),
            };
            state_a = next_a;
            state_b = next_b;
            transcript.push(TranscriptEntry::new(speaker, content, turn));

            let reading = self
                .scorer
                .reading(&transcript, &self.profile_a, &self.profile_b);
            convergence = reading.convergence;
            evidence.push(reading.evidence);

            let snapshot = detector.assess(&state_a, &state_b, convergence, turn);
            if detector.collapsed_at() == Some(turn) {
                info!(
                    timeline = spec.index,
                    turn,
                    risk = snapshot.risk,
                    coordination_cost = snapshot.coordination_cost,
                    value_of_connection = snapshot.value_of_connection,
                    "simulator.collapse_declared"
                );
            }
        }

        let collapsed_at_turn = detector.collapsed_at();
        let convergence_at_crisis = detector.convergence_at_crisis().unwrap_or(convergence);
        let snapshots = detector.into_snapshots();

        let outcome = Outcome::evaluate(
            &crisis,
            &transcript,
            &snapshots,
            &evidence,
            collapsed_at_turn,
            convergence,
            convergence_at_crisis,
        );

        Ok(Timeline {
            timeline_id: format!("timeline-{:04}-{:016x}", spec.index, spec.seed),
            index: spec.index,
            seed: spec.seed,
            crisis_severity: crisis.severity,
            crisis_axis: crisis.axis,
            reached_homeostasis: outcome.reached_homeostasis,
            collapsed_at_turn,
            antifragile: outcome.antifragile,
            narrative_elasticity: narrative_elasticity(&transcript, crisis.turn),
            baseline_resilience: outcome.baseline_resilience,
            final_resilience_score: outcome.final_resilience,
            turns_total: transcript.len() as u32,
            belief_collapse_events: outcome.collapse_events,
            linguistic_convergence_final: convergence,
            post_traumatic_growth: snapshots
                .last()
                .is_some_and(|snapshot| snapshot.post_traumatic_growth),
            interventions_recommended: snapshots
                .iter()
                .filter(|snapshot| snapshot.intervention_recommended)
                .count() as u32,
            full_transcript: transcript,
            belief_state_snapshots: snapshots,
            crisis,
        })
    }

    /// One utterance, retried with exponential backoff on transient failures.
    async fn generate_with_retry(
        &self,
        request: UtteranceRequest<'_>,
        turn: u32,
    ) -> Result<String, TimelineError> {
        let timeout_ms = self.config.turn_timeout_ms;
        let attempts = self.config.max_retries.saturating_add(1);
        let mut last = GenerationError::Unavailable("no generation attempt made".to_string());

        for attempt in 0..attempts {
            let outcome = match tokio::time::timeout(
                Duration::from_millis(timeout_ms),
                self.backend.generate_utterance(request),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(GenerationError::Timeout(timeout_ms)),
            };

            match outcome {
                Ok(content) => return Ok(content),
                Err(source) if !source.is_transient() => {
                    return Err(TimelineError::Generation { turn, source });
                }
                Err(error) => {
                    warn!(turn, attempt, error = %error, "simulator.generation_retry");
                    last = error;
                    if attempt + 1 < attempts {
                        let factor = 1_u64 << attempt.min(16);
                        let backoff = self.config.retry_backoff_ms.saturating_mul(factor);
                        tokio::time::sleep(Duration::from_millis(backoff)).await;
                    }
                }
            }
        }

        Err(TimelineError::RetriesExhausted {
            turn,
            attempts,
            last,
        })
    }
}

// ---------------------------------------------------------------------------
// Outcome classification
// ---------------------------------------------------------------------------

struct Outcome {
    reached_homeostasis: bool,
    antifragile: bool,
    baseline_resilience: f64,
    final_resilience: f64,
    collapse_events: u32,
}

impl Outcome {
    fn evaluate(
        crisis: &CrisisEvent,
        transcript: &[TranscriptEntry],
        snapshots: &[BeliefSnapshot],
        evidence: &[f64],
        collapsed_at_turn: Option<u32>,
        convergence_final: f64,
        convergence_at_crisis: f64,
    ) -> Self {
        let collapse_events = snapshots
            .iter()
            .filter(|snapshot| snapshot.turn >= crisis.turn && snapshot.risk_level == RiskLevel::Critical)
            .count() as u32;

        let pre_crisis = snapshots
            .iter()
            .take_while(|snapshot| snapshot.turn < crisis.turn)
            .count();
        let baseline_resilience = resilience(
            &snapshots[..pre_crisis],
            convergence_at_crisis,
            convergence_at_crisis,
        );
        let final_resilience = resilience(snapshots, convergence_final, convergence_at_crisis);

        let recent_snapshots = &snapshots[snapshots.len().saturating_sub(OUTCOME_SPAN)..];
        let recent_entries = &transcript[transcript.len().saturating_sub(OUTCOME_SPAN)..];
        let no_recent_critical = recent_snapshots
            .iter()
            .all(|snapshot| snapshot.risk_level != RiskLevel::Critical);
        let converging = ConvergenceTrend::from_history(evidence) != ConvergenceTrend::Diverging;
        let future_oriented = recent_entries
            .iter()
            .any(|entry| is_future_oriented(&entry.content));

        let reached_homeostasis = collapsed_at_turn.is_none()
            && no_recent_critical
            && converging
            && future_oriented
            && final_resilience > crisis.elasticity_threshold;

        Self {
            reached_homeostasis,
            antifragile: reached_homeostasis && final_resilience > baseline_resilience,
            baseline_resilience,
            final_resilience,
            collapse_events,
        }
    }
}

/// Cosine similarity of relationship-identity language before and after the crisis.
pub fn narrative_elasticity(transcript: &[TranscriptEntry], crisis_turn: u32) -> f64 {
    let (before, after): (Vec<_>, Vec<_>) = transcript
        .iter()
        .partition(|entry| entry.turn < crisis_turn);
    cosine(&identity_profile(&before), &identity_profile(&after))
}

/// Bag of words over identity statements, or over the last few utterances when
/// there are none.
fn identity_profile(entries: &[&TranscriptEntry]) -> BTreeMap<String, f64> {
    let identity = entries
        .iter()
        .filter(|entry| {
            tokenize(&entry.content)
                .iter()
                .any(|token| IDENTITY_TOKENS.contains(&token.as_str()))
        })
        .copied()
        .collect::<Vec<_>>();
    let source = if identity.is_empty() {
        &entries[entries.len().saturating_sub(OUTCOME_SPAN)..]
    } else {
        identity.as_slice()
    };

    let mut bag = BTreeMap::new();
    for entry in source {
        for token in tokenize(&entry.content) {
            *bag.entry(token).or_insert(0.0) += 1.0;
        }
    }
    bag
}

fn cosine(left: &BTreeMap<String, f64>, right: &BTreeMap<String, f64>) -> f64 {
    let dot = left
        .iter()
        .filter_map(|(token, weight)| right.get(token).map(|other| weight * other))
        .sum::<f64>();
    let norm = |bag: &BTreeMap<String, f64>| bag.values().map(|v| v * v).sum::<f64>().sqrt();
    let denominator = norm(left) * norm(right);
    if denominator == 0.0 {
        return 0.0;
    }
    (dot / denominator).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use contracts::VulnerabilityAxis;

    use super::*;
    use crate::dialogue::ScriptedBackend;
    use crate::profile::sample_pair;

    fn simulator(backend: Arc<dyn DialogueBackend>, config: EngineConfig) -> ConversationSimulator {
        let (a, b) = sample_pair();
        ConversationSimulator::new(Arc::new(config), Arc::new(a), Arc::new(b), backend)
    }

    fn spec(seed: u64) -> TimelineSpec {
        TimelineSpec {
            index: 0,
            seed,
            percentile: 0.5,
        }
    }

    #[tokio::test]
    async fn timeline_runs_every_turn_in_order() {
        let sim = simulator(Arc::new(ScriptedBackend), EngineConfig::default()).with_max_turns(12);
        let timeline = sim.run(spec(3), &CancelHandle::new()).await.expect("timeline");
        assert_eq!(timeline.turns_total, 12);
        assert_eq!(timeline.belief_state_snapshots.len(), 12);
        for (position, entry) in timeline.full_transcript.iter().enumerate() {
            assert_eq!(entry.turn, position as u32 + 1);
            assert_eq!(entry.speaker, Speaker::for_turn(entry.turn));
        }
        assert!(timeline.timeline_id.starts_with("timeline-0000-"));
    }

    #[tokio::test]
    async fn cancelled_timeline_returns_no_partial_result() {
        let sim = simulator(Arc::new(ScriptedBackend), EngineConfig::default());
        let cancel = CancelHandle::new();
        cancel.cancel();
        let err = sim.run(spec(1), &cancel).await.expect_err("cancelled");
        assert_eq!(err, TimelineError::Cancelled { turn: 1 });
    }

    struct Rejecting;

    #[async_trait]
    impl DialogueBackend for Rejecting {
        async fn generate_utterance(&self, _request: UtteranceRequest<'_>) -> Result<String, GenerationError> {
            Err(GenerationError::Rejected("content policy".to_string()))
        }
    }

    struct Hanging;

    #[async_trait]
    impl DialogueBackend for Hanging {
        async fn generate_utterance(&self, _request: UtteranceRequest<'_>) -> Result<String, GenerationError> {
            std::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    #[tokio::test]
    async fn permanent_rejection_is_not_retried() {
        let sim = simulator(Arc::new(Rejecting), EngineConfig::default());
        let err = sim.run(spec(1), &CancelHandle::new()).await.expect_err("rejected");
        assert!(matches!(err, TimelineError::Generation { turn: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_exhaust_retries() {
        let config = EngineConfig {
            turn_timeout_ms: 10,
            max_retries: 2,
            ..EngineConfig::default()
        };
        let sim = simulator(Arc::new(Hanging), config);
        let err = sim.run(spec(1), &CancelHandle::new()).await.expect_err("timed out");
        assert_eq!(
            err,
            TimelineError::RetriesExhausted {
                turn: 1,
                attempts: 3,
                last: GenerationError::Timeout(10),
            }
        );
    }

    #[tokio::test]
    async fn collapse_events_count_critical_snapshots_after_crisis() {
        let sim = simulator(Arc::new(ScriptedBackend), EngineConfig::default()).with_max_turns(20);
        for seed in 0..6 {
            let timeline = sim.run(spec(seed), &CancelHandle::new()).await.expect("timeline");
            let expected = timeline
                .belief_state_snapshots
                .iter()
                .filter(|s| s.turn >= timeline.crisis.turn && s.risk_level == RiskLevel::Critical)
                .count() as u32;
            assert_eq!(timeline.belief_collapse_events, expected);
            if timeline.antifragile {
                assert!(timeline.reached_homeostasis);
            }
            if timeline.collapsed() {
                assert!(!timeline.reached_homeostasis);
            }
        }
    }

    #[tokio::test]
    async fn fixed_crisis_is_carried_into_the_timeline() {
        let (a, b) = sample_pair();
        let crisis = StochasticEventGenerator::new(&a, &b, &EngineConfig::default())
            .expect("valid pair")
            .build(VulnerabilityAxis::Security, 0.42, 4);
        let sim = simulator(Arc::new(ScriptedBackend), EngineConfig::default()).with_max_turns(10);
        let timeline = sim
            .run_with_crisis(spec(9), crisis.clone(), &CancelHandle::new())
            .await
            .expect("timeline");
        assert_eq!(timeline.crisis, crisis);
        assert_eq!(timeline.crisis_axis, VulnerabilityAxis::Security);
        assert!((timeline.crisis_severity - 0.42).abs() < 1e-12);
    }

    #[test]
    fn elasticity_compares_identity_statements() {
        let transcript = vec![
            TranscriptEntry::new(Speaker::AgentA, "we love our sunday walks together", 1),
            TranscriptEntry::new(Speaker::AgentB, "long week at work", 2),
            TranscriptEntry::new(Speaker::AgentA, "we love our sunday walks together", 3),
        ];
        assert!((narrative_elasticity(&transcript, 3) - 1.0).abs() < 1e-9);

        let broken = vec![
            TranscriptEntry::new(Speaker::AgentA, "we love our sunday walks together", 1),
            TranscriptEntry::new(Speaker::AgentB, "whatever", 2),
        ];
        assert_eq!(narrative_elasticity(&broken, 2), 0.0);
        assert_eq!(narrative_elasticity(&[], 1), 0.0);
    }
}
