//! v1 exchange contracts for the relational engine, API, persistence, and CLI.

pub mod profile;
pub mod serde_u64_string;

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use profile::{AttachmentStyle, CommunicationStyle, ShadowVectorProfile, VulnerabilityAxis};

pub const SCHEMA_VERSION_V1: &str = "1.0";
pub const MAX_RECURSION_DEPTH: u8 = 3;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Fixed weights of the five collapse signals. Must sum to one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SignalWeights {
    pub epistemic_divergence: f64,
    pub linguistic_withdrawal: f64,
    pub defensive_attribution: f64,
    pub narrative_incoherence: f64,
    pub response_latency_proxy: f64,
}

impl Default for SignalWeights {
    fn default() -> Self {
        Self {
            epistemic_divergence: 0.30,
            linguistic_withdrawal: 0.20,
            defensive_attribution: 0.25,
            narrative_incoherence: 0.15,
            response_latency_proxy: 0.10,
        }
    }
}

impl SignalWeights {
    pub fn total(&self) -> f64 {
        self.epistemic_divergence
            + self.linguistic_withdrawal
            + self.defensive_attribution
            + self.narrative_incoherence
            + self.response_latency_proxy
    }
}

/// Lower bounds of the MODERATE, HIGH and CRITICAL bands.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RiskThresholds {
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            moderate: 0.40,
            high: 0.65,
            critical: 0.80,
        }
    }
}

/// Shape of crisis severity within `severity_range`.
///
/// Timeline percentiles are pushed through this distribution's quantile
/// function, so a stratified batch still covers the whole range.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SeverityDistribution {
    #[default]
    Uniform,
    /// Pareto truncated to `[1, 5]` and rescaled: mostly minor, rarely catastrophic.
    Pareto { alpha: f64 },
    Beta { alpha: f64, beta: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    pub schema_version: String,
    pub signal_weights: SignalWeights,
    pub risk_thresholds: RiskThresholds,
    pub recursion_depth: u8,
    pub max_turns: u32,
    pub max_concurrency: usize,
    pub max_inflight_generations: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub turn_timeout_ms: u64,
    pub max_failure_fraction: f64,
    pub collapse_window: usize,
    pub voc_scale: f64,
    pub crisis_load_weight: f64,
    pub severity_range: (f64, f64),
    pub severity_distribution: SeverityDistribution,
    pub aftershock_count: u8,
    pub analysis_threads: u8,
    pub bootstrap_resamples: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            signal_weights: SignalWeights::default(),
            risk_thresholds: RiskThresholds::default(),
            recursion_depth: 2,
            max_turns: 40,
            max_concurrency: 10,
            max_inflight_generations: 10,
            max_retries: 3,
            retry_backoff_ms: 50,
            turn_timeout_ms: 30_000,
            max_failure_fraction: 0.2,
            collapse_window: 3,
            voc_scale: 0.7,
            crisis_load_weight: 0.2,
            severity_range: (0.05, 0.95),
            severity_distribution: SeverityDistribution::Uniform,
            aftershock_count: 0,
            analysis_threads: 4,
            bootstrap_resamples: 1000,
        }
    }
}

impl EngineConfig {
    /// Recursion depth after the hard cap is applied.
    pub fn effective_recursion_depth(&self) -> u8 {
        self.recursion_depth.clamp(1, MAX_RECURSION_DEPTH)
    }
}

// ---------------------------------------------------------------------------
// Crisis events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CrisisKind {
    Betrayal,
    CareerDisruption,
    FinancialCollapse,
    ExternalThreat,
    Loss,
    ValuesConflict,
}

impl CrisisKind {
    pub fn for_axis(axis: VulnerabilityAxis) -> Self {
        match axis {
            VulnerabilityAxis::Intimacy => Self::Betrayal,
            VulnerabilityAxis::Autonomy | VulnerabilityAxis::Achievement => Self::CareerDisruption,
            VulnerabilityAxis::Security | VulnerabilityAxis::Stability => Self::FinancialCollapse,
            VulnerabilityAxis::Power => Self::ExternalThreat,
            VulnerabilityAxis::Belonging => Self::Loss,
            VulnerabilityAxis::Novelty => Self::ValuesConflict,
        }
    }
}

/// Per-party pair of scalar values.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct PartyPair {
    pub agent_a: f64,
    pub agent_b: f64,
}

impl PartyPair {
    pub fn get(&self, speaker: Speaker) -> f64 {
        match speaker {
            Speaker::AgentA => self.agent_a,
            Speaker::AgentB => self.agent_b,
        }
    }

    pub fn mean(&self) -> f64 {
        (self.agent_a + self.agent_b) / 2.0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Aftershock {
    pub axis: VulnerabilityAxis,
    pub severity: f64,
    pub turn: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CrisisEvent {
    pub axis: VulnerabilityAxis,
    pub severity: f64,
    pub turn: u32,
    pub kind: CrisisKind,
    pub vulnerability_score: f64,
    pub elasticity_threshold: f64,
    pub predicted_collapse: PartyPair,
    pub narrative: String,
    pub decision_point: String,
    #[serde(default)]
    pub aftershocks: Vec<Aftershock>,
}

impl CrisisEvent {
    /// Severity in force at `turn`: the latest shock at or before it, if any.
    pub fn active_severity(&self, turn: u32) -> Option<f64> {
        if turn < self.turn {
            return None;
        }
        let aftershock = self
            .aftershocks
            .iter()
            .filter(|shock| shock.turn <= turn)
            .max_by_key(|shock| shock.turn);
        Some(aftershock.map_or(self.severity, |shock| shock.severity.max(0.0)))
    }
}

// ---------------------------------------------------------------------------
// Transcript and snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    AgentA,
    AgentB,
}

impl Speaker {
    pub fn other(self) -> Self {
        match self {
            Self::AgentA => Self::AgentB,
            Self::AgentB => Self::AgentA,
        }
    }

    /// Speaker of a 1-based turn; agent A opens every timeline.
    pub fn for_turn(turn: u32) -> Self {
        if turn % 2 == 1 {
            Self::AgentA
        } else {
            Self::AgentB
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AgentA => "agent_a",
            Self::AgentB => "agent_b",
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptEntry {
    #[serde(rename = "role")]
    pub speaker: Speaker,
    pub content: String,
    pub timestamp: String,
    pub turn: u32,
}

impl TranscriptEntry {
    pub fn new(speaker: Speaker, content: impl Into<String>, turn: u32) -> Self {
        Self {
            speaker,
            content: content.into(),
            timestamp: turn_stamp(turn),
            turn,
        }
    }
}

/// Logical timestamp for a turn. Wall-clock time would break batch replay.
pub fn turn_stamp(turn: u32) -> String {
    format!("turn-{turn:04}")
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskLevel {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskLevel {
    pub fn classify(risk: f64, thresholds: &RiskThresholds) -> Self {
        if risk >= thresholds.critical {
            Self::Critical
        } else if risk >= thresholds.high {
            Self::High
        } else if risk >= thresholds.moderate {
            Self::Moderate
        } else {
            Self::Low
        }
    }
}

/// One of the five weighted collapse signals.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CollapseSignal {
    #[default]
    EpistemicDivergence,
    LinguisticWithdrawal,
    DefensiveAttribution,
    NarrativeIncoherence,
    ResponseLatencyProxy,
}

/// Counter-move suggested when a turn reads HIGH or CRITICAL.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Intervention {
    /// Prompt recall of shared history.
    Reanchor,
    /// Inject a neutral reframing of blame.
    Deescalate,
    /// Prompt explicit acknowledgment.
    Validate,
    /// Steer toward a shared future.
    Reframe,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalBreakdown {
    pub epistemic_divergence: f64,
    pub linguistic_withdrawal: f64,
    pub defensive_attribution: f64,
    pub narrative_incoherence: f64,
    pub response_latency_proxy: f64,
}

impl SignalBreakdown {
    pub fn weighted(&self, weights: &SignalWeights) -> f64 {
        let sum = weights.epistemic_divergence * self.epistemic_divergence
            + weights.linguistic_withdrawal * self.linguistic_withdrawal
            + weights.defensive_attribution * self.defensive_attribution
            + weights.narrative_incoherence * self.narrative_incoherence
            + weights.response_latency_proxy * self.response_latency_proxy;
        sum.clamp(0.0, 1.0)
    }

    pub fn values(&self) -> [(CollapseSignal, f64); 5] {
        [
            (CollapseSignal::EpistemicDivergence, self.epistemic_divergence),
            (CollapseSignal::LinguisticWithdrawal, self.linguistic_withdrawal),
            (CollapseSignal::DefensiveAttribution, self.defensive_attribution),
            (CollapseSignal::NarrativeIncoherence, self.narrative_incoherence),
            (CollapseSignal::ResponseLatencyProxy, self.response_latency_proxy),
        ]
    }

    /// Strongest raw signal. Ties go to the earlier signal in declaration order.
    pub fn primary_driver(&self) -> CollapseSignal {
        let [first, rest @ ..] = self.values();
        rest.into_iter()
            .fold(first, |best, candidate| if candidate.1 > best.1 { candidate } else { best })
            .0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BeliefSnapshot {
    pub turn: u32,
    pub risk: f64,
    pub risk_level: RiskLevel,
    pub signal_breakdown: SignalBreakdown,
    #[serde(default)]
    pub convergence: f64,
    #[serde(default)]
    pub coordination_cost: f64,
    #[serde(default)]
    pub value_of_connection: f64,
    #[serde(default)]
    pub primary_driver: CollapseSignal,
    /// Turns until risk reaches 1.0 at the recent rate of climb; `None` when flat or falling.
    #[serde(default)]
    pub turns_until_likely_collapse: Option<u32>,
    #[serde(default)]
    pub intervention_recommended: bool,
    #[serde(default)]
    pub intervention: Option<Intervention>,
    #[serde(default)]
    pub post_traumatic_growth: bool,
}

// ---------------------------------------------------------------------------
// Timelines and batch results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Timeline {
    pub timeline_id: String,
    pub index: usize,
    #[serde(with = "serde_u64_string")]
    pub seed: u64,
    pub crisis: CrisisEvent,
    pub crisis_severity: f64,
    pub crisis_axis: VulnerabilityAxis,
    pub reached_homeostasis: bool,
    pub collapsed_at_turn: Option<u32>,
    pub antifragile: bool,
    pub narrative_elasticity: f64,
    pub baseline_resilience: f64,
    pub final_resilience_score: f64,
    pub turns_total: u32,
    pub belief_collapse_events: u32,
    pub linguistic_convergence_final: f64,
    /// Risk peaked and has since fallen well below the peak.
    #[serde(default)]
    pub post_traumatic_growth: bool,
    #[serde(default)]
    pub interventions_recommended: u32,
    pub full_transcript: Vec<TranscriptEntry>,
    pub belief_state_snapshots: Vec<BeliefSnapshot>,
}

impl Timeline {
    pub fn collapsed(&self) -> bool {
        self.collapsed_at_turn.is_some()
    }
}

/// Input of one Monte Carlo batch. Unset overrides fall back to the engine config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchRequest {
    #[serde(default)]
    pub batch_id: Option<String>,
    pub profile_a: ShadowVectorProfile,
    pub profile_b: ShadowVectorProfile,
    #[serde(default = "default_batch_size")]
    pub n: usize,
    #[serde(default, with = "serde_u64_string")]
    pub base_seed: u64,
    #[serde(default)]
    pub max_turns: Option<u32>,
    #[serde(default)]
    pub recursion_depth: Option<u8>,
}

fn default_batch_size() -> usize {
    100
}

impl BatchRequest {
    pub fn new(profile_a: ShadowVectorProfile, profile_b: ShadowVectorProfile, n: usize, base_seed: u64) -> Self {
        Self {
            batch_id: None,
            profile_a,
            profile_b,
            n,
            base_seed,
            max_turns: None,
            recursion_depth: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    PartiallyCompletedWithExclusions,
    Failed,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::PartiallyCompletedWithExclusions => "partially_completed_with_exclusions",
            Self::Failed => "failed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExclusionReason {
    GenerationFailed,
    InvariantViolation,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimelineExclusion {
    pub index: usize,
    #[serde(with = "serde_u64_string")]
    pub seed: u64,
    pub reason: ExclusionReason,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimulationResult {
    pub schema_version: String,
    pub batch_id: String,
    #[serde(with = "serde_u64_string")]
    pub base_seed: u64,
    pub status: BatchStatus,
    pub cancelled: bool,
    pub n_requested: usize,
    pub n_simulations: usize,
    pub homeostasis_rate: f64,
    pub antifragility_rate: f64,
    pub median_elasticity: f64,
    pub collapse_attribution: BTreeMap<VulnerabilityAxis, f64>,
    pub primary_collapse_vector: Option<VulnerabilityAxis>,
    pub p20_homeostasis: f64,
    pub p80_homeostasis: f64,
    #[serde(default)]
    pub exclusions: Vec<TimelineExclusion>,
    pub timelines: Vec<Timeline>,
}

impl fmt::Display for SimulationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch_id={} status={} n={}/{} homeostasis={:.3} antifragility={:.3} elasticity={:.3}",
            self.batch_id,
            self.status,
            self.n_simulations,
            self.n_requested,
            self.homeostasis_rate,
            self.antifragility_rate,
            self.median_elasticity
        )
    }
}

/// Emitted once per finished timeline, successful or excluded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressEvent {
    pub batch_id: String,
    pub completed: usize,
    pub total: usize,
    pub percent: f64,
    #[serde(default)]
    pub failed: usize,
}

impl ProgressEvent {
    pub fn new(batch_id: impl Into<String>, completed: usize, failed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100.0
        } else {
            (completed as f64 / total as f64) * 100.0
        };
        Self {
            batch_id: batch_id.into(),
            completed,
            total,
            percent,
            failed,
        }
    }
}

// ---------------------------------------------------------------------------
// Batch analysis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeverityBand {
    pub label: String,
    pub min_severity: f64,
    pub max_severity: f64,
    pub count: usize,
    pub homeostasis_rate: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct SurvivalPoint {
    pub threshold: f64,
    pub homeostasis_rate: f64,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfidenceInterval {
    pub lower: f64,
    pub upper: f64,
    pub level: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
/// Collapse exposure of one crisis axis across a batch.
pub struct RiskScenario {
    pub axis: VulnerabilityAxis,
    pub n_collapses: usize,
    pub mean_severity: f64,
    /// Collapses over every timeline whose crisis hit this axis.
    pub collapse_rate: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Thriving,
    Resilient,
    Fragile,
    AtRisk,
}

impl Recommendation {
    pub fn summary(self) -> &'static str {
        match self {
            Self::Thriving => "pair holds together across nearly every crisis scenario",
            Self::Resilient => "pair recovers in most scenarios but strains under severe stress",
            Self::Fragile => "significant collapse risk; vulnerable axes need targeted support",
            Self::AtRisk => "most timelines end in belief collapse",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchAnalysis {
    pub schema_version: String,
    pub batch_id: String,
    pub severity_quartiles: Vec<SeverityBand>,
    pub survival_curve: Vec<SurvivalPoint>,
    pub homeostasis_ci: ConfidenceInterval,
    pub elasticity_ci: ConfidenceInterval,
    #[serde(default)]
    pub resilience_ci: ConfidenceInterval,
    pub top_risk_scenarios: Vec<RiskScenario>,
    pub recommendation: Recommendation,
}

// ---------------------------------------------------------------------------
// API envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Running,
    Finished,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchStatusReport {
    pub schema_version: String,
    pub batch_id: String,
    #[serde(with = "serde_u64_string")]
    pub base_seed: u64,
    pub state: BatchState,
    pub status: Option<BatchStatus>,
    pub progress: ProgressEvent,
    pub error: Option<String>,
}

impl fmt::Display for BatchStatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch_id={} state={:?} completed={}/{} failed={}",
            self.batch_id,
            self.state,
            self.progress.completed,
            self.progress.total,
            self.progress.failed
        )?;
        if let Some(status) = self.status {
            write!(f, " status={status}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    BatchNotFound,
    TimelineNotFound,
    InvalidProfile,
    InvalidConfig,
    InvalidRequest,
    BatchStateConflict,
    BatchFailed,
    ContractVersionUnsupported,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}
