use contracts::Speaker;
use thiserror::Error;

/// Precondition violation on an input profile.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProfileError {
    #[error("profile for {party} is incomplete: {reason}")]
    ProfileIncomplete { party: Speaker, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrackerError {
    #[error("belief update out of order: prior turn {prior}, requested turn {requested}")]
    OutOfOrderUpdate { prior: u32, requested: u32 },
}

/// Failure reported by a dialogue backend for a single utterance request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    #[error("dialogue backend unavailable: {0}")]
    Unavailable(String),
    #[error("dialogue generation timed out after {0} ms")]
    Timeout(u64),
    #[error("dialogue backend rejected request: {0}")]
    Rejected(String),
}

impl GenerationError {
    /// Rejections are permanent; everything else may succeed on retry.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Rejected(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TimelineError {
    #[error(transparent)]
    Profile(#[from] ProfileError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("turn {turn}: {source}")]
    Generation {
        turn: u32,
        #[source]
        source: GenerationError,
    },
    #[error("turn {turn}: retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        turn: u32,
        attempts: u32,
        last: GenerationError,
    },
    #[error("timeline cancelled before turn {turn}")]
    Cancelled { turn: u32 },
}

impl TimelineError {
    /// Invariant violations point at a programming defect rather than a flaky backend.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::Profile(_) | Self::Tracker(_))
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("signal weights must be non-negative and sum to 1 (got {0:.6})")]
    SignalWeights(f64),
    #[error("risk thresholds must increase strictly within (0, 1]")]
    RiskThresholds,
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{field} must lie in [0, 1] (got {value})")]
    OutOfUnitRange { field: &'static str, value: f64 },
    #[error("severity range must satisfy 0 <= low <= high <= 1")]
    SeverityRange,
    #[error("severity distribution parameters must be finite and positive")]
    SeverityDistribution,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BatchError {
    #[error(transparent)]
    Precondition(#[from] ProfileError),
    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
    #[error("{failed} of {total} timelines failed (max fraction {max_fraction})")]
    TooManyFailures {
        failed: usize,
        total: usize,
        max_fraction: f64,
    },
    #[error("batch cancelled before any timeline completed")]
    Cancelled,
}
