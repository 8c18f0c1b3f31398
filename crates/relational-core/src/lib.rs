//! Relational Monte Carlo engine: recursive belief tracking, crisis injection,
//! collapse detection and batch aggregation over seeded conversational timelines.

pub mod alignment;
pub mod analysis;
pub mod collapse;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod events;
pub mod linguistics;
pub mod profile;
pub mod runner;
pub mod seed;
pub mod simulator;
pub mod tom;

pub use alignment::{AlignmentReading, ConvergenceTrend, LinguisticAlignmentScorer};
pub use analysis::BatchAnalyzer;
pub use collapse::BeliefCollapseDetector;
pub use config::validate_config;
pub use dialogue::{DialogueBackend, ScriptedBackend, ThrottledBackend, UtteranceRequest};
pub use error::{
    BatchError, ConfigError, GenerationError, ProfileError, TimelineError, TrackerError,
};
pub use events::StochasticEventGenerator;
pub use profile::{sample_pair, validate_pair, validate_profile};
pub use runner::{CancelHandle, NoProgress, ProgressSink, RelationalMonteCarloRunner};
pub use simulator::{ConversationSimulator, TimelineSpec};
pub use tom::{BeliefLayer, BeliefSignal, BeliefState, TheoryOfMindTracker};
