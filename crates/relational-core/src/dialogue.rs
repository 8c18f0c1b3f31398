//! Dialogue generation seam.
//!
//! The simulator only ever talks to [`DialogueBackend`]. Concrete backends are
//! swappable: [`ScriptedBackend`] is deterministic and offline, and
//! [`ThrottledBackend`] caps in-flight calls to whatever backend it wraps.

use std::sync::Arc;

use async_trait::async_trait;
use contracts::{AttachmentStyle, CrisisEvent, ShadowVectorProfile, Speaker, TranscriptEntry};
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tokio::sync::Semaphore;

use crate::error::GenerationError;
use crate::tom::{BeliefSignal, BeliefState};

/// Everything a backend may condition one utterance on.
#[derive(Debug, Clone, Copy)]
pub struct UtteranceRequest<'a> {
    pub speaker: Speaker,
    pub profile: &'a ShadowVectorProfile,
    pub belief: &'a BeliefState,
    pub transcript: &'a [TranscriptEntry],
    pub crisis: Option<&'a CrisisEvent>,
    pub turn: u32,
    /// Per-turn seed. Deterministic backends must draw only from this.
    pub seed: u64,
}

#[async_trait]
pub trait DialogueBackend: Send + Sync {
    async fn generate_utterance(&self, request: UtteranceRequest<'_>) -> Result<String, GenerationError>;
}

#[async_trait]
impl<T> DialogueBackend for Arc<T>
where
    T: DialogueBackend + ?Sized,
{
    async fn generate_utterance(&self, request: UtteranceRequest<'_>) -> Result<String, GenerationError> {
        (**self).generate_utterance(request).await
    }
}

// ---------------------------------------------------------------------------
// ThrottledBackend
// ---------------------------------------------------------------------------

/// Admits at most `permits` concurrent generation calls across every timeline
/// sharing this wrapper.
pub struct ThrottledBackend<B> {
    inner: B,
    permits: Arc<Semaphore>,
}

impl<B> ThrottledBackend<B> {
    pub fn new(inner: B, permits: usize) -> Self {
        Self {
            inner,
            permits: Arc::new(Semaphore::new(permits.max(1))),
        }
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl<B> DialogueBackend for ThrottledBackend<B>
where
    B: DialogueBackend,
{
    async fn generate_utterance(&self, request: UtteranceRequest<'_>) -> Result<String, GenerationError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| GenerationError::Unavailable("generation permits closed".to_string()))?;
        self.inner.generate_utterance(request).await
    }
}

// ---------------------------------------------------------------------------
// ScriptedBackend
// ---------------------------------------------------------------------------

const WARM_BAND: f64 = 0.3;
const TENSE_BAND: f64 = 0.55;
const DEFENSIVE_BAND: f64 = 0.8;
const DISTRESS_NOISE: f64 = 0.08;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tone {
    Warm,
    Tense,
    Defensive,
    Withdrawn,
}

impl Tone {
    pub fn from_distress(distress: f64) -> Self {
        if distress < WARM_BAND {
            Self::Warm
        } else if distress < TENSE_BAND {
            Self::Tense
        } else if distress < DEFENSIVE_BAND {
            Self::Defensive
        } else {
            Self::Withdrawn
        }
    }
}

const OPENERS: &[&str] = &[
    "I'm glad we got a quiet evening",
    "Thank you for checking in on me today",
    "I appreciate you listening about work",
    "I love how we handled the weekend plans",
];

const WARM_REPAIR: &[&str] = &[
    "I'm glad you told me, let's work through it together",
    "Thank you for being honest, we can figure it out",
    "I appreciate you, and I want us to get through this together",
    "I'm here with you, let's take it one step at a time",
];

const TENSE: &[&str] = &[
    "I'm not sure how to talk about this, maybe we need some time",
    "Honestly I'm worried, I guess it's been a lot lately",
    "Perhaps I'm overwhelmed, it's probably just been a heavy week",
    "I might need a bit of space to think, I'm stressed",
];

const DEFENSIVE: &[&str] = &[
    "You always make this about you, it's not my fault",
    "You never listen, this happened because of you",
    "Typical of you to blame me, you made me feel this way",
    "It's your fault we're here, you never think it through",
];

const WITHDRAWN: &[&str] = &["Whatever. Your fault.", "Not now. Your fault.", "Forget it.", "Whatever."];

/// Deterministic backend driven by profile, beliefs and the active crisis.
///
/// Distress rises with crisis impact on the speaker's valued axes and with how
/// defensive or withdrawn the speaker believes the other party has become.
/// Entropy tolerance damps both and speeds repair.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptedBackend;

impl ScriptedBackend {
    pub fn distress(request: &UtteranceRequest<'_>, noise: f64) -> f64 {
        let profile = request.profile;
        let entropy = profile.entropy_tolerance;
        let baseline = 0.1 * (1.0 - entropy);

        let impact = request.crisis.map_or(0.0, |crisis| crisis_impact(crisis, profile, request.turn));

        let attachment = match profile.attachment_style {
            AttachmentStyle::Secure => 0.0,
            AttachmentStyle::Anxious => 0.12,
            AttachmentStyle::Avoidant => 0.1,
            AttachmentStyle::Fearful => 0.18,
        };
        let perceived = (request.belief.l1.get(BeliefSignal::Defensiveness) - 0.5).max(0.0)
            + (request.belief.l1.get(BeliefSignal::Withdrawal) - 0.5).max(0.0);
        let reactivity = (attachment + perceived) * (1.0 - 0.5 * entropy);

        (baseline + impact + reactivity + noise).clamp(0.0, 1.0)
    }

    fn compose(request: &UtteranceRequest<'_>, tone: Tone, rng: &mut ChaCha8Rng) -> String {
        let pick = |pool: &[&'static str], rng: &mut ChaCha8Rng| pool.choose(rng).copied().unwrap_or_default();
        let signature = request
            .profile
            .linguistic_signature
            .choose(rng)
            .cloned();

        match tone {
            Tone::Warm => {
                let pool = if request.crisis.is_some() { WARM_REPAIR } else { OPENERS };
                let mut line = pick(pool, rng).to_string();
                if let Some(echo) = partner_tail(request) {
                    line.push_str(", ");
                    line.push_str(&echo);
                }
                if let Some(signature) = signature {
                    line.push_str(", ");
                    line.push_str(&signature);
                }
                line.push('.');
                line
            }
            Tone::Tense => format!("{}.", pick(TENSE, rng)),
            Tone::Defensive => format!("{}.", pick(DEFENSIVE, rng)),
            Tone::Withdrawn => pick(WITHDRAWN, rng).to_string(),
        }
    }
}

#[async_trait]
impl DialogueBackend for ScriptedBackend {
    async fn generate_utterance(&self, request: UtteranceRequest<'_>) -> Result<String, GenerationError> {
        let mut rng = ChaCha8Rng::seed_from_u64(request.seed);
        let noise = rng.gen_range(-DISTRESS_NOISE..=DISTRESS_NOISE);
        let tone = Tone::from_distress(Self::distress(&request, noise));
        Ok(Self::compose(&request, tone, &mut rng))
    }
}

/// Strongest shock in force at `turn`, decayed by the speaker's repair rate.
fn crisis_impact(crisis: &CrisisEvent, profile: &ShadowVectorProfile, turn: u32) -> f64 {
    if crisis.active_severity(turn).is_none() {
        return 0.0;
    }
    let entropy = profile.entropy_tolerance;
    let secure_bonus = if profile.attachment_style == AttachmentStyle::Secure {
        0.08
    } else {
        0.0
    };
    let repair = 0.04 + 0.3 * entropy + secure_bonus;

    std::iter::once((crisis.axis, crisis.severity, crisis.turn))
        .chain(crisis.aftershocks.iter().map(|shock| (shock.axis, shock.severity, shock.turn)))
        .filter(|(_, _, onset)| *onset <= turn)
        .map(|(axis, severity, onset)| {
            let elapsed = f64::from(turn - onset);
            severity * (1.0 - entropy) * (0.6 + 0.8 * profile.value(axis)) * (-repair * elapsed).exp()
        })
        .fold(0.0, f64::max)
}

/// The partner's last utterance after its final comma: usually their signature phrase.
fn partner_tail(request: &UtteranceRequest<'_>) -> Option<String> {
    let partner = request.speaker.other();
    let last = request
        .transcript
        .iter()
        .rev()
        .find(|entry| entry.speaker == partner)?;
    let (_, tail) = last.content.rsplit_once(", ")?;
    let tail = tail.trim_end_matches('.').trim();
    (!tail.is_empty()).then(|| tail.to_string())
}
