//! Recursive theory-of-mind belief tracking for one agent.
//!
//! A tracker never sees the other agent's internal state. It revises its layers
//! only from utterances: the other party's (observed) and its own (the channel
//! through which the other party forms impressions of it).
//!
//! - L0: the agent's own shadow vector, fixed for the whole timeline
//! - L1: what this agent believes about the other
//! - L2: what this agent believes the other believes about it
//! - L3: what this agent believes the other thinks it thinks of them, only with depth 3
//!
//! L3 is revised from L2 rather than from raw observations: the other party
//! forms its view of our stance from what we say, which L2 already models.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use contracts::{AttachmentStyle, ShadowVectorProfile, MAX_RECURSION_DEPTH};

use crate::error::TrackerError;
use crate::linguistics::{withdrawal_trend, UtteranceFeatures};

const NEUTRAL_PRIOR: f64 = 0.5;
const OBSERVATION_WINDOW: usize = 10;
const L3_RATE_SCALE: f64 = 0.5;

// ---------------------------------------------------------------------------
// BeliefSignal / BeliefLayer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BeliefSignal {
    Withdrawal,
    Defensiveness,
    Certainty,
    Stress,
    Warmth,
}

impl BeliefSignal {
    pub const ALL: [BeliefSignal; 5] = [
        BeliefSignal::Withdrawal,
        BeliefSignal::Defensiveness,
        BeliefSignal::Certainty,
        BeliefSignal::Stress,
        BeliefSignal::Warmth,
    ];

    /// Signals whose expected value mirrors how the other side is treated.
    pub const RECIPROCAL: [BeliefSignal; 3] = [
        BeliefSignal::Withdrawal,
        BeliefSignal::Defensiveness,
        BeliefSignal::Warmth,
    ];

    /// EWMA rate. Volatile states revise fast, trait-like estimates slowly.
    pub fn revision_rate(self) -> f64 {
        match self {
            Self::Withdrawal | Self::Defensiveness => 0.5,
            Self::Stress => 0.35,
            Self::Warmth => 0.3,
            Self::Certainty => 0.15,
        }
    }
}

/// Mapping from every belief signal to a value in [0, 1].
#[derive(Debug, Clone, PartialEq)]
pub struct BeliefLayer {
    values: BTreeMap<BeliefSignal, f64>,
}

impl Default for BeliefLayer {
    fn default() -> Self {
        Self::neutral()
    }
}

impl BeliefLayer {
    pub fn neutral() -> Self {
        Self::uniform(NEUTRAL_PRIOR)
    }

    pub fn uniform(value: f64) -> Self {
        Self {
            values: BeliefSignal::ALL
                .into_iter()
                .map(|signal| (signal, value.clamp(0.0, 1.0)))
                .collect(),
        }
    }

    pub fn get(&self, signal: BeliefSignal) -> f64 {
        self.values.get(&signal).copied().unwrap_or(NEUTRAL_PRIOR)
    }

    pub fn with(mut self, signal: BeliefSignal, value: f64) -> Self {
        self.values.insert(signal, value.clamp(0.0, 1.0));
        self
    }

    /// `(1 - a) * self + a * observed`, with `a` the per-signal rate times `rate_scale`.
    pub fn revise(&self, observed: &BeliefLayer, rate_scale: f64) -> BeliefLayer {
        let values = BeliefSignal::ALL
            .into_iter()
            .map(|signal| {
                let alpha = (signal.revision_rate() * rate_scale).clamp(0.0, 1.0);
                let next = (1.0 - alpha) * self.get(signal) + alpha * observed.get(signal);
                (signal, next.clamp(0.0, 1.0))
            })
            .collect();
        BeliefLayer { values }
    }

    /// Mean absolute difference over `signals`.
    pub fn distance_over(&self, other: &BeliefLayer, signals: &[BeliefSignal]) -> f64 {
        if signals.is_empty() {
            return 0.0;
        }
        signals
            .iter()
            .map(|signal| (self.get(*signal) - other.get(*signal)).abs())
            .sum::<f64>()
            / signals.len() as f64
    }

    pub fn distance(&self, other: &BeliefLayer) -> f64 {
        self.distance_over(other, &BeliefSignal::ALL)
    }

    /// Signal reading of one utterance; `withdrawal` comes from the speaker's trend.
    pub fn from_features(features: &UtteranceFeatures, withdrawal: f64) -> Self {
        Self::neutral()
            .with(BeliefSignal::Withdrawal, withdrawal)
            .with(BeliefSignal::Defensiveness, features.defensiveness())
            .with(BeliefSignal::Certainty, features.certainty())
            .with(BeliefSignal::Stress, features.stress())
            .with(BeliefSignal::Warmth, features.warmth())
    }
}

// ---------------------------------------------------------------------------
// BeliefState
// ---------------------------------------------------------------------------

/// One agent's belief state after a given turn. Immutable once returned.
#[derive(Debug, Clone)]
pub struct BeliefState {
    shadow: Arc<ShadowVectorProfile>,
    turn: Option<u32>,
    pub l1: BeliefLayer,
    pub l2: BeliefLayer,
    pub l3: Option<BeliefLayer>,
    /// L2 prediction error against the other's latest response.
    pub meta_discrepancy: f64,
    /// Gap between the other's stated intent and the prior L1 warmth prediction.
    pub intent_gap: f64,
    observed: VecDeque<UtteranceFeatures>,
    own: VecDeque<UtteranceFeatures>,
}

impl BeliefState {
    pub fn turn(&self) -> Option<u32> {
        self.turn
    }

    /// Features of the other party's recent utterances, oldest first.
    pub fn observed_window(&self) -> Vec<UtteranceFeatures> {
        self.observed.iter().cloned().collect()
    }

    pub fn own_window(&self) -> Vec<UtteranceFeatures> {
        self.own.iter().cloned().collect()
    }

    /// L3 if materialized, else the neutral prior.
    pub fn l3_or_neutral(&self) -> BeliefLayer {
        self.l3.clone().unwrap_or_else(BeliefLayer::neutral)
    }

    /// L0: the agent's own profile. Never revised and never read by the other agent.
    pub fn shadow(&self) -> &ShadowVectorProfile {
        &self.shadow
    }
}

fn push_bounded(window: &mut VecDeque<UtteranceFeatures>, features: UtteranceFeatures) {
    window.push_back(features);
    while window.len() > OBSERVATION_WINDOW {
        window.pop_front();
    }
}

// ---------------------------------------------------------------------------
// TheoryOfMindTracker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct TheoryOfMindTracker {
    shadow: Arc<ShadowVectorProfile>,
    depth: u8,
}

impl TheoryOfMindTracker {
    /// Depth above the hard cap is clamped to it; zero is treated as one.
    pub fn new(shadow: Arc<ShadowVectorProfile>, recursion_depth: u8) -> Self {
        Self {
            shadow,
            depth: recursion_depth.clamp(1, MAX_RECURSION_DEPTH),
        }
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn initial_state(&self) -> BeliefState {
        BeliefState {
            shadow: Arc::clone(&self.shadow),
            turn: None,
            l1: BeliefLayer::neutral(),
            l2: BeliefLayer::neutral(),
            l3: (self.depth >= 3).then(BeliefLayer::neutral),
            meta_discrepancy: 0.0,
            intent_gap: 0.0,
            observed: VecDeque::new(),
            own: VecDeque::new(),
        }
    }

    /// Revise beliefs after `turn`, bottom layer first.
    ///
    /// `observed` is the other party's new utterance, if they spoke this turn;
    /// `own` is this agent's new utterance, if it spoke. Turns must strictly increase.
    pub fn update(
        &self,
        prior: &BeliefState,
        own: Option<&str>,
        observed: Option<&str>,
        turn: u32,
    ) -> Result<BeliefState, TrackerError> {
        if let Some(prior_turn) = prior.turn {
            if turn <= prior_turn {
                return Err(TrackerError::OutOfOrderUpdate {
                    prior: prior_turn,
                    requested: turn,
                });
            }
        }

        let mut next = prior.clone();
        next.turn = Some(turn);

        if let Some(text) = observed {
            let features = UtteranceFeatures::extract(text);
            next.intent_gap = (features.connection_intent() - prior.l1.get(BeliefSignal::Warmth)).abs();
            push_bounded(&mut next.observed, features.clone());

            let withdrawal = withdrawal_trend(next.observed.make_contiguous());
            let reading = self.perceive(BeliefLayer::from_features(&features, withdrawal));

            // The other responds to how they see us; L2 predicted that stance.
            next.meta_discrepancy = prior.l2.distance_over(&reading, &BeliefSignal::RECIPROCAL);
            next.l1 = prior.l1.revise(&reading, 1.0);
        }

        if let Some(text) = own {
            let features = UtteranceFeatures::extract(text);
            push_bounded(&mut next.own, features.clone());
            if self.depth >= 2 {
                let withdrawal = withdrawal_trend(next.own.make_contiguous());
                let impression = BeliefLayer::from_features(&features, withdrawal);
                next.l2 = prior.l2.revise(&impression, 1.0);
            }
        }

        if observed.is_some() || own.is_some() {
            if let Some(l3) = prior.l3.as_ref() {
                next.l3 = Some(l3.revise(&next.l2, L3_RATE_SCALE));
            }
        }

        Ok(next)
    }

    /// Attachment-driven perception bias applied to what this agent observes.
    fn perceive(&self, reading: BeliefLayer) -> BeliefLayer {
        let scale = |layer: BeliefLayer, signal: BeliefSignal, factor: f64| {
            let value = layer.get(signal) * factor;
            layer.with(signal, value)
        };
        match self.shadow.attachment_style {
            AttachmentStyle::Secure => reading,
            AttachmentStyle::Anxious => {
                let reading = scale(reading, BeliefSignal::Withdrawal, 1.25);
                scale(reading, BeliefSignal::Warmth, 0.85)
            }
            AttachmentStyle::Avoidant => scale(reading, BeliefSignal::Defensiveness, 1.2),
            AttachmentStyle::Fearful => {
                let reading = scale(reading, BeliefSignal::Withdrawal, 1.15);
                scale(reading, BeliefSignal::Defensiveness, 1.15)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::sample_pair;

    fn tracker(depth: u8) -> TheoryOfMindTracker {
        let (profile, _) = sample_pair();
        TheoryOfMindTracker::new(Arc::new(profile), depth)
    }

    #[test]
    fn out_of_order_update_is_rejected() {
        let tracker = tracker(2);
        let state = tracker
            .update(&tracker.initial_state(), None, Some("hello there"), 3)
            .expect("first update");
        let err = tracker
            .update(&state, None, Some("again"), 3)
            .expect_err("repeated turn rejected");
        assert_eq!(
            err,
            TrackerError::OutOfOrderUpdate {
                prior: 3,
                requested: 3
            }
        );
    }

    #[test]
    fn earlier_turn_is_rejected_and_prior_state_is_untouched() {
        let tracker = tracker(3);
        let state = tracker
            .update(&tracker.initial_state(), Some("we can fix this"), None, 5)
            .expect("first update");
        let before = state.clone();
        let err = tracker
            .update(&state, None, Some("too late"), 4)
            .expect_err("backwards turn rejected");
        assert_eq!(
            err,
            TrackerError::OutOfOrderUpdate {
                prior: 5,
                requested: 4
            }
        );
        assert_eq!(state.turn(), Some(5));
        assert_eq!(state.l1, before.l1);
        assert_eq!(state.l3, before.l3);

        let next = tracker
            .update(&state, None, Some("okay then"), 6)
            .expect("later turn accepted");
        assert_eq!(next.turn(), Some(6));
    }

    #[test]
    fn recursion_depth_is_clamped_into_range() {
        assert_eq!(tracker(0).depth(), 1);
        assert_eq!(tracker(1).depth(), 1);
        assert_eq!(tracker(3).depth(), MAX_RECURSION_DEPTH);
        assert_eq!(tracker(u8::MAX).depth(), MAX_RECURSION_DEPTH);
        assert!(tracker(0).initial_state().l3.is_none());
        assert!(tracker(u8::MAX).initial_state().l3.is_some());
    }

    #[test]
    fn l1_moves_toward_observed_defensiveness() {
        let tracker = tracker(2);
        let state = tracker
            .update(
                &tracker.initial_state(),
                None,
                Some("You always do this, it's your fault."),
                1,
            )
            .expect("update");
        assert!(state.l1.get(BeliefSignal::Defensiveness) > NEUTRAL_PRIOR);
        assert_eq!(state.l2, BeliefLayer::neutral());
    }

    #[test]
    fn l2_tracks_own_utterances_only() {
        let tracker = tracker(2);
        let state = tracker
            .update(
                &tracker.initial_state(),
                Some("I love that we can plan this together."),
                None,
                1,
            )
            .expect("update");
        assert!(state.l2.get(BeliefSignal::Warmth) > NEUTRAL_PRIOR);
        assert_eq!(state.l1, BeliefLayer::neutral());
    }

    #[test]
    fn l3_is_only_materialized_at_depth_three() {
        assert!(tracker(2).initial_state().l3.is_none());
        assert_eq!(tracker(2).initial_state().l3_or_neutral(), BeliefLayer::neutral());

        let deep = tracker(7);
        assert_eq!(deep.depth(), MAX_RECURSION_DEPTH);
        let state = deep
            .update(&deep.initial_state(), None, Some("Whatever. Not now."), 1)
            .expect("update");
        assert!(state.l3.is_some());
    }

    #[test]
    fn l3_follows_l2_not_the_observed_reading() {
        let deep = tracker(3);
        let hostile = deep
            .update(
                &deep.initial_state(),
                None,
                Some("You always do this, it's your fault."),
                1,
            )
            .expect("observed update");
        assert!(hostile.l1.get(BeliefSignal::Defensiveness) > NEUTRAL_PRIOR);
        assert_eq!(hostile.l2, BeliefLayer::neutral());
        let quiet = hostile.l3.clone().expect("l3 present");
        assert!((quiet.get(BeliefSignal::Defensiveness) - NEUTRAL_PRIOR).abs() < 1e-9);

        let warm = deep
            .update(
                &hostile,
                Some("I love that we can plan this together."),
                None,
                2,
            )
            .expect("own update");
        let l3 = warm.l3.expect("l3 present");
        let expected = quiet.revise(&warm.l2, L3_RATE_SCALE);
        assert_eq!(l3, expected);
        assert!(l3.get(BeliefSignal::Warmth) > NEUTRAL_PRIOR);
        assert!(l3.get(BeliefSignal::Warmth) < warm.l2.get(BeliefSignal::Warmth));
    }

    #[test]
    fn depth_one_holds_l2_neutral() {
        let shallow = tracker(1);
        let state = shallow
            .update(&shallow.initial_state(), Some("You never listen."), None, 1)
            .expect("update");
        assert_eq!(state.l2, BeliefLayer::neutral());
    }

    #[test]
    fn anxious_observer_amplifies_withdrawal() {
        let (anxious, mut secure) = sample_pair();
        secure.attachment_style = AttachmentStyle::Secure;
        let anxious_tracker = TheoryOfMindTracker::new(Arc::new(anxious), 2);
        let secure_tracker = TheoryOfMindTracker::new(Arc::new(secure), 2);

        let script = [
            "I had such a long day at work and honestly I want to tell you everything about it",
            "The meeting ran late and then the train was packed but I made it home fine",
            "Okay.",
            "Not now.",
        ];
        let run = |tracker: &TheoryOfMindTracker| {
            let mut state = tracker.initial_state();
            for (turn, line) in script.iter().enumerate() {
                state = tracker
                    .update(&state, None, Some(line), turn as u32 + 1)
                    .expect("update");
            }
            state.l1.get(BeliefSignal::Withdrawal)
        };

        assert!(run(&anxious_tracker) > run(&secure_tracker));
    }

    #[test]
    fn meta_discrepancy_reflects_unexpected_response() {
        let tracker = tracker(2);
        let warm = tracker
            .update(
                &tracker.initial_state(),
                Some("I love you, let's work through it together."),
                None,
                1,
            )
            .expect("own update");
        let answered = tracker
            .update(&warm, None, Some("You always twist everything, whatever."), 2)
            .expect("observed update");
        assert!(answered.meta_discrepancy > 0.2);
    }

    #[test]
    fn layer_revision_respects_signal_rates() {
        let revised = BeliefLayer::neutral().revise(&BeliefLayer::uniform(1.0), 1.0);
        assert!((revised.get(BeliefSignal::Withdrawal) - 0.75).abs() < 1e-9);
        assert!((revised.get(BeliefSignal::Certainty) - 0.575).abs() < 1e-9);
    }
}
