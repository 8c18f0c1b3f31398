//! Linguistic convergence between the two parties of a timeline.
//!
//! Convergence blends two things. One is static style similarity from the
//! communication-style pairs. The other is evidence from the transcript: signature
//! phrases one party picked up from the other, and overlap in recent vocabulary.
//! The style term dominates early and fades as turns accumulate.
//!
//! Vocabulary overlap ignores signature-phrase tokens, so echoing the other
//! party's phrase can only raise convergence through the adoption term.

use std::collections::BTreeSet;

use contracts::{ShadowVectorProfile, Speaker, TranscriptEntry};
use serde::{Deserialize, Serialize};

use crate::linguistics::{contains_phrase, tokenize};

const OVERLAP_SPAN: usize = 6;
const STYLE_HALF_LIFE_TURNS: f64 = 6.0;
const TREND_SPAN: usize = 3;
const TREND_BAND: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlignmentReading {
    pub convergence: f64,
    /// Transcript-only component, free of the style prior.
    pub evidence: f64,
    pub adopted_phrases: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LinguisticAlignmentScorer;

impl LinguisticAlignmentScorer {
    pub fn score(
        &self,
        transcript: &[TranscriptEntry],
        profile_a: &ShadowVectorProfile,
        profile_b: &ShadowVectorProfile,
    ) -> f64 {
        self.reading(transcript, profile_a, profile_b).convergence
    }

    pub fn reading(
        &self,
        transcript: &[TranscriptEntry],
        profile_a: &ShadowVectorProfile,
        profile_b: &ShadowVectorProfile,
    ) -> AlignmentReading {
        let style_similarity =
            1.0 - profile_a.communication_style.distance(&profile_b.communication_style);
        if transcript.is_empty() {
            return AlignmentReading {
                convergence: style_similarity.clamp(0.0, 1.0),
                evidence: 0.0,
                adopted_phrases: 0,
            };
        }

        let len = transcript.len() as f64;
        let adopted_phrases = adopted_phrase_count(transcript, profile_a, profile_b);
        let adoption = (2.0 * adopted_phrases as f64 / len).min(1.0);
        let signature_tokens = profile_a
            .linguistic_signature
            .iter()
            .chain(&profile_b.linguistic_signature)
            .flat_map(|phrase| tokenize(phrase))
            .collect::<BTreeSet<_>>();
        let evidence = 0.6 * adoption + 0.4 * recent_overlap(transcript, &signature_tokens);

        let style_weight = 1.0 / (1.0 + len / STYLE_HALF_LIFE_TURNS);
        let convergence = style_weight * style_similarity + (1.0 - style_weight) * evidence;

        AlignmentReading {
            convergence: convergence.clamp(0.0, 1.0),
            evidence: evidence.clamp(0.0, 1.0),
            adopted_phrases,
        }
    }
}

/// Number of (utterance, phrase) pairs where a speaker used a signature phrase of
/// the other party after that party had already used it.
pub fn adopted_phrase_count(
    transcript: &[TranscriptEntry],
    profile_a: &ShadowVectorProfile,
    profile_b: &ShadowVectorProfile,
) -> usize {
    let signature_of = |speaker: Speaker| match speaker {
        Speaker::AgentA => &profile_a.linguistic_signature,
        Speaker::AgentB => &profile_b.linguistic_signature,
    };

    transcript
        .iter()
        .enumerate()
        .map(|(position, entry)| {
            let source = entry.speaker.other();
            signature_of(source)
                .iter()
                .filter(|phrase| contains_phrase(&entry.content, phrase))
                .filter(|phrase| {
                    transcript[..position]
                        .iter()
                        .any(|prior| prior.speaker == source && contains_phrase(&prior.content, phrase))
                })
                .count()
        })
        .sum()
}

/// Jaccard overlap of each party's vocabulary over their recent utterances,
/// leaving out `excluded` tokens.
fn recent_overlap(transcript: &[TranscriptEntry], excluded: &BTreeSet<String>) -> f64 {
    let vocabulary = |speaker: Speaker| {
        transcript
            .iter()
            .rev()
            .filter(|entry| entry.speaker == speaker)
            .take(OVERLAP_SPAN)
            .flat_map(|entry| tokenize(&entry.content))
            .filter(|token| !excluded.contains(token))
            .collect::<BTreeSet<_>>()
    };
    let a = vocabulary(Speaker::AgentA);
    let b = vocabulary(Speaker::AgentB);
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceTrend {
    Accelerating,
    Stable,
    Diverging,
}

impl ConvergenceTrend {
    /// Mean of the last three readings against the three before them.
    pub fn from_history(history: &[f64]) -> Self {
        if history.len() < 2 * TREND_SPAN {
            return Self::Stable;
        }
        let mean = |values: &[f64]| values.iter().sum::<f64>() / values.len() as f64;
        let end = history.len();
        let recent = mean(&history[end - TREND_SPAN..]);
        let previous = mean(&history[end - 2 * TREND_SPAN..end - TREND_SPAN]);
        let delta = recent - previous;
        if delta > TREND_BAND {
            Self::Accelerating
        } else if delta < -TREND_BAND {
            Self::Diverging
        } else {
            Self::Stable
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::sample_pair;

    fn entry(speaker: Speaker, content: &str, turn: u32) -> TranscriptEntry {
        TranscriptEntry::new(speaker, content, turn)
    }

    #[test]
    fn adoption_requires_prior_use_by_the_owner() {
        let (a, b) = sample_pair();
        // A says "pakka" before B ever did: not an adoption.
        let transcript = vec![
            entry(Speaker::AgentA, "pakka, we should go", 1),
            entry(Speaker::AgentB, "pakka, sounds good", 2),
            entry(Speaker::AgentA, "pakka then, it's a vibe", 3),
        ];
        assert_eq!(adopted_phrase_count(&transcript, &a, &b), 1);
    }

    #[test]
    fn more_adopted_phrases_never_lower_convergence() {
        let (a, b) = sample_pair();
        let scorer = LinguisticAlignmentScorer;
        let base = vec![
            entry(Speaker::AgentA, "long day, sorted scene though", 1),
            entry(Speaker::AgentB, "ekdum solid, glad it worked", 2),
            entry(Speaker::AgentA, "so tired tonight", 3),
        ];
        let mut adopted = base.clone();
        adopted[2] = entry(Speaker::AgentA, "so tired tonight, ekdum solid", 3);

        let plain = scorer.reading(&base, &a, &b);
        let echoed = scorer.reading(&adopted, &a, &b);
        assert_eq!(plain.adopted_phrases, 0);
        assert_eq!(echoed.adopted_phrases, 1);
        assert!(echoed.convergence >= plain.convergence);
    }

    #[test]
    fn echoed_phrase_outside_the_recent_window_still_raises_convergence() {
        let (mut a, mut b) = sample_pair();
        a.linguistic_signature = vec!["zorblax quimby".to_string()];
        b.linguistic_signature.clear();

        let mut transcript = vec![entry(Speaker::AgentA, "zorblax quimby friend", 1)];
        for turn in 2..=20 {
            let speaker = if turn % 2 == 0 { Speaker::AgentB } else { Speaker::AgentA };
            transcript.push(entry(speaker, "we talk about the plan today", turn));
        }
        let mut echoed = transcript.clone();
        echoed[19] = entry(Speaker::AgentB, "we talk about the plan today zorblax quimby", 20);

        let scorer = LinguisticAlignmentScorer;
        let plain = scorer.reading(&transcript, &a, &b);
        let adopted = scorer.reading(&echoed, &a, &b);
        assert_eq!(plain.adopted_phrases, 0);
        assert_eq!(adopted.adopted_phrases, 1);
        assert!(adopted.evidence > plain.evidence);
        assert!(adopted.convergence > plain.convergence);
    }

    #[test]
    fn trend_bands_are_exclusive_at_the_edges() {
        // A change of exactly 0.05 stays stable in both directions.
        let rising = [0.25, 0.25, 0.25, 0.3, 0.3, 0.3];
        assert_eq!(ConvergenceTrend::from_history(&rising), ConvergenceTrend::Stable);
        let falling = [0.3, 0.3, 0.3, 0.25, 0.25, 0.25];
        assert_eq!(ConvergenceTrend::from_history(&falling), ConvergenceTrend::Stable);

        assert_eq!(
            ConvergenceTrend::from_history(&[0.2, 0.2, 0.2, 0.26, 0.26, 0.26]),
            ConvergenceTrend::Accelerating
        );
        assert_eq!(
            ConvergenceTrend::from_history(&[0.26, 0.26, 0.26, 0.2, 0.2, 0.2]),
            ConvergenceTrend::Diverging
        );
    }

    #[test]
    fn trend_reads_only_the_last_six_readings() {
        let history = [0.0, 0.0, 0.4, 0.4, 0.4, 0.4, 0.4, 0.4];
        assert_eq!(ConvergenceTrend::from_history(&history), ConvergenceTrend::Stable);
        assert_eq!(
            ConvergenceTrend::from_history(&[0.1, 0.1, 0.1, 0.3, 0.3]),
            ConvergenceTrend::Stable
        );
    }

    #[test]
    fn empty_transcript_scores_style_only() {
        let (a, mut b) = sample_pair();
        b.communication_style = a.communication_style;
        let score = LinguisticAlignmentScorer.score(&[], &a, &b);
        assert!((score - 1.0).abs() < 1e-9);
    }

    #[test]
    fn trend_classification_uses_three_turn_means() {
        assert_eq!(
            ConvergenceTrend::from_history(&[0.1, 0.1, 0.1, 0.3, 0.3, 0.3]),
            ConvergenceTrend::Accelerating
        );
        assert_eq!(
            ConvergenceTrend::from_history(&[0.5, 0.5, 0.5, 0.3, 0.3, 0.3]),
            ConvergenceTrend::Diverging
        );
        assert_eq!(
            ConvergenceTrend::from_history(&[0.5, 0.5]),
            ConvergenceTrend::Stable
        );
    }
}
