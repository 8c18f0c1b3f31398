//! Surface features of utterances: marker counts, terseness, and withdrawal trends.
//!
//! Everything here is lexical. Phrase markers are matched on word boundaries over
//! a normalized form of the utterance (lowercase, punctuation stripped apart from
//! apostrophes).

use std::collections::BTreeSet;

const DEFENSIVE_MARKERS: &[&str] = &[
    "you always",
    "you never",
    "you just want to",
    "typical of you",
    "your fault",
    "because of you",
    "not my fault",
    "you made me",
];

const DEFLECTION_MARKERS: &[&str] = &[
    "whatever",
    "fine",
    "i don't know",
    "never mind",
    "forget it",
    "doesn't matter",
    "not now",
    "i'm busy",
];

const HEDGE_MARKERS: &[&str] = &["maybe", "perhaps", "i guess", "not sure", "kind of", "probably", "might"];

const ABSOLUTE_MARKERS: &[&str] = &["always", "never", "definitely", "certainly", "obviously", "clearly"];

const STRESS_MARKERS: &[&str] = &[
    "scared",
    "worried",
    "afraid",
    "panic",
    "stressed",
    "hurt",
    "angry",
    "overwhelmed",
    "can't",
    "alone",
    "lost",
];

const WARMTH_MARKERS: &[&str] = &["love", "thank", "appreciate", "care", "glad", "miss you", "sorry", "proud of you"];

const INTENT_MARKERS: &[&str] = &[
    "i want us",
    "let's",
    "we can",
    "we will",
    "we'll",
    "i'm here",
    "with you",
    "work through",
    "figure it out",
];

/// Relationship-identity tokens; their presence marks a future-oriented statement.
pub const NARRATIVE_MARKERS: &[&str] = &["we", "us", "our", "together", "we'll", "we'd", "let's"];

const TERSE_TOKEN_LIMIT: usize = 4;
const RECENT_SPAN: usize = 2;

/// Lowercase word tokens longer than one character. Apostrophes stay inside words.
pub fn tokenize(text: &str) -> Vec<String> {
    normalize(text)
        .split_whitespace()
        .map(|token| token.trim_matches('\''))
        .filter(|token| token.chars().count() > 1)
        .map(str::to_string)
        .collect()
}

fn normalize(text: &str) -> String {
    let mapped = text
        .chars()
        .map(|ch| match ch {
            '\u{2019}' | '\u{2018}' => '\'',
            ch if ch.is_alphanumeric() || ch == '\'' => ch.to_ascii_lowercase(),
            _ => ' ',
        })
        .collect::<String>();
    let mut normalized = String::with_capacity(mapped.len() + 2);
    normalized.push(' ');
    for word in mapped.split_whitespace() {
        normalized.push_str(word);
        normalized.push(' ');
    }
    normalized
}

fn count_markers(normalized: &str, markers: &[&str]) -> usize {
    markers
        .iter()
        .map(|marker| normalized.matches(&format!(" {marker} ")).count())
        .sum()
}

/// Whether `phrase` occurs in `text` on word boundaries, ignoring case and punctuation.
pub fn contains_phrase(text: &str, phrase: &str) -> bool {
    let needle = normalize(phrase);
    if needle.trim().is_empty() {
        return false;
    }
    normalize(text).contains(&needle)
}

pub fn is_future_oriented(text: &str) -> bool {
    tokenize(text)
        .iter()
        .any(|token| NARRATIVE_MARKERS.contains(&token.as_str()))
}

/// Lexical features of one utterance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtteranceFeatures {
    pub token_count: usize,
    pub distinct_tokens: usize,
    pub defensive_hits: usize,
    pub deflection_hits: usize,
    pub hedge_hits: usize,
    pub absolute_hits: usize,
    pub stress_hits: usize,
    pub warmth_hits: usize,
    pub intent_hits: usize,
    pub future_oriented: bool,
}

impl UtteranceFeatures {
    pub fn extract(text: &str) -> Self {
        let normalized = normalize(text);
        let tokens = tokenize(text);
        let distinct_tokens = tokens.iter().collect::<BTreeSet<_>>().len();
        let future_oriented = tokens
            .iter()
            .any(|token| NARRATIVE_MARKERS.contains(&token.as_str()));

        Self {
            token_count: tokens.len(),
            distinct_tokens,
            defensive_hits: count_markers(&normalized, DEFENSIVE_MARKERS),
            deflection_hits: count_markers(&normalized, DEFLECTION_MARKERS),
            hedge_hits: count_markers(&normalized, HEDGE_MARKERS),
            absolute_hits: count_markers(&normalized, ABSOLUTE_MARKERS),
            stress_hits: count_markers(&normalized, STRESS_MARKERS),
            warmth_hits: count_markers(&normalized, WARMTH_MARKERS),
            intent_hits: count_markers(&normalized, INTENT_MARKERS),
            future_oriented,
        }
    }

    pub fn is_defensive(&self) -> bool {
        self.defensive_hits > 0
    }

    pub fn is_deflecting(&self) -> bool {
        self.deflection_hits > 0
    }

    pub fn is_terse(&self) -> bool {
        self.token_count <= TERSE_TOKEN_LIMIT
    }

    pub fn defensiveness(&self) -> f64 {
        (0.5 * self.defensive_hits as f64 + 0.15 * self.absolute_hits as f64).min(1.0)
    }

    pub fn certainty(&self) -> f64 {
        (0.5 + 0.15 * self.absolute_hits as f64 - 0.15 * self.hedge_hits as f64).clamp(0.0, 1.0)
    }

    pub fn stress(&self) -> f64 {
        (0.25 * self.stress_hits as f64 + 0.2 * self.defensive_hits as f64).min(1.0)
    }

    pub fn warmth(&self) -> f64 {
        let future = if self.future_oriented { 0.2 } else { 0.0 };
        (0.35 * self.warmth_hits as f64 + 0.25 * self.intent_hits as f64 + future).min(1.0)
    }

    /// Stated intent to stay connected.
    pub fn connection_intent(&self) -> f64 {
        let future = if self.future_oriented { 0.25 } else { 0.0 };
        (0.5 * self.intent_hits as f64 + future).min(1.0)
    }
}

fn mean_by<F>(window: &[UtteranceFeatures], value: F) -> f64
where
    F: Fn(&UtteranceFeatures) -> f64,
{
    if window.is_empty() {
        return 0.0;
    }
    window.iter().map(value).sum::<f64>() / window.len() as f64
}

fn share<F>(window: &[UtteranceFeatures], predicate: F) -> f64
where
    F: Fn(&UtteranceFeatures) -> bool,
{
    mean_by(window, |features| if predicate(features) { 1.0 } else { 0.0 })
}

fn split_recent(
    window: &[UtteranceFeatures],
    span: usize,
) -> (&[UtteranceFeatures], &[UtteranceFeatures]) {
    let cut = window.len().saturating_sub(span);
    (&window[..cut], &window[cut..])
}

/// Withdrawal of one speaker from their own baseline, in [0, 1].
///
/// Compares the last two utterances with the earlier ones. Length falling to half
/// the baseline, or vocabulary falling to 60% of it, saturates the score;
/// deflections count directly.
pub fn withdrawal_trend(window: &[UtteranceFeatures]) -> f64 {
    let (baseline, recent) = split_recent(window, RECENT_SPAN);
    let deflection = share(recent, UtteranceFeatures::is_deflecting);
    if baseline.is_empty() || recent.is_empty() {
        return deflection;
    }

    let baseline_len = mean_by(baseline, |f| f.token_count as f64).max(1.0);
    let baseline_vocab = mean_by(baseline, |f| f.distinct_tokens as f64).max(1.0);
    let length_ratio = mean_by(recent, |f| f.token_count as f64) / baseline_len;
    let vocab_ratio = mean_by(recent, |f| f.distinct_tokens as f64) / baseline_vocab;

    let length_term = ((1.0 - length_ratio) / 0.5).clamp(0.0, 1.0);
    let vocab_term = ((1.0 - vocab_ratio) / 0.4).clamp(0.0, 1.0);
    length_term.max(vocab_term).max(deflection)
}

/// Share of the last `span` utterances that attribute blame.
pub fn defensive_frequency(window: &[UtteranceFeatures], span: usize) -> f64 {
    let (_, recent) = split_recent(window, span);
    share(recent, UtteranceFeatures::is_defensive)
}

/// Stand-in for response latency: terseness and deflection in recent turns,
/// plus the shrinkage of recent length against the earlier window.
pub fn latency_proxy(window: &[UtteranceFeatures]) -> f64 {
    let (earlier, recent) = split_recent(window, 3);
    if recent.is_empty() {
        return 0.0;
    }
    let terse = share(recent, |f| f.is_terse() || f.is_deflecting());
    if earlier.is_empty() {
        return terse;
    }

    let ratio = mean_by(recent, |f| f.token_count as f64)
        / mean_by(earlier, |f| f.token_count as f64).max(1.0);
    let shrinkage = if ratio >= 1.0 {
        0.0
    } else if ratio <= 0.2 {
        1.0
    } else {
        (1.0 - ratio) / 0.8
    };
    0.5 * terse + 0.5 * shrinkage
}
