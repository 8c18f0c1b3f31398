//! Profile preconditions, fear-to-axis mapping, and shared-vulnerability scoring.

use std::collections::{BTreeMap, BTreeSet};

use contracts::{
    AttachmentStyle, CommunicationStyle, ShadowVectorProfile, Speaker, VulnerabilityAxis,
};

use crate::error::ProfileError;

const SHARED_FEAR_BOOST: f64 = 1.4;
const SHARED_TOP_AXES: usize = 3;

/// Axis a named fear puts under pressure.
pub fn fear_axis(fear: &str) -> Option<VulnerabilityAxis> {
    let axis = match fear.trim().to_ascii_lowercase().as_str() {
        "abandonment" | "isolation" => VulnerabilityAxis::Belonging,
        "failure" | "inadequacy" => VulnerabilityAxis::Achievement,
        "engulfment" => VulnerabilityAxis::Autonomy,
        "rejection" | "betrayal" => VulnerabilityAxis::Intimacy,
        "loss" | "vulnerability" => VulnerabilityAxis::Security,
        "instability" => VulnerabilityAxis::Stability,
        "powerlessness" | "irrelevance" => VulnerabilityAxis::Power,
        _ => return None,
    };
    Some(axis)
}

pub fn validate_profile(profile: &ShadowVectorProfile, party: Speaker) -> Result<(), ProfileError> {
    let incomplete = |reason: String| ProfileError::ProfileIncomplete { party, reason };

    if profile.profile_id.trim().is_empty() {
        return Err(incomplete("profile_id is empty".to_string()));
    }

    for axis in VulnerabilityAxis::ALL {
        let Some(weight) = profile.values.get(&axis) else {
            return Err(incomplete(format!("missing value weight for {axis}")));
        };
        if !unit(*weight) {
            return Err(incomplete(format!("value weight for {axis} outside [0, 1]: {weight}")));
        }
    }

    if !unit(profile.entropy_tolerance) {
        return Err(incomplete(format!(
            "entropy_tolerance outside [0, 1]: {}",
            profile.entropy_tolerance
        )));
    }

    let CommunicationStyle {
        directness,
        expressiveness,
    } = profile.communication_style;
    if !unit(directness) || !unit(expressiveness) {
        return Err(incomplete(format!(
            "communication_style outside [0, 1]: ({directness}, {expressiveness})"
        )));
    }

    if let Some(unknown) = profile.fears.iter().find(|fear| fear_axis(fear).is_none()) {
        return Err(incomplete(format!("fear `{unknown}` does not map to a vulnerability axis")));
    }

    Ok(())
}

pub fn validate_pair(
    profile_a: &ShadowVectorProfile,
    profile_b: &ShadowVectorProfile,
) -> Result<(), ProfileError> {
    validate_profile(profile_a, Speaker::AgentA)?;
    validate_profile(profile_b, Speaker::AgentB)
}

fn unit(value: f64) -> bool {
    value.is_finite() && (0.0..=1.0).contains(&value)
}

/// Axes reached by fears both parties hold.
pub fn shared_fear_axes(
    profile_a: &ShadowVectorProfile,
    profile_b: &ShadowVectorProfile,
) -> BTreeSet<VulnerabilityAxis> {
    let axes_of = |profile: &ShadowVectorProfile| {
        profile
            .fears
            .iter()
            .filter_map(|fear| fear_axis(fear))
            .collect::<BTreeSet<_>>()
    };
    axes_of(profile_a)
        .intersection(&axes_of(profile_b))
        .copied()
        .collect()
}

/// Joint vulnerability per axis.
///
/// Starts from the product of both value weights, boosts axes both parties fear,
/// and applies attachment-pairing multipliers:
/// - both anxious: intimacy and belonging
/// - both avoidant: autonomy
/// - anxious with avoidant: intimacy (pursue/withdraw loop)
pub fn shared_vulnerability(
    profile_a: &ShadowVectorProfile,
    profile_b: &ShadowVectorProfile,
) -> BTreeMap<VulnerabilityAxis, f64> {
    let shared_fears = shared_fear_axes(profile_a, profile_b);
    let mut scores = VulnerabilityAxis::ALL
        .into_iter()
        .map(|axis| {
            let mut score = profile_a.value(axis) * profile_b.value(axis);
            if shared_fears.contains(&axis) {
                score *= SHARED_FEAR_BOOST;
            }
            (axis, score)
        })
        .collect::<BTreeMap<_, _>>();

    let mut boost = |axis: VulnerabilityAxis, factor: f64| {
        if let Some(score) = scores.get_mut(&axis) {
            *score *= factor;
        }
    };

    use AttachmentStyle::{Anxious, Avoidant};
    match (profile_a.attachment_style, profile_b.attachment_style) {
        (Anxious, Anxious) => {
            boost(VulnerabilityAxis::Intimacy, 1.3);
            boost(VulnerabilityAxis::Belonging, 1.3);
        }
        (Avoidant, Avoidant) => boost(VulnerabilityAxis::Autonomy, 1.3),
        (Anxious, Avoidant) | (Avoidant, Anxious) => boost(VulnerabilityAxis::Intimacy, 1.6),
        _ => {}
    }

    scores
}

/// Axes in both parties' exposure sets (top-weighted values plus feared axes),
/// ordered by joint vulnerability.
pub fn shared_top_axes(
    profile_a: &ShadowVectorProfile,
    profile_b: &ShadowVectorProfile,
) -> Vec<(VulnerabilityAxis, f64)> {
    let exposure_a = exposure_set(profile_a);
    let exposure_b = exposure_set(profile_b);

    let mut shared = shared_vulnerability(profile_a, profile_b)
        .into_iter()
        .filter(|(axis, _)| exposure_a.contains(axis) && exposure_b.contains(axis))
        .collect::<Vec<_>>();
    shared.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));
    shared
}

fn exposure_set(profile: &ShadowVectorProfile) -> BTreeSet<VulnerabilityAxis> {
    profile
        .top_axes(SHARED_TOP_AXES)
        .into_iter()
        .chain(profile.fears.iter().filter_map(|fear| fear_axis(fear)))
        .collect()
}

pub fn secure_count(profile_a: &ShadowVectorProfile, profile_b: &ShadowVectorProfile) -> usize {
    [profile_a, profile_b]
        .iter()
        .filter(|profile| profile.attachment_style == AttachmentStyle::Secure)
        .count()
}

/// Bundled demonstration pair: an anxious and an avoidant party.
pub fn sample_pair() -> (ShadowVectorProfile, ShadowVectorProfile) {
    let weights = |pairs: [(VulnerabilityAxis, f64); 8]| -> BTreeMap<VulnerabilityAxis, f64> {
        pairs.into_iter().collect()
    };

    let agent_a = ShadowVectorProfile {
        profile_id: "sample_agent_a".to_string(),
        values: weights([
            (VulnerabilityAxis::Autonomy, 0.45),
            (VulnerabilityAxis::Security, 0.70),
            (VulnerabilityAxis::Achievement, 0.65),
            (VulnerabilityAxis::Intimacy, 0.92),
            (VulnerabilityAxis::Novelty, 0.40),
            (VulnerabilityAxis::Stability, 0.60),
            (VulnerabilityAxis::Power, 0.25),
            (VulnerabilityAxis::Belonging, 0.85),
        ]),
        attachment_style: AttachmentStyle::Anxious,
        fears: vec!["abandonment".to_string(), "failure".to_string()],
        linguistic_signature: vec![
            "sorted scene".to_string(),
            "it's a vibe".to_string(),
            "full filmy".to_string(),
        ],
        entropy_tolerance: 0.4,
        communication_style: CommunicationStyle {
            directness: 0.45,
            expressiveness: 0.85,
        },
    };

    let agent_b = ShadowVectorProfile {
        profile_id: "sample_agent_b".to_string(),
        values: weights([
            (VulnerabilityAxis::Autonomy, 0.90),
            (VulnerabilityAxis::Security, 0.55),
            (VulnerabilityAxis::Achievement, 0.80),
            (VulnerabilityAxis::Intimacy, 0.70),
            (VulnerabilityAxis::Novelty, 0.75),
            (VulnerabilityAxis::Stability, 0.35),
            (VulnerabilityAxis::Power, 0.50),
            (VulnerabilityAxis::Belonging, 0.40),
        ]),
        attachment_style: AttachmentStyle::Avoidant,
        fears: vec!["engulfment".to_string(), "vulnerability".to_string()],
        linguistic_signature: vec![
            "pakka".to_string(),
            "bindaas".to_string(),
            "ekdum solid".to_string(),
        ],
        entropy_tolerance: 0.6,
        communication_style: CommunicationStyle {
            directness: 0.80,
            expressiveness: 0.30,
        },
    };

    (agent_a, agent_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_pair_is_valid() {
        let (a, b) = sample_pair();
        assert_eq!(validate_pair(&a, &b), Ok(()));
    }

    #[test]
    fn missing_axis_is_incomplete() {
        let (mut a, _) = sample_pair();
        a.values.remove(&VulnerabilityAxis::Power);
        let err = validate_profile(&a, Speaker::AgentA).expect_err("missing axis rejected");
        assert!(err.to_string().contains("power"));
    }

    #[test]
    fn out_of_range_entropy_is_incomplete() {
        let (_, mut b) = sample_pair();
        b.entropy_tolerance = 1.2;
        let err = validate_pair(&sample_pair().0, &b).expect_err("entropy rejected");
        assert!(matches!(
            err,
            ProfileError::ProfileIncomplete {
                party: Speaker::AgentB,
                ..
            }
        ));
    }

    #[test]
    fn unknown_fear_is_incomplete() {
        let (mut a, _) = sample_pair();
        a.fears.push("spiders".to_string());
        assert!(validate_profile(&a, Speaker::AgentA).is_err());
    }

    #[test]
    fn no_fear_reaches_the_novelty_axis() {
        for fear in [
            "abandonment", "isolation", "failure", "inadequacy", "engulfment", "rejection",
            "betrayal", "loss", "vulnerability", "instability", "powerlessness", "irrelevance",
        ] {
            let axis = fear_axis(fear).expect("known fear");
            assert_ne!(axis, VulnerabilityAxis::Novelty, "{fear}");
        }
        assert_eq!(fear_axis("stagnation"), None);
        assert_eq!(fear_axis("boredom"), None);
        assert_eq!(fear_axis("  Betrayal "), Some(VulnerabilityAxis::Intimacy));
    }

    #[test]
    fn anxious_avoidant_pairing_amplifies_intimacy() {
        let (a, b) = sample_pair();
        let scores = shared_vulnerability(&a, &b);
        let raw = a.value(VulnerabilityAxis::Intimacy) * b.value(VulnerabilityAxis::Intimacy);
        assert!((scores[&VulnerabilityAxis::Intimacy] - raw * 1.6).abs() < 1e-9);
    }

    #[test]
    fn shared_fears_boost_their_axis() {
        let (mut a, mut b) = sample_pair();
        a.attachment_style = AttachmentStyle::Secure;
        b.attachment_style = AttachmentStyle::Secure;
        a.fears = vec!["loss".to_string()];
        b.fears = vec!["vulnerability".to_string()];
        let scores = shared_vulnerability(&a, &b);
        let raw = a.value(VulnerabilityAxis::Security) * b.value(VulnerabilityAxis::Security);
        assert!((scores[&VulnerabilityAxis::Security] - raw * 1.4).abs() < 1e-9);
    }

    #[test]
    fn shared_top_axes_intersects_values_and_fears() {
        let (a, b) = sample_pair();
        // A fears failure, B ranks achievement highly; B fears vulnerability, A ranks security highly.
        let axes = shared_top_axes(&a, &b)
            .into_iter()
            .map(|(axis, _)| axis)
            .collect::<Vec<_>>();
        assert_eq!(
            axes,
            vec![VulnerabilityAxis::Achievement, VulnerabilityAxis::Security]
        );
    }

    #[test]
    fn disjoint_profiles_share_nothing() {
        let (mut a, mut b) = sample_pair();
        a.fears.clear();
        b.fears.clear();
        assert!(shared_top_axes(&a, &b).is_empty());
    }
}
