//! Shadow-vector profile contracts: the latent, read-only description of one party.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum VulnerabilityAxis {
    Autonomy,
    Security,
    Achievement,
    Intimacy,
    Novelty,
    Stability,
    Power,
    Belonging,
}

impl VulnerabilityAxis {
    pub const ALL: [VulnerabilityAxis; 8] = [
        VulnerabilityAxis::Autonomy,
        VulnerabilityAxis::Security,
        VulnerabilityAxis::Achievement,
        VulnerabilityAxis::Intimacy,
        VulnerabilityAxis::Novelty,
        VulnerabilityAxis::Stability,
        VulnerabilityAxis::Power,
        VulnerabilityAxis::Belonging,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Autonomy => "autonomy",
            Self::Security => "security",
            Self::Achievement => "achievement",
            Self::Intimacy => "intimacy",
            Self::Novelty => "novelty",
            Self::Stability => "stability",
            Self::Power => "power",
            Self::Belonging => "belonging",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|axis| axis.as_str() == raw.trim().to_ascii_lowercase())
    }
}

impl fmt::Display for VulnerabilityAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentStyle {
    Secure,
    Anxious,
    Avoidant,
    Fearful,
}

/// Position of a party on the two communication-style dimensions, both in [0, 1].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct CommunicationStyle {
    pub directness: f64,
    pub expressiveness: f64,
}

impl Default for CommunicationStyle {
    fn default() -> Self {
        Self {
            directness: 0.5,
            expressiveness: 0.5,
        }
    }
}

impl CommunicationStyle {
    /// Euclidean distance between two styles, normalized to [0, 1].
    pub fn distance(&self, other: &CommunicationStyle) -> f64 {
        let dx = self.directness - other.directness;
        let de = self.expressiveness - other.expressiveness;
        ((dx * dx + de * de).sqrt() / std::f64::consts::SQRT_2).clamp(0.0, 1.0)
    }
}

/// Immutable latent profile (L0) of one party.
///
/// `values` ranks every vulnerability axis by weight in [0, 1]; `fears` names the
/// fear architecture (for example `abandonment`, `engulfment`), and
/// `linguistic_signature` lists characteristic phrases the party tends to use.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShadowVectorProfile {
    pub profile_id: String,
    pub values: BTreeMap<VulnerabilityAxis, f64>,
    pub attachment_style: AttachmentStyle,
    #[serde(default)]
    pub fears: Vec<String>,
    #[serde(default)]
    pub linguistic_signature: Vec<String>,
    pub entropy_tolerance: f64,
    #[serde(default)]
    pub communication_style: CommunicationStyle,
}

impl ShadowVectorProfile {
    pub fn value(&self, axis: VulnerabilityAxis) -> f64 {
        self.values.get(&axis).copied().unwrap_or(0.0)
    }

    /// Highest-weighted axes, ties broken by axis order.
    pub fn top_axes(&self, count: usize) -> Vec<VulnerabilityAxis> {
        let mut ranked = self
            .values
            .iter()
            .map(|(axis, weight)| (*axis, *weight))
            .collect::<Vec<_>>();
        ranked.sort_by(|left, right| right.1.total_cmp(&left.1).then(left.0.cmp(&right.0)));
        ranked.into_iter().take(count).map(|(axis, _)| axis).collect()
    }
}
