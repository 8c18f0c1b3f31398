use contracts::{EngineConfig, SeverityDistribution};

use crate::error::ConfigError;

const WEIGHT_TOLERANCE: f64 = 1e-6;

/// Reject configurations no batch can be run against.
pub fn validate_config(config: &EngineConfig) -> Result<(), ConfigError> {
    let weights = config.signal_weights;
    let components = [
        weights.epistemic_divergence,
        weights.linguistic_withdrawal,
        weights.defensive_attribution,
        weights.narrative_incoherence,
        weights.response_latency_proxy,
    ];
    if components.iter().any(|weight| !weight.is_finite() || *weight < 0.0)
        || (weights.total() - 1.0).abs() > WEIGHT_TOLERANCE
    {
        return Err(ConfigError::SignalWeights(weights.total()));
    }

    let thresholds = config.risk_thresholds;
    let ordered = 0.0 < thresholds.moderate
        && thresholds.moderate < thresholds.high
        && thresholds.high < thresholds.critical
        && thresholds.critical <= 1.0;
    if !ordered {
        return Err(ConfigError::RiskThresholds);
    }

    if config.max_turns == 0 {
        return Err(ConfigError::Zero { field: "max_turns" });
    }
    if config.max_concurrency == 0 {
        return Err(ConfigError::Zero {
            field: "max_concurrency",
        });
    }
    if config.max_inflight_generations == 0 {
        return Err(ConfigError::Zero {
            field: "max_inflight_generations",
        });
    }
    if config.collapse_window == 0 {
        return Err(ConfigError::Zero {
            field: "collapse_window",
        });
    }

    for (field, value) in [
        ("max_failure_fraction", config.max_failure_fraction),
        ("voc_scale", config.voc_scale),
        ("crisis_load_weight", config.crisis_load_weight),
    ] {
        if !value.is_finite() || !(0.0..=1.0).contains(&value) {
            return Err(ConfigError::OutOfUnitRange { field, value });
        }
    }

    let (low, high) = config.severity_range;
    if !(low.is_finite() && high.is_finite() && 0.0 <= low && low <= high && high <= 1.0) {
        return Err(ConfigError::SeverityRange);
    }
    let shape_ok = match config.severity_distribution {
        SeverityDistribution::Uniform => true,
        SeverityDistribution::Pareto { alpha } => alpha.is_finite() && alpha > 0.0,
        SeverityDistribution::Beta { alpha, beta } => {
            alpha.is_finite() && beta.is_finite() && alpha > 0.0 && beta > 0.0
        }
    };
    if !shape_ok {
        return Err(ConfigError::SeverityDistribution);
    }

    Ok(())
}
