// ================================================================================================
// Reliability Scoring
// ================================================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::types::RunId;

/// Banding over the composite score: high ≥ 0.8, medium ≥ 0.6, low ≥ 0.4, very_low
/// otherwise.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityLevel {
    High,
    Medium,
    Low,
    VeryLow,
}

impl ReliabilityLevel {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.8 {
            Self::High
        } else if score >= 0.6 {
            Self::Medium
        } else if score >= 0.4 {
            Self::Low
        } else {
            Self::VeryLow
        }
    }
}

/// Component weights. Never assumed constant: the weights used are recorded with every
/// score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityWeights {
    pub calibration: f64,
    pub stability: f64,
    pub data_gap: f64,
    pub drift: f64,
}

impl Default for ReliabilityWeights {
    fn default() -> Self {
        Self {
            calibration: 0.4,
            stability: 0.3,
            data_gap: 0.15,
            drift: 0.15,
        }
    }
}

impl ReliabilityWeights {
    pub fn sum(&self) -> f64 {
        self.calibration + self.stability + self.data_gap + self.drift
    }
}

/// Component values. `None` means the component could not be computed and contributed
/// nothing; its weight was redistributed to the rest.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ReliabilityComponents {
    pub calibration: Option<f64>,
    pub stability: Option<f64>,
    pub data_gap: Option<f64>,
    pub drift: Option<f64>,
}

/// Inputs to the composite.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ReliabilityInputs {
    /// Expected calibration error from the latest calibration job, if any.
    pub calibration_ece: Option<f64>,
    /// Whether the calibration evidence base was sufficient.
    pub calibration_bounded: bool,
    /// Primary-outcome probability per seed. Stability needs at least two.
    pub seed_outcomes: Vec<(u64, f64)>,
    /// Fraction of required data sources unavailable or filtered by the guard.
    pub data_gap_severity: Option<f64>,
    /// Mean relative feature shift against the reference distribution.
    pub average_feature_shift: Option<f64>,
    /// Runs this assessment drew from, recorded in the trace.
    pub run_ids: Vec<RunId>,
}

/// Full computation trace stored for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityTrace {
    pub formula: String,
    /// Weights as configured.
    pub configured_weights: ReliabilityWeights,
    /// Weights after redistribution over the computable components.
    pub effective_weights: ReliabilityWeights,
    pub run_ids: Vec<RunId>,
    pub notes: Vec<String>,
}

/// The composite reliability score with its audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityScore {
    pub score: f64,
    pub level: ReliabilityLevel,
    pub weights: ReliabilityWeights,
    pub components: ReliabilityComponents,
    pub calibration_bounded: bool,
    pub trace: ReliabilityTrace,
    pub computed_at: DateTime<Utc>,
}

/// Variance of a Bernoulli outcome is bounded by 1/4; seed variance normalizes
/// against that bound.
const MAX_BERNOULLI_VARIANCE: f64 = 0.25;

/// Compute the composite:
/// `reliability = w_c·calibration + w_s·stability + w_g·data_gap + w_d·drift`,
/// with weights of missing components redistributed proportionally so Σw = 1 over the
/// computable set.
pub fn compute(inputs: &ReliabilityInputs, weights: ReliabilityWeights) -> ReliabilityScore {
    let mut notes = Vec::new();

    let calibration = inputs
        .calibration_ece
        .map(|ece| (1.0 - ece).clamp(0.0, 1.0));
    if calibration.is_none() {
        notes.push("calibration unavailable; weight redistributed".to_string());
    }

    let stability = if inputs.seed_outcomes.len() >= 2 {
        let values: Vec<f64> = inputs.seed_outcomes.iter().map(|(_, p)| *p).collect();
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        let variance =
            values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / values.len() as f64;
        let normalized = (variance / MAX_BERNOULLI_VARIANCE).min(1.0);
        Some(1.0 - normalized)
    } else {
        notes.push(format!(
            "stability needs 2 seeds, have {}; weight redistributed",
            inputs.seed_outcomes.len()
        ));
        None
    };

    let data_gap = inputs
        .data_gap_severity
        .map(|severity| (1.0 - severity).clamp(0.0, 1.0));
    if data_gap.is_none() {
        notes.push("no data-gap assessment; weight redistributed".to_string());
    }

    let drift = inputs
        .average_feature_shift
        .map(|shift| 1.0 - shift.min(1.0));
    if drift.is_none() {
        notes.push("no drift reference; weight redistributed".to_string());
    }

    let components = ReliabilityComponents {
        calibration,
        stability,
        data_gap,
        drift,
    };

    // Redistribute weights of missing components proportionally.
    let present_weight = [
        (calibration, weights.calibration),
        (stability, weights.stability),
        (data_gap, weights.data_gap),
        (drift, weights.drift),
    ]
    .iter()
    .filter(|(component, _)| component.is_some())
    .map(|(_, w)| w)
    .sum::<f64>();

    let scale = if present_weight > 0.0 {
        weights.sum() / present_weight
    } else {
        0.0
    };
    let effective = ReliabilityWeights {
        calibration: calibration.map_or(0.0, |_| weights.calibration * scale),
        stability: stability.map_or(0.0, |_| weights.stability * scale),
        data_gap: data_gap.map_or(0.0, |_| weights.data_gap * scale),
        drift: drift.map_or(0.0, |_| weights.drift * scale),
    };

    // With no computable component at all, fall back to the neutral prior rather
    // than claiming certainty in either direction.
    let score = if present_weight > 0.0 {
        let weighted = calibration.unwrap_or(0.0) * effective.calibration
            + stability.unwrap_or(0.0) * effective.stability
            + data_gap.unwrap_or(0.0) * effective.data_gap
            + drift.unwrap_or(0.0) * effective.drift;
        weighted.clamp(0.0, 1.0)
    } else {
        notes.push("no components computable; neutral prior applied".to_string());
        0.5
    };

    ReliabilityScore {
        score,
        level: ReliabilityLevel::from_score(score),
        weights,
        components,
        calibration_bounded: inputs.calibration_bounded,
        trace: ReliabilityTrace {
            formula: "w_c*calibration + w_s*stability + w_g*data_gap + w_d*drift"
                .to_string(),
            configured_weights: weights,
            effective_weights: effective,
            run_ids: inputs.run_ids.clone(),
            notes,
        },
        computed_at: Utc::now(),
    }
}
