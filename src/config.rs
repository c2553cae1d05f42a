// ================================================================================================
// Process-Level Configuration & Feature Flags
// ================================================================================================

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

/// Product mode gating optional surfaces.
///
/// `Mvp` serves behavioral-economics runs only; `Full` additionally enables the
/// neural-policy path and ensemble tooling.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProductMode {
    #[default]
    Mvp,
    Full,
}

/// Default seed strategy when a run request does not pin one.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SeedStrategy {
    #[default]
    Single,
    Multi,
}

/// Process-wide defaults. Constructed once at startup and passed explicitly to the
/// services that need it; there is no global mutable configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureFlags {
    pub product_mode: ProductMode,

    /// Default temporal isolation level for gateway contexts (1..=3).
    pub default_isolation_level: u8,

    /// Default keyframe cadence for telemetry writers.
    pub default_keyframe_interval: u32,

    pub default_seed_strategy: SeedStrategy,

    /// Fraction of terminated agents above which a run aborts.
    pub agent_fault_tolerance: f64,
}

impl Default for FeatureFlags {
    fn default() -> Self {
        Self {
            product_mode: ProductMode::default(),
            default_isolation_level: 2,
            default_keyframe_interval: 10,
            default_seed_strategy: SeedStrategy::default(),
            agent_fault_tolerance: 0.05,
        }
    }
}

impl FeatureFlags {
    pub fn neural_policy_enabled(&self) -> bool {
        self.product_mode == ProductMode::Full
    }
}
