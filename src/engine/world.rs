// ================================================================================================
// Environment State & World Events
// ================================================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::Tick;

/// Round to six decimals. Snapshots and metrics round before serialization so change
/// detection and canonical hashing operate on stable values.
pub(crate) fn round6(v: f64) -> f64 {
    (v * 1_000_000.0).round() / 1_000_000.0
}

/// A scripted or intervention-driven world event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldEvent {
    pub name: String,
    pub magnitude: f64,
    /// Additive impact per environment variable, scaled by magnitude on application.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variable_impact: BTreeMap<String, f64>,
}

impl WorldEvent {
    pub fn new(name: impl Into<String>, magnitude: f64) -> Self {
        Self {
            name: name.into(),
            magnitude,
            variable_impact: BTreeMap::new(),
        }
    }

    pub fn with_impact(mut self, variable: impl Into<String>, delta: f64) -> Self {
        self.variable_impact.insert(variable.into(), delta);
        self
    }
}

/// Events to inject at a specific tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventScript {
    pub tick: Tick,
    pub events: Vec<WorldEvent>,
}

/// Fully resolved scenario bound to a node: environment variable overrides plus the
/// event scripts scheduled for the run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ScenarioPatch {
    #[serde(default)]
    pub variables: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_scripts: Vec<EventScript>,
}

impl ScenarioPatch {
    pub fn is_empty(&self) -> bool {
        self.variables.is_empty() && self.event_scripts.is_empty()
    }
}

/// Record of an applied event kept on the environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEvent {
    pub name: String,
    pub applied_at: Tick,
}

/// Global environment state at a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentState {
    pub tick: Tick,
    pub variables: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub active_events: Vec<ActiveEvent>,
}

impl Default for EnvironmentState {
    fn default() -> Self {
        let mut variables = BTreeMap::new();
        // Baseline indicator set; scenario patches override or extend it.
        variables.insert("consumer_confidence".to_string(), 0.5);
        variables.insert("information_flow".to_string(), 0.5);
        variables.insert("media_attention".to_string(), 0.5);
        variables.insert("volatility".to_string(), 0.2);
        Self {
            tick: Tick(0),
            variables,
            active_events: Vec::new(),
        }
    }
}

impl EnvironmentState {
    /// Materialize the initial world from a scenario patch: baseline variables with the
    /// patch's overrides applied on top.
    pub fn materialize(patch: &ScenarioPatch) -> Self {
        let mut env = Self::default();
        for (key, value) in &patch.variables {
            env.variables.insert(key.clone(), *value);
        }
        env
    }

    pub fn variable(&self, key: &str) -> f64 {
        self.variables.get(key).copied().unwrap_or(0.0)
    }

    /// Apply an event: add `impact · magnitude` to each named variable and record the
    /// event as active.
    pub fn apply_event(&mut self, event: &WorldEvent) {
        for (variable, impact) in &event.variable_impact {
            let entry = self.variables.entry(variable.clone()).or_insert(0.0);
            *entry += impact * event.magnitude;
        }
        self.active_events.push(ActiveEvent {
            name: event.name.clone(),
            applied_at: self.tick,
        });
    }

    /// Snapshot with rounded values for telemetry.
    pub fn snapshot(&self) -> serde_json::Value {
        let variables: BTreeMap<String, f64> = self
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), round6(*v)))
            .collect();
        serde_json::json!({
            "tick": self.tick.0,
            "variables": variables,
            "active_events": self.active_events.iter().map(|e| e.name.clone()).collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn materialize_applies_patch_over_baseline() {
        let mut patch = ScenarioPatch::default();
        patch.variables.insert("consumer_confidence".to_string(), 0.9);
        patch.variables.insert("engagement".to_string(), 0.2);

        let env = EnvironmentState::materialize(&patch);
        assert!((env.variable("consumer_confidence") - 0.9).abs() < 1e-12);
        assert!((env.variable("engagement") - 0.2).abs() < 1e-12);
        assert!((env.variable("volatility") - 0.2).abs() < 1e-12);
    }

    #[test]
    fn apply_event_scales_impact_by_magnitude() {
        let mut env = EnvironmentState::default();
        let event = WorldEvent::new("market_shock", 2.0).with_impact("volatility", 0.1);
        env.apply_event(&event);
        assert!((env.variable("volatility") - 0.4).abs() < 1e-12);
        assert_eq!(env.active_events.len(), 1);
        assert_eq!(env.active_events[0].name, "market_shock");
    }

    #[test]
    fn snapshot_rounds_variables() {
        let mut env = EnvironmentState::default();
        env.variables.insert("x".to_string(), 0.123456789);
        let snapshot = env.snapshot();
        assert_eq!(snapshot["variables"]["x"], 0.123457);
    }
}
