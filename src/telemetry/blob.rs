// ================================================================================================
// Telemetry Blob Model
// ================================================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{IoError, WorldlineResult},
    evidence::canonical,
    types::RunId,
};

pub const TELEMETRY_VERSION: &str = "1";
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Recognized coordinate aliases, checked in order.
pub const X_ALIASES: [&str; 5] = ["x", "position_x", "pos_x", "coord_x", "loc_x"];
pub const Y_ALIASES: [&str; 5] = ["y", "position_y", "pos_y", "coord_y", "loc_y"];
pub const Z_ALIASES: [&str; 5] = ["z", "position_z", "pos_z", "coord_z", "loc_z"];

pub type AgentState = BTreeMap<String, Value>;
pub type AgentStates = BTreeMap<String, AgentState>;

/// Full snapshot at a tick: every agent's state, the environment, and metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keyframe {
    pub tick: u32,
    pub agent_states: AgentStates,
    pub environment_state: Value,
    pub metrics: BTreeMap<String, f64>,
}

/// Change set at a tick: per-agent changed fields, events, and updated metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub tick: u32,
    pub agent_updates: AgentStates,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events_triggered: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventIndexEntry {
    pub tick: u32,
    pub events: Vec<String>,
}

/// Lookup structures for replay and queries.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TelemetryIndex {
    /// Sorted ascending.
    pub keyframe_ticks: Vec<u32>,
    /// Only ticks with at least one event, sorted ascending.
    pub event_index: Vec<EventIndexEntry>,
    pub metric_keys: Vec<String>,
    pub agent_ids: Vec<String>,
}

/// Auto-detected content capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    pub has_spatial: bool,
    pub has_events: bool,
    pub has_metrics: bool,
}

/// Canonical per-run telemetry. Content-addressed and write-once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBlob {
    pub version: String,
    pub schema_version: String,
    pub run_id: RunId,
    pub seed_used: u64,
    pub agent_count: usize,
    pub ticks_executed: u32,
    pub keyframes: Vec<Keyframe>,
    pub deltas: Vec<Delta>,
    pub final_states: AgentStates,
    pub index: TelemetryIndex,
    pub metrics_summary: BTreeMap<String, f64>,
    pub capabilities: Capabilities,
}

/// The coarse structural summary that `telemetry_hash` covers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub keyframe_count: usize,
    pub delta_count: usize,
    pub total_events: usize,
    pub tick_count: u32,
    pub agent_count: usize,
}

impl TelemetryBlob {
    pub fn summary(&self) -> TelemetrySummary {
        TelemetrySummary {
            keyframe_count: self.keyframes.len(),
            delta_count: self.deltas.len(),
            total_events: self
                .deltas
                .iter()
                .map(|d| d.events_triggered.len())
                .sum(),
            tick_count: self.ticks_executed,
            agent_count: self.agent_count,
        }
    }

    /// Canonical serialization: sorted keys, compact separators. These are the bytes
    /// that get content-hashed and stored.
    pub fn canonical_bytes(&self) -> WorldlineResult<Vec<u8>> {
        let value = serde_json::to_value(self).map_err(IoError::Json)?;
        Ok(canonical::canonical_bytes(&value))
    }

    /// Canonical bytes with the run id zeroed. Two runs under the same config, seed,
    /// and scheduler profile serialize identical body bytes even though each run has
    /// a fresh identifier.
    pub fn canonical_body_bytes(&self) -> WorldlineResult<Vec<u8>> {
        let mut value = serde_json::to_value(self).map_err(IoError::Json)?;
        if let Some(object) = value.as_object_mut() {
            object.insert("run_id".to_string(), Value::Null);
        }
        Ok(canonical::canonical_bytes(&value))
    }

    pub fn from_bytes(bytes: &[u8]) -> WorldlineResult<Self> {
        Ok(serde_json::from_slice(bytes).map_err(IoError::Json)?)
    }
}

// ================================================================================================
// Capability Detection
// ================================================================================================

fn numeric_alias(state: &AgentState, aliases: &[&str]) -> Option<f64> {
    for alias in aliases {
        if let Some(value) = state.get(*alias).and_then(Value::as_f64) {
            return Some(value);
        }
        if let Some(nested) = state.get("variables").and_then(Value::as_object) {
            if let Some(value) = nested.get(*alias).and_then(Value::as_f64) {
                return Some(value);
            }
        }
    }
    None
}

fn string_field(state: &AgentState, key: &str) -> Option<String> {
    state
        .get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .or_else(|| {
            state
                .get("variables")
                .and_then(Value::as_object)
                .and_then(|nested| nested.get(key))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
}

/// True when the state carries normalizable coordinates: an X and a Y alias with
/// numeric values (top-level or nested under `variables`), or a `grid_cell` /
/// `location_id` fallback.
pub fn has_spatial_fields(state: &AgentState) -> bool {
    let has_xy = numeric_alias(state, &X_ALIASES).is_some()
        && numeric_alias(state, &Y_ALIASES).is_some();
    has_xy || string_field(state, "grid_cell").is_some() || string_field(state, "location_id").is_some()
}

/// Normalized agent position extracted from a state map.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentPosition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid_cell: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location_id: Option<String>,
}

impl AgentPosition {
    pub fn extract(state: &AgentState) -> Self {
        let x = numeric_alias(state, &X_ALIASES);
        let y = numeric_alias(state, &Y_ALIASES);
        let z = numeric_alias(state, &Z_ALIASES);
        if x.is_some() && y.is_some() {
            return Self {
                x,
                y,
                z,
                grid_cell: None,
                location_id: None,
            };
        }
        Self {
            x: None,
            y: None,
            z: None,
            grid_cell: string_field(state, "grid_cell"),
            location_id: string_field(state, "location_id"),
        }
    }
}

/// Scan keyframes and deltas for spatial fields, events, and metrics.
pub fn detect_capabilities(
    keyframes: &[Keyframe],
    deltas: &[Delta],
) -> Capabilities {
    let has_spatial = keyframes
        .iter()
        .flat_map(|kf| kf.agent_states.values())
        .chain(deltas.iter().flat_map(|d| d.agent_updates.values()))
        .any(has_spatial_fields);
    let has_events = deltas.iter().any(|d| !d.events_triggered.is_empty());
    let has_metrics = keyframes.iter().any(|kf| !kf.metrics.is_empty())
        || deltas.iter().any(|d| !d.metrics.is_empty());
    Capabilities {
        has_spatial,
        has_events,
        has_metrics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn state(pairs: &[(&str, Value)]) -> AgentState {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn spatial_detection_requires_both_axes() {
        assert!(has_spatial_fields(&state(&[("x", json!(0.0)), ("y", json!(1.0))])));
        assert!(has_spatial_fields(&state(&[
            ("position_x", json!(2.0)),
            ("position_y", json!(3.0)),
        ])));
        assert!(!has_spatial_fields(&state(&[("x", json!(0.0))])));
        assert!(!has_spatial_fields(&state(&[("y", json!(0.0))])));
    }

    #[test]
    fn spatial_detection_scans_nested_variables() {
        let nested = state(&[(
            "variables",
            json!({"pos_x": 100.0, "pos_y": 200.0}),
        )]);
        assert!(has_spatial_fields(&nested));
    }

    #[test]
    fn non_numeric_coordinates_are_ignored() {
        let mixed = state(&[("x", json!("not a number")), ("pos_x", json!(5.0))]);
        // X resolves via the pos_x alias but there is still no Y.
        assert!(!has_spatial_fields(&mixed));
    }

    #[test]
    fn grid_cell_and_location_id_are_fallbacks() {
        assert!(has_spatial_fields(&state(&[("grid_cell", json!("A1"))])));
        let pos = AgentPosition::extract(&state(&[("grid_cell", json!("A1"))]));
        assert_eq!(pos.grid_cell.as_deref(), Some("A1"));
        assert!(pos.x.is_none());

        let pos = AgentPosition::extract(&state(&[("location_id", json!("zone_1"))]));
        assert_eq!(pos.location_id.as_deref(), Some("zone_1"));
    }

    #[test]
    fn position_extraction_mixes_alias_patterns() {
        let pos = AgentPosition::extract(&state(&[
            ("pos_x", json!(100.0)),
            ("coord_y", json!(200.0)),
        ]));
        assert_eq!(pos.x, Some(100.0));
        assert_eq!(pos.y, Some(200.0));
        assert!(pos.grid_cell.is_none());
    }

    #[test]
    fn capabilities_scan_keyframes_and_deltas() {
        let keyframes = vec![Keyframe {
            tick: 0,
            agent_states: [("agent-00000".to_string(), state(&[("engagement", json!(0.5))]))]
                .into_iter()
                .collect(),
            environment_state: json!({}),
            metrics: [("commitment_rate".to_string(), 0.0)].into_iter().collect(),
        }];
        let deltas = vec![Delta {
            tick: 1,
            agent_updates: AgentStates::new(),
            events_triggered: vec!["shock".to_string()],
            metrics: BTreeMap::new(),
        }];
        let caps = detect_capabilities(&keyframes, &deltas);
        assert!(!caps.has_spatial);
        assert!(caps.has_events);
        assert!(caps.has_metrics);
    }

    #[test]
    fn canonical_body_ignores_run_id() {
        let blob = |run_id: RunId| TelemetryBlob {
            version: TELEMETRY_VERSION.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            run_id,
            seed_used: 7,
            agent_count: 1,
            ticks_executed: 0,
            keyframes: Vec::new(),
            deltas: Vec::new(),
            final_states: AgentStates::new(),
            index: TelemetryIndex::default(),
            metrics_summary: BTreeMap::new(),
            capabilities: Capabilities::default(),
        };
        let a = blob(RunId::new());
        let b = blob(RunId::new());
        assert_ne!(a.canonical_bytes().unwrap(), b.canonical_bytes().unwrap());
        assert_eq!(
            a.canonical_body_bytes().unwrap(),
            b.canonical_body_bytes().unwrap()
        );
    }
}
