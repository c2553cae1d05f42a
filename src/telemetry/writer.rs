// ================================================================================================
// Telemetry Writer
// ================================================================================================

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::debug;

use crate::{
    error::{TelemetryError, WorldlineResult},
    telemetry::blob::{
        AgentState, AgentStates, Delta, EventIndexEntry, Keyframe, SCHEMA_VERSION,
        TELEMETRY_VERSION, TelemetryBlob, TelemetryIndex, detect_capabilities,
    },
    types::{RunId, Seed, Tick},
};

/// Single-consumer per-run telemetry writer.
///
/// The writer decides internally whether a record becomes a keyframe or a delta:
/// keyframes at tick 0, every `keyframe_interval` ticks, and (on finalize) at the last
/// recorded tick; everything else a delta holding only the fields that changed.
pub struct TelemetryWriter {
    run_id: RunId,
    seed: Seed,
    keyframe_interval: u32,

    keyframes: Vec<Keyframe>,
    deltas: Vec<Delta>,
    last_snapshot: AgentStates,
    last_environment: Value,
    last_metrics: BTreeMap<String, f64>,
    last_tick: Option<u32>,
    last_was_keyframe: bool,
    finalized: bool,
}

impl TelemetryWriter {
    pub fn new(run_id: RunId, seed: Seed, keyframe_interval: u32) -> Self {
        Self {
            run_id,
            seed,
            keyframe_interval: keyframe_interval.max(1),
            keyframes: Vec::new(),
            deltas: Vec::new(),
            last_snapshot: AgentStates::new(),
            last_environment: Value::Null,
            last_metrics: BTreeMap::new(),
            last_tick: None,
            last_was_keyframe: false,
            finalized: false,
        }
    }

    /// Record one tick. Ticks must be strictly increasing; the first record must be
    /// tick 0 (the initial keyframe precedes every delta).
    pub fn record(
        &mut self,
        tick: Tick,
        agent_states: AgentStates,
        environment_state: Value,
        events_at_tick: Vec<String>,
        metrics_at_tick: BTreeMap<String, f64>,
    ) -> WorldlineResult<()> {
        if self.finalized {
            return Err(TelemetryError::WriterFinalized.into());
        }
        if let Some(last) = self.last_tick {
            if tick.0 <= last {
                return Err(TelemetryError::NonMonotonicTick {
                    tick: tick.0,
                    last,
                }
                .into());
            }
        }

        let is_keyframe = self.last_tick.is_none() || tick.0 % self.keyframe_interval == 0;
        if is_keyframe {
            self.keyframes.push(Keyframe {
                tick: tick.0,
                agent_states: agent_states.clone(),
                environment_state: environment_state.clone(),
                metrics: metrics_at_tick.clone(),
            });
        } else {
            let agent_updates = diff_states(&self.last_snapshot, &agent_states);
            let changed_metrics: BTreeMap<String, f64> = metrics_at_tick
                .iter()
                .filter(|(key, value)| self.last_metrics.get(*key) != Some(value))
                .map(|(key, value)| (key.clone(), *value))
                .collect();
            self.deltas.push(Delta {
                tick: tick.0,
                agent_updates,
                events_triggered: events_at_tick,
                metrics: changed_metrics,
            });
        }

        self.last_snapshot = agent_states;
        self.last_environment = environment_state;
        self.last_metrics = metrics_at_tick;
        self.last_tick = Some(tick.0);
        self.last_was_keyframe = is_keyframe;
        Ok(())
    }

    pub fn keyframe_count(&self) -> usize {
        self.keyframes.len()
    }

    pub fn delta_count(&self) -> usize {
        self.deltas.len()
    }

    /// Close the stream and build the blob. Emits a final keyframe when the last
    /// recorded tick was delta-encoded, builds the index, and detects capabilities.
    pub fn finalize(mut self) -> WorldlineResult<TelemetryBlob> {
        if self.finalized {
            return Err(TelemetryError::WriterFinalized.into());
        }
        self.finalized = true;

        let ticks_executed = self.last_tick.unwrap_or(0);
        if !self.last_was_keyframe && self.last_tick.is_some() {
            self.keyframes.push(Keyframe {
                tick: ticks_executed,
                agent_states: self.last_snapshot.clone(),
                environment_state: self.last_environment.clone(),
                metrics: self.last_metrics.clone(),
            });
        }

        let keyframe_ticks: Vec<u32> = self.keyframes.iter().map(|kf| kf.tick).collect();
        let event_index: Vec<EventIndexEntry> = self
            .deltas
            .iter()
            .filter(|d| !d.events_triggered.is_empty())
            .map(|d| EventIndexEntry {
                tick: d.tick,
                events: d.events_triggered.clone(),
            })
            .collect();
        let metric_keys: Vec<String> = self.last_metrics.keys().cloned().collect();
        let agent_ids: Vec<String> = self.last_snapshot.keys().cloned().collect();
        let agent_count = agent_ids.len();

        let capabilities = detect_capabilities(&self.keyframes, &self.deltas);

        let mut metrics_summary = self.last_metrics.clone();
        metrics_summary.insert(
            "total_events".to_string(),
            self.deltas
                .iter()
                .map(|d| d.events_triggered.len())
                .sum::<usize>() as f64,
        );

        debug!(
            keyframes = self.keyframes.len(),
            deltas = self.deltas.len(),
            ticks = ticks_executed,
            "telemetry finalized"
        );

        Ok(TelemetryBlob {
            version: TELEMETRY_VERSION.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: self.run_id,
            seed_used: self.seed.0,
            agent_count,
            ticks_executed,
            keyframes: self.keyframes,
            deltas: self.deltas,
            final_states: self.last_snapshot,
            index: TelemetryIndex {
                keyframe_ticks,
                event_index,
                metric_keys,
                agent_ids,
            },
            metrics_summary,
            capabilities,
        })
    }
}

/// Per-agent changed fields between two snapshots. Agents whose state is unchanged are
/// omitted entirely.
fn diff_states(previous: &AgentStates, current: &AgentStates) -> AgentStates {
    let mut updates = AgentStates::new();
    for (agent_id, state) in current {
        match previous.get(agent_id) {
            Some(old) => {
                let changed: AgentState = state
                    .iter()
                    .filter(|(key, value)| old.get(*key) != Some(value))
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                if !changed.is_empty() {
                    updates.insert(agent_id.clone(), changed);
                }
            }
            None => {
                updates.insert(agent_id.clone(), state.clone());
            }
        }
    }
    updates
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: f64) -> AgentStates {
        [(
            "agent-00000".to_string(),
            [
                ("engagement".to_string(), json!(value)),
                ("segment".to_string(), json!("urban")),
            ]
            .into_iter()
            .collect(),
        )]
        .into_iter()
        .collect()
    }

    fn writer() -> TelemetryWriter {
        TelemetryWriter::new(RunId::new(), Seed(42), 10)
    }

    #[test]
    fn keyframes_follow_the_interval() {
        let mut w = writer();
        for t in 0..=25u32 {
            w.record(
                Tick(t),
                snapshot(t as f64 / 100.0),
                json!({}),
                Vec::new(),
                BTreeMap::new(),
            )
            .unwrap();
        }
        let blob = w.finalize().unwrap();
        // Keyframes at 0, 10, 20 and a closing keyframe at 25.
        assert_eq!(blob.index.keyframe_ticks, vec![0, 10, 20, 25]);
        assert_eq!(blob.ticks_executed, 25);
        // 26 records, 3 interval keyframes; the closing keyframe duplicates tick 25
        // rather than replacing its delta.
        assert_eq!(blob.deltas.len(), 23);
    }

    #[test]
    fn deltas_hold_only_changed_fields() {
        let mut w = writer();
        w.record(Tick(0), snapshot(0.5), json!({}), Vec::new(), BTreeMap::new())
            .unwrap();
        w.record(Tick(1), snapshot(0.6), json!({}), Vec::new(), BTreeMap::new())
            .unwrap();
        w.record(Tick(2), snapshot(0.6), json!({}), Vec::new(), BTreeMap::new())
            .unwrap();

        let blob = w.finalize().unwrap();
        let first = &blob.deltas[0];
        assert!(first.agent_updates["agent-00000"].contains_key("engagement"));
        assert!(!first.agent_updates["agent-00000"].contains_key("segment"));
        // Unchanged tick carries no agent updates.
        assert!(blob.deltas[1].agent_updates.is_empty());
    }

    #[test]
    fn non_monotonic_ticks_are_rejected() {
        let mut w = writer();
        w.record(Tick(0), snapshot(0.1), json!({}), Vec::new(), BTreeMap::new())
            .unwrap();
        w.record(Tick(3), snapshot(0.2), json!({}), Vec::new(), BTreeMap::new())
            .unwrap();
        let result = w.record(Tick(3), snapshot(0.3), json!({}), Vec::new(), BTreeMap::new());
        assert!(result.is_err());
    }

    #[test]
    fn final_tick_always_has_a_keyframe() {
        let mut w = writer();
        for t in 0..=12u32 {
            w.record(Tick(t), snapshot(t as f64), json!({}), Vec::new(), BTreeMap::new())
                .unwrap();
        }
        let blob = w.finalize().unwrap();
        assert_eq!(*blob.index.keyframe_ticks.last().unwrap(), 12);
        assert_eq!(blob.final_states, snapshot(12.0));
    }

    #[test]
    fn events_land_in_the_index() {
        let mut w = writer();
        w.record(Tick(0), snapshot(0.0), json!({}), Vec::new(), BTreeMap::new())
            .unwrap();
        w.record(
            Tick(1),
            snapshot(0.1),
            json!({}),
            vec!["shock".to_string()],
            BTreeMap::new(),
        )
        .unwrap();
        w.record(Tick(2), snapshot(0.2), json!({}), Vec::new(), BTreeMap::new())
            .unwrap();

        let blob = w.finalize().unwrap();
        assert_eq!(blob.index.event_index.len(), 1);
        assert_eq!(blob.index.event_index[0].tick, 1);
        assert!(blob.capabilities.has_events);
        assert_eq!(blob.summary().total_events, 1);
    }
}
