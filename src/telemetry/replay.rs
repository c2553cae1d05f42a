// ================================================================================================
// Deterministic Replay (read-only)
// ================================================================================================
//
// Reconstructs world state at any tick from keyframes + deltas. Never triggers a
// simulation; repeated calls at the same tick return equal states.

use std::collections::BTreeMap;

use futures::Stream;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    error::{TelemetryError, WorldlineResult},
    telemetry::blob::{AgentStates, Delta, Keyframe, TelemetryBlob},
    types::Tick,
};

const DEFAULT_CHUNK_SIZE: u32 = 1000;
/// Playback rate used for duration estimates.
const DEFAULT_TICK_RATE: f64 = 10.0;

/// Complete world state at a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldReplayState {
    pub tick: u32,
    pub agents: AgentStates,
    pub environment: Value,
    /// Events triggered at exactly this tick.
    pub events: Vec<String>,
    pub metrics: BTreeMap<String, f64>,
}

/// A marker on the timeline for navigation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineMarker {
    pub tick: u32,
    pub marker_type: String,
    pub label: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event_types: Vec<String>,
}

/// Navigation metadata for a loaded run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayTimeline {
    pub run_id: String,
    pub total_ticks: u32,
    pub keyframe_ticks: Vec<u32>,
    pub event_markers: Vec<TimelineMarker>,
    pub duration_seconds: f64,
    pub tick_rate: f64,
    pub seed_used: u64,
    pub agent_count: usize,
    pub segment_distribution: BTreeMap<String, usize>,
    pub region_distribution: BTreeMap<String, usize>,
    pub metrics_summary: BTreeMap<String, f64>,
}

/// A slice of keyframes and deltas for streaming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplayChunk {
    pub start_tick: u32,
    pub end_tick: u32,
    pub keyframes: Vec<Keyframe>,
    pub deltas: Vec<Delta>,
}

/// Read-only replay over a loaded telemetry blob with per-tick state caching.
#[derive(Default)]
pub struct ReplayLoader {
    blob: Option<TelemetryBlob>,
    cache: BTreeMap<u32, WorldReplayState>,
}

impl ReplayLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_loaded(&self) -> bool {
        self.blob.is_some()
    }

    /// Load a blob and build the navigation timeline.
    pub fn load(&mut self, blob: TelemetryBlob) -> ReplayTimeline {
        self.cache.clear();

        let event_markers = blob
            .index
            .keyframe_ticks
            .iter()
            .map(|&tick| TimelineMarker {
                tick,
                marker_type: "keyframe".to_string(),
                label: format!("Keyframe {tick}"),
                event_types: Vec::new(),
            })
            .chain(blob.index.event_index.iter().map(|entry| {
                let mut label = entry.events.iter().take(2).join(", ");
                if entry.events.len() > 2 {
                    label.push_str("...");
                }
                TimelineMarker {
                    tick: entry.tick,
                    marker_type: "event".to_string(),
                    label,
                    event_types: entry.events.clone(),
                }
            }))
            .collect::<Vec<_>>();
        let mut event_markers = event_markers;
        event_markers.sort_by_key(|m| (m.tick, m.marker_type.clone()));

        let mut segment_distribution: BTreeMap<String, usize> = BTreeMap::new();
        let mut region_distribution: BTreeMap<String, usize> = BTreeMap::new();
        for state in blob.final_states.values() {
            let segment = state
                .get("segment")
                .and_then(Value::as_str)
                .unwrap_or("default")
                .to_string();
            *segment_distribution.entry(segment).or_default() += 1;
            let region = state
                .get("region")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string();
            *region_distribution.entry(region).or_default() += 1;
        }

        let timeline = ReplayTimeline {
            run_id: blob.run_id.to_string(),
            total_ticks: blob.ticks_executed,
            keyframe_ticks: blob.index.keyframe_ticks.clone(),
            event_markers,
            duration_seconds: blob.ticks_executed as f64 / DEFAULT_TICK_RATE,
            tick_rate: DEFAULT_TICK_RATE,
            seed_used: blob.seed_used,
            agent_count: blob.agent_count,
            segment_distribution,
            region_distribution,
            metrics_summary: blob.metrics_summary.clone(),
        };
        self.blob = Some(blob);
        timeline
    }

    fn loaded(&self) -> WorldlineResult<&TelemetryBlob> {
        self.blob
            .as_ref()
            .ok_or_else(|| TelemetryError::NotLoaded.into())
    }

    /// State at tick T: clone the nearest keyframe K ≤ T, then apply every delta in
    /// (K, T] in tick order. Cached; repeated calls return the same state.
    pub fn get_state_at_tick(&mut self, tick: Tick) -> WorldlineResult<WorldReplayState> {
        {
            let blob = self.loaded()?;
            if tick.0 > blob.ticks_executed {
                return Err(TelemetryError::TickOutOfRange {
                    requested: tick.0,
                    max: blob.ticks_executed,
                }
                .into());
            }
        }
        if let Some(cached) = self.cache.get(&tick.0) {
            return Ok(cached.clone());
        }

        let blob = self.blob.as_ref().expect("checked above");
        let keyframe = blob
            .keyframes
            .iter()
            .filter(|kf| kf.tick <= tick.0)
            .max_by_key(|kf| kf.tick)
            .ok_or_else(|| {
                TelemetryError::CorruptBlob("no keyframe at or before requested tick".to_string())
            })?;

        let mut state = WorldReplayState {
            tick: keyframe.tick,
            agents: keyframe.agent_states.clone(),
            environment: keyframe.environment_state.clone(),
            events: Vec::new(),
            metrics: keyframe.metrics.clone(),
        };

        for delta in blob
            .deltas
            .iter()
            .filter(|d| d.tick > keyframe.tick && d.tick <= tick.0)
        {
            apply_delta(&mut state, delta);
        }
        state.tick = tick.0;

        self.cache.insert(tick.0, state.clone());
        Ok(state)
    }

    /// Keyframes ∪ deltas with ticks in `[start, end]`.
    pub fn get_chunk(&self, start: Tick, end: Option<Tick>) -> WorldlineResult<ReplayChunk> {
        let blob = self.loaded()?;
        let end = end
            .map(|t| t.0)
            .unwrap_or(start.0 + DEFAULT_CHUNK_SIZE)
            .min(blob.ticks_executed);
        Ok(ReplayChunk {
            start_tick: start.0,
            end_tick: end,
            keyframes: blob
                .keyframes
                .iter()
                .filter(|kf| kf.tick >= start.0 && kf.tick <= end)
                .cloned()
                .collect(),
            deltas: blob
                .deltas
                .iter()
                .filter(|d| d.tick >= start.0 && d.tick <= end)
                .cloned()
                .collect(),
        })
    }

    /// Stream the run as fixed-size chunks; the narrow streaming interface replay
    /// consumers read from.
    pub fn chunk_stream(
        &self,
        chunk_size: u32,
    ) -> WorldlineResult<impl Stream<Item = ReplayChunk> + use<>> {
        let blob = self.loaded()?;
        let total = blob.ticks_executed;
        let size = chunk_size.max(1);
        let chunks: Vec<ReplayChunk> = (0..=total)
            .step_by(size as usize)
            .map(|start| {
                self.get_chunk(Tick(start), Some(Tick((start + size - 1).min(total))))
                    .expect("blob is loaded")
            })
            .collect();
        Ok(futures::stream::iter(chunks))
    }

    /// State history for one agent over a tick range, collected from keyframes and the
    /// deltas that touch it.
    pub fn get_agent_history(
        &self,
        agent_id: &str,
        range: Option<(Tick, Tick)>,
    ) -> WorldlineResult<Vec<(u32, crate::telemetry::blob::AgentState)>> {
        let blob = self.loaded()?;
        let (start, end) = range
            .map(|(s, e)| (s.0, e.0))
            .unwrap_or((0, blob.ticks_executed));

        let mut history: Vec<(u32, crate::telemetry::blob::AgentState)> = Vec::new();
        for keyframe in &blob.keyframes {
            if keyframe.tick < start || keyframe.tick > end {
                continue;
            }
            if let Some(state) = keyframe.agent_states.get(agent_id) {
                history.push((keyframe.tick, state.clone()));
            }
        }
        for delta in &blob.deltas {
            if delta.tick < start || delta.tick > end {
                continue;
            }
            if let Some(update) = delta.agent_updates.get(agent_id) {
                let mut state = history
                    .iter()
                    .filter(|(t, _)| *t < delta.tick)
                    .max_by_key(|(t, _)| *t)
                    .map(|(_, s)| s.clone())
                    .unwrap_or_default();
                for (key, value) in update {
                    state.insert(key.clone(), value.clone());
                }
                history.push((delta.tick, state));
            }
        }
        history.sort_by_key(|(t, _)| *t);
        Ok(history)
    }

    /// Events at exactly tick T via binary search over the event index.
    pub fn get_events_at_tick(&self, tick: Tick) -> WorldlineResult<Vec<String>> {
        let blob = self.loaded()?;
        Ok(blob
            .index
            .event_index
            .binary_search_by_key(&tick.0, |entry| entry.tick)
            .ok()
            .map(|i| blob.index.event_index[i].events.clone())
            .unwrap_or_default())
    }

    pub fn clear(&mut self) {
        self.blob = None;
        self.cache.clear();
    }
}

fn apply_delta(state: &mut WorldReplayState, delta: &Delta) {
    for (agent_id, update) in &delta.agent_updates {
        let agent = state.agents.entry(agent_id.clone()).or_default();
        for (key, value) in update {
            agent.insert(key.clone(), value.clone());
        }
    }
    for (key, value) in &delta.metrics {
        state.metrics.insert(key.clone(), *value);
    }
    state.events = delta.events_triggered.clone();
    state.tick = delta.tick;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use futures::StreamExt;
    use serde_json::json;

    use crate::{
        telemetry::writer::TelemetryWriter,
        types::{RunId, Seed},
    };

    use super::*;

    fn sample_blob(ticks: u32, interval: u32) -> TelemetryBlob {
        let mut writer = TelemetryWriter::new(RunId::new(), Seed(42), interval);
        for t in 0..=ticks {
            let states: AgentStates = (0..3)
                .map(|i| {
                    (
                        format!("agent-0000{i}"),
                        [
                            ("engagement".to_string(), json!((t as f64 + i as f64) / 100.0)),
                            ("segment".to_string(), json!("urban")),
                        ]
                        .into_iter()
                        .collect(),
                    )
                })
                .collect();
            let events = if t == 5 { vec!["shock".to_string()] } else { Vec::new() };
            let metrics: BTreeMap<String, f64> =
                [("mean_engagement".to_string(), t as f64 / 100.0)]
                    .into_iter()
                    .collect();
            writer
                .record(Tick(t), states, json!({"tick": t}), events, metrics)
                .unwrap();
        }
        writer.finalize().unwrap()
    }

    #[test]
    fn state_at_keyframe_tick_equals_stored_keyframe() {
        let blob = sample_blob(30, 10);
        let keyframe = blob.keyframes[1].clone();
        let mut loader = ReplayLoader::new();
        loader.load(blob);

        let state = loader.get_state_at_tick(Tick(keyframe.tick)).unwrap();
        assert_eq!(state.agents, keyframe.agent_states);
        assert_eq!(state.metrics, keyframe.metrics);
    }

    #[test]
    fn replay_is_idempotent_for_every_tick() {
        let blob = sample_blob(25, 10);
        let mut loader = ReplayLoader::new();
        loader.load(blob);
        for t in 0..=25 {
            let a = loader.get_state_at_tick(Tick(t)).unwrap();
            let b = loader.get_state_at_tick(Tick(t)).unwrap();
            assert_eq!(a, b, "tick {t} replay must be idempotent");
        }
    }

    #[test]
    fn deltas_apply_in_order_between_keyframes() {
        let blob = sample_blob(30, 10);
        let mut loader = ReplayLoader::new();
        loader.load(blob);
        let state = loader.get_state_at_tick(Tick(17)).unwrap();
        let engagement = state.agents["agent-00000"]["engagement"].as_f64().unwrap();
        assert!((engagement - 0.17).abs() < 1e-9);
        assert_eq!(state.tick, 17);
    }

    #[test]
    fn out_of_range_tick_is_an_error() {
        let blob = sample_blob(10, 5);
        let mut loader = ReplayLoader::new();
        loader.load(blob);
        assert!(loader.get_state_at_tick(Tick(11)).is_err());
    }

    #[test]
    fn events_lookup_hits_only_their_tick() {
        let blob = sample_blob(20, 10);
        let mut loader = ReplayLoader::new();
        loader.load(blob);
        assert_eq!(loader.get_events_at_tick(Tick(5)).unwrap(), vec!["shock"]);
        assert!(loader.get_events_at_tick(Tick(6)).unwrap().is_empty());

        let state = loader.get_state_at_tick(Tick(5)).unwrap();
        assert_eq!(state.events, vec!["shock"]);
    }

    #[test]
    fn agent_history_collects_keyframes_and_deltas() {
        let blob = sample_blob(12, 10);
        let mut loader = ReplayLoader::new();
        loader.load(blob);
        let history = loader.get_agent_history("agent-00001", None).unwrap();
        assert!(!history.is_empty());
        let ticks: Vec<u32> = history.iter().map(|(t, _)| *t).collect();
        let mut sorted = ticks.clone();
        sorted.sort_unstable();
        assert_eq!(ticks, sorted);
    }

    #[test]
    fn chunk_stream_covers_the_whole_run() {
        let blob = sample_blob(25, 10);
        let mut loader = ReplayLoader::new();
        loader.load(blob);

        let chunks: Vec<ReplayChunk> =
            futures::executor::block_on(loader.chunk_stream(10).unwrap().collect::<Vec<_>>());
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].start_tick, 0);
        assert_eq!(chunks.last().unwrap().end_tick, 25);
    }

    #[test]
    fn timeline_reports_distributions_and_markers() {
        let blob = sample_blob(20, 10);
        let mut loader = ReplayLoader::new();
        let timeline = loader.load(blob);
        assert_eq!(timeline.total_ticks, 20);
        assert_eq!(timeline.segment_distribution["urban"], 3);
        assert!(timeline.event_markers.iter().any(|m| m.marker_type == "event"));
        assert!((timeline.duration_seconds - 2.0).abs() < 1e-12);
    }
}
