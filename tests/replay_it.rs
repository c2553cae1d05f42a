mod common;

use common::Platform;
use futures::StreamExt;
use worldline::{
    Seed, Tick,
    orchestrator::{
        NodeBinding,
        run::{RunConfig, RunStatus, SeedConfig, TriggeredBy},
    },
    telemetry::{ReplayLoader, TelemetryBlob},
};

async fn run_and_fetch_blob(horizon: u32, seed: u64) -> (Platform, TelemetryBlob) {
    let platform = Platform::new();
    let config = RunConfig {
        horizon,
        keyframe_interval: 10,
        max_agents: 50,
        seed_config: SeedConfig::single(Seed(seed)),
        ..RunConfig::default()
    };
    let (run, _) = platform
        .orchestrator
        .create_and_queue(config, NodeBinding::NewRoot, TriggeredBy::User, None)
        .unwrap();
    let finished = platform.orchestrator.wait_for_terminal(run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Succeeded);

    let blob = platform
        .telemetry
        .fetch(finished.outputs.telemetry_ref.as_ref().unwrap())
        .await
        .unwrap();
    (platform, blob)
}

/// Tick monotonicity: keyframe and delta ticks are strictly increasing, and no delta
/// precedes the initial keyframe.
#[tokio::test]
async fn telemetry_ticks_are_monotonic() {
    let (platform, blob) = run_and_fetch_blob(35, 4).await;

    let keyframe_ticks: Vec<u32> = blob.keyframes.iter().map(|kf| kf.tick).collect();
    assert!(keyframe_ticks.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keyframe_ticks.first(), Some(&0));

    let delta_ticks: Vec<u32> = blob.deltas.iter().map(|d| d.tick).collect();
    assert!(delta_ticks.windows(2).all(|w| w[0] < w[1]));
    if let Some(first_delta) = delta_ticks.first() {
        assert!(*first_delta > 0, "no delta precedes the initial keyframe");
    }

    assert_eq!(blob.index.keyframe_ticks, keyframe_ticks);

    platform.orchestrator.shutdown().await;
}

/// Replay idempotence: every tick reconstructs to the same state twice, and keyframe
/// ticks reconstruct to exactly the stored keyframe.
#[tokio::test]
async fn replay_is_idempotent_and_matches_keyframes() {
    let (platform, blob) = run_and_fetch_blob(30, 5).await;
    let keyframes = blob.keyframes.clone();
    let ticks_executed = blob.ticks_executed;

    let mut loader = ReplayLoader::new();
    let timeline = loader.load(blob);
    assert_eq!(timeline.total_ticks, ticks_executed);
    assert_eq!(timeline.agent_count, 50);

    for t in 0..=ticks_executed {
        let first = loader.get_state_at_tick(Tick(t)).unwrap();
        let second = loader.get_state_at_tick(Tick(t)).unwrap();
        assert_eq!(first, second, "tick {t} must reconstruct identically");
        assert_eq!(first.tick, t);
        assert_eq!(first.agents.len(), 50);
    }

    for keyframe in &keyframes {
        let state = loader.get_state_at_tick(Tick(keyframe.tick)).unwrap();
        assert_eq!(
            state.agents, keyframe.agent_states,
            "keyframe tick {} must equal the stored keyframe",
            keyframe.tick
        );
    }

    platform.orchestrator.shutdown().await;
}

/// The chunk stream covers the whole run and agent histories stay ordered.
#[tokio::test]
async fn chunks_and_agent_histories_are_consistent() -> anyhow::Result<()> {
    let (platform, blob) = run_and_fetch_blob(40, 8).await;
    let total = blob.ticks_executed;

    let mut loader = ReplayLoader::new();
    loader.load(blob);

    let chunks: Vec<_> = loader.chunk_stream(16)?.collect().await;
    assert_eq!(chunks.first().unwrap().start_tick, 0);
    assert_eq!(chunks.last().unwrap().end_tick, total);

    let history = loader.get_agent_history("agent-00007", None)?;
    assert!(!history.is_empty());
    let ticks: Vec<u32> = history.iter().map(|(t, _)| *t).collect();
    let mut sorted = ticks.clone();
    sorted.sort_unstable();
    assert_eq!(ticks, sorted);

    platform.orchestrator.shutdown().await;
    Ok(())
}
