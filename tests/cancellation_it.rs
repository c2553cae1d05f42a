mod common;

use common::Platform;
use worldline::{
    Seed, Tick,
    orchestrator::{
        NodeBinding,
        run::{RunConfig, RunStatus, SeedConfig, TriggeredBy},
    },
    telemetry::ReplayLoader,
};

/// Cancellation scenario: a long run canceled mid-flight stops at a tick boundary,
/// keeps its partial telemetry, and that telemetry replays coherently.
#[tokio::test]
async fn cancel_mid_run_retains_replayable_partial_telemetry() {
    let platform = Platform::new();

    let config = RunConfig {
        horizon: 5_000,
        keyframe_interval: 10,
        max_agents: 120,
        seed_config: SeedConfig::single(Seed(6)),
        ..RunConfig::default()
    };
    let (run, _) = platform
        .orchestrator
        .create_and_queue(config, NodeBinding::NewRoot, TriggeredBy::User, None)
        .unwrap();

    // Wait until the run is demonstrably mid-flight, then cancel.
    loop {
        if let Some(progress) = platform.orchestrator.get_progress(run.id) {
            if progress.ticks_executed.unwrap_or(0) >= 20 {
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    assert!(platform.orchestrator.cancel(run.id).unwrap());

    let finished = platform.orchestrator.wait_for_terminal(run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Canceled);

    let ticks_executed = finished.timing.ticks_executed.unwrap();
    assert!(ticks_executed >= 20);
    assert!(ticks_executed < 5_000, "cancellation must stop the loop early");

    // Already-written keyframes and deltas remain valid and replayable.
    let blob = platform
        .telemetry
        .fetch(finished.outputs.telemetry_ref.as_ref().unwrap())
        .await
        .unwrap();
    assert_eq!(blob.ticks_executed, ticks_executed);

    let mut loader = ReplayLoader::new();
    loader.load(blob);
    let state_a = loader.get_state_at_tick(Tick(ticks_executed)).unwrap();
    let state_b = loader.get_state_at_tick(Tick(ticks_executed)).unwrap();
    assert_eq!(state_a, state_b);
    assert_eq!(state_a.agents.len(), 120);

    // The evidence pack marks the run partial so aggregation can exclude it.
    let pack = platform.orchestrator.executor().evidence_pack(run.id).unwrap();
    assert!(pack.partial);
    assert!(!pack.telemetry_proof.is_complete);

    platform.orchestrator.shutdown().await;
}

/// Canceling a queued run transitions it immediately without executing.
#[tokio::test]
async fn cancel_while_queued_never_executes() {
    let platform = Platform::new();
    let config = RunConfig {
        horizon: 10,
        max_agents: 20,
        seed_config: SeedConfig::single(Seed(2)),
        ..RunConfig::default()
    };
    // Create without submitting to the scheduler so no worker can win the race.
    let (run, _) = platform
        .orchestrator
        .create_run(config, NodeBinding::NewRoot, TriggeredBy::User, None)
        .unwrap();
    platform
        .orchestrator
        .runs()
        .update_run(run.id, |r| r.transition(RunStatus::Queued))
        .unwrap();

    assert!(platform.orchestrator.cancel(run.id).unwrap());
    let finished = platform.orchestrator.wait_for_terminal(run.id).await.unwrap();
    assert_eq!(finished.status, RunStatus::Canceled);
    assert!(finished.timing.started_at.is_none());
    assert!(finished.outputs.telemetry_ref.is_none());

    platform.orchestrator.shutdown().await;
}
