mod common;

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use common::Platform;
use serde_json::json;
use worldline::{
    Seed,
    gateway::{
        TemporalMode,
        guard::IsolationLevel,
        source::{SourceRegistry, SourceSpec, StaticFetcher},
    },
    orchestrator::{
        NodeBinding,
        executor::DataBinding,
        run::{RunConfig, RunStatus, SeedConfig, TriggeredBy},
    },
};

fn backtest_config(seed: u64) -> RunConfig {
    RunConfig {
        horizon: 25,
        keyframe_interval: 5,
        max_agents: 60,
        seed_config: SeedConfig::single(Seed(seed)),
        cutoff_time: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
        temporal_mode: TemporalMode::Backtest,
        isolation_level: IsolationLevel::Filter,
        leakage_guard: true,
        ..RunConfig::default()
    }
}

fn platform_with_records(records: Vec<serde_json::Value>) -> Platform {
    let registry = SourceRegistry::new();
    registry.register(SourceSpec::new("signals"));
    Platform::with_executor_setup(registry, move |executor| {
        executor.with_binding(DataBinding {
            source_name: "signals".to_string(),
            endpoint: "/v1/events".to_string(),
            params: json!({"feed": "macro"}),
            timestamp_field: Some("observed_at".to_string()),
            fetcher: Arc::new(StaticFetcher::new(records)),
        })
    })
}

fn past_record() -> serde_json::Value {
    json!({
        "name": "confidence_dip",
        "observed_at": "2023-06-01T00:00:00Z",
        "tick": 3,
        "magnitude": 1.0,
        "variable_impact": {"consumer_confidence": -0.1},
    })
}

fn future_record() -> serde_json::Value {
    json!({
        "name": "future_rally",
        "observed_at": "2024-06-01T00:00:00Z",
        "tick": 5,
        "magnitude": 1.0,
        "variable_impact": {"consumer_confidence": 0.4},
    })
}

/// Leakage-block scenario: a record beyond the cutoff is filtered, counted, and has no
/// effect on the result hash relative to a world where it never existed.
#[tokio::test]
async fn blocked_future_record_does_not_change_results() {
    // Run A: the source carries a record beyond the 2024-01-01 cutoff.
    let platform_a = platform_with_records(vec![past_record(), future_record()]);
    let (run_a, _) = platform_a
        .orchestrator
        .create_and_queue(
            backtest_config(11),
            NodeBinding::NewRoot,
            TriggeredBy::User,
            None,
        )
        .unwrap();
    let finished_a = platform_a.orchestrator.wait_for_terminal(run_a.id).await.unwrap();

    // Run B: identical config and seed against a source where the future record does
    // not exist at all.
    let platform_b = platform_with_records(vec![past_record()]);
    let (run_b, _) = platform_b
        .orchestrator
        .create_and_queue(
            backtest_config(11),
            NodeBinding::NewRoot,
            TriggeredBy::User,
            None,
        )
        .unwrap();
    let finished_b = platform_b.orchestrator.wait_for_terminal(run_b.id).await.unwrap();

    // Both succeed; the guard only filtered, never failed the run.
    assert_eq!(finished_a.status, RunStatus::Succeeded);
    assert_eq!(finished_b.status, RunStatus::Succeeded);

    // The block is attested in the evidence pack.
    let pack_a = platform_a.orchestrator.executor().evidence_pack(run_a.id).unwrap();
    let proof = pack_a.anti_leakage_proof.as_ref().unwrap();
    assert!(proof.blocked_access_attempts >= 1);
    assert!(proof.leakage_detected);
    assert!(proof.dataset_filtered);

    let pack_b = platform_b.orchestrator.executor().evidence_pack(run_b.id).unwrap();
    assert_eq!(
        pack_b.anti_leakage_proof.as_ref().unwrap().blocked_access_attempts,
        0
    );

    // And the filtered record left no trace in the results.
    assert_eq!(
        pack_a.determinism_signature.result_hash,
        pack_b.determinism_signature.result_hash
    );
    assert_eq!(
        pack_a.determinism_signature.telemetry_hash,
        pack_b.determinism_signature.telemetry_hash
    );

    // The kept record still fired as a world event in both runs.
    let blob_a = platform_a
        .telemetry
        .fetch(finished_a.outputs.telemetry_ref.as_ref().unwrap())
        .await
        .unwrap();
    assert!(blob_a.capabilities.has_events);
    assert!(
        blob_a
            .index
            .event_index
            .iter()
            .any(|entry| entry.tick == 3 && entry.events.contains(&"confidence_dip".to_string()))
    );

    // Every served request is on the manifest with its payload hash.
    let manifest = platform_a.gateway.manifest().by_run(run_a.id);
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].record_count, 1);
    assert!(!manifest[0].payload_hash.is_empty());

    platform_a.orchestrator.shutdown().await;
    platform_b.orchestrator.shutdown().await;
}

/// At isolation level 3 the same future record fails the run with the stable
/// `future_data_access` kind.
#[tokio::test]
async fn strict_isolation_fails_the_run_on_future_data() {
    let platform = platform_with_records(vec![past_record(), future_record()]);
    let config = RunConfig {
        isolation_level: IsolationLevel::Strict,
        ..backtest_config(11)
    };
    let (run, _) = platform
        .orchestrator
        .create_and_queue(config, NodeBinding::NewRoot, TriggeredBy::User, None)
        .unwrap();
    let finished = platform.orchestrator.wait_for_terminal(run.id).await.unwrap();

    assert_eq!(finished.status, RunStatus::Failed);
    let error = finished.error.as_ref().unwrap();
    assert_eq!(error.kind, worldline::ErrorKind::FutureDataAccess);

    // The violation is auditable even though the run failed.
    let stats = platform.gateway.guard_stats(run.id);
    assert!(stats.blocked_access_attempts >= 1);
    assert!(stats.leakage_detected());

    platform.orchestrator.shutdown().await;
}
