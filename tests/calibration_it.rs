mod common;

use std::sync::Arc;

use chrono::Utc;
use common::Platform;
use worldline::{
    Seed,
    evidence::{
        calibration::{
            CalibrationAudit, CalibrationConfig, CalibrationJobStatus, CalibrationService,
            GroundTruthStore, WeightingMethod,
        },
        canonical,
    },
    orchestrator::{
        NodeBinding,
        run::{RunConfig, SeedConfig, TriggeredBy},
    },
    types::{ProjectId, TenantId},
};

/// End-to-end calibration: label a batch of real runs, assemble samples through the
/// join, and verify the deterministic result contract.
#[tokio::test]
async fn calibration_over_real_runs_is_deterministic() {
    let platform = Platform::new();

    // Produce a dozen completed runs over distinct seeds on one node.
    let base_config = RunConfig {
        horizon: 15,
        keyframe_interval: 5,
        max_agents: 40,
        seed_config: SeedConfig::single(Seed(100)),
        ..RunConfig::default()
    };
    let (first, node) = platform
        .orchestrator
        .create_and_queue(
            base_config.clone(),
            NodeBinding::NewRoot,
            TriggeredBy::User,
            None,
        )
        .unwrap();
    let mut run_ids = vec![first.id];
    run_ids.extend(
        platform
            .orchestrator
            .run_multi_seed(&base_config, node.id, 11)
            .unwrap(),
    );
    let mut runs = Vec::new();
    for run_id in &run_ids {
        runs.push(platform.orchestrator.wait_for_terminal(*run_id).await.unwrap());
    }

    // Ground truth: label each run by whether its predicted probability cleared 0.5.
    let ground_truth = Arc::new(GroundTruthStore::new());
    let tenant = TenantId::new();
    let project = ProjectId::new();
    let dataset = ground_truth.create_dataset(tenant, project, "election-2024", None);
    let service = CalibrationService::new(ground_truth.clone());

    let outcomes: Vec<_> = runs
        .iter()
        .map(|run| {
            let predicted = run
                .outputs
                .outcomes
                .as_ref()
                .map(|o| o.primary_outcome_probability);
            let label = predicted.unwrap_or(0.0) >= 0.5;
            ground_truth.upsert_label(dataset.id, Some(run.node_id), run.id, label, None);
            (run.id, predicted, run.timing.finished_at.unwrap_or_else(Utc::now))
        })
        .collect();

    let (samples, audit) = service.assemble_samples(
        dataset.id,
        &outcomes,
        WeightingMethod::Uniform,
        Utc::now(),
    );
    assert_eq!(audit.runs_matched, 12);
    assert_eq!(audit.runs_missing_labels, 0);

    // Same (config, data, seed) twice: byte-identical result_json.
    let config = CalibrationConfig {
        node_id: Some(node.id),
        seed: Some(1),
        ..CalibrationConfig::new(dataset.id)
    };
    let job_a = service.create_job(tenant, project, config.clone());
    let job_b = service.create_job(tenant, project, config);
    let done_a = service.run_job(job_a.id, &samples, audit.clone()).unwrap();
    let done_b = service.run_job(job_b.id, &samples, audit).unwrap();

    assert_eq!(done_a.status, CalibrationJobStatus::Succeeded);
    assert_eq!(
        canonical::canonical_bytes(done_a.result_json.as_ref().unwrap()),
        canonical::canonical_bytes(done_b.result_json.as_ref().unwrap())
    );

    // Iterations are immutable records of the search.
    assert!(!done_a.iterations.is_empty());
    assert_eq!(done_a.iterations, done_b.iterations);
    for (i, iteration) in done_a.iterations.iter().enumerate() {
        assert_eq!(iteration.iter_index, i);
        assert_eq!(iteration.metrics.n_samples, 12);
    }

    platform.orchestrator.shutdown().await;
}
