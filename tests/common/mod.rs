// Shared fixtures for the integration suite.
#![allow(dead_code)]

use std::sync::Arc;

use worldline::{
    config::FeatureFlags,
    gateway::{DataGateway, manifest::ManifestLog, source::SourceRegistry},
    orchestrator::{Orchestrator, executor::RunExecutor, run::RunStore},
    telemetry::TelemetryStore,
    universe::UniverseMap,
};

/// Everything a scenario needs, wired over in-memory stores.
pub struct Platform {
    pub orchestrator: Orchestrator,
    pub telemetry: Arc<TelemetryStore>,
    pub gateway: Arc<DataGateway>,
}

impl Platform {
    /// Build with the default (empty) source registry and no data bindings.
    pub fn new() -> Self {
        Self::with_executor_setup(SourceRegistry::new(), |executor| executor)
    }

    /// Build with a custom registry and executor customization (data bindings).
    pub fn with_executor_setup(
        registry: SourceRegistry,
        setup: impl FnOnce(RunExecutor) -> RunExecutor,
    ) -> Self {
        // Best-effort tracing for debugging failed scenarios; repeated init is fine.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();

        let runs = Arc::new(RunStore::new());
        let universe = Arc::new(UniverseMap::new());
        let telemetry = Arc::new(TelemetryStore::in_memory());
        let gateway = Arc::new(DataGateway::new(registry, Arc::new(ManifestLog::new())));

        let executor = setup(RunExecutor::new(
            runs,
            universe,
            telemetry.clone(),
            gateway.clone(),
            FeatureFlags::default(),
        ));
        let orchestrator = Orchestrator::new(Arc::new(executor));
        orchestrator.start_workers(2);

        Self {
            orchestrator,
            telemetry,
            gateway,
        }
    }
}
