// ================================================================================================
// Data Gateway
// ================================================================================================
//
// The single chokepoint for all external reads. Every request consults the Leakage
// Guard before the fetcher runs, filters what comes back against the run's cutoff,
// and appends an auditable manifest entry.

pub mod guard;
pub mod manifest;
pub mod source;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::{
    error::{GatewayError, WorldlineResult},
    evidence::canonical,
    gateway::{
        guard::{FilterOutcome, IsolationLevel, LeakageGuard},
        manifest::{ManifestEntry, ManifestLog},
        source::{DataFetcher, SourceRegistry},
    },
    types::{ManifestEntryId, ProjectId, RunId, TenantId},
};

/// Temporal execution mode for gateway requests.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
    strum::Display, strum::EnumString, strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TemporalMode {
    #[default]
    Live,
    Backtest,
}

/// Context carried by every gateway request. Lifted into an explicit object; the
/// gateway keeps no process-wide mutable state beyond its stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGatewayContext {
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff_time: Option<DateTime<Utc>>,
    pub isolation_level: IsolationLevel,
    pub temporal_mode: TemporalMode,
}

impl DataGatewayContext {
    pub fn live(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            project_id: None,
            run_id: None,
            cutoff_time: None,
            isolation_level: IsolationLevel::Filter,
            temporal_mode: TemporalMode::Live,
        }
    }

    pub fn backtest(
        tenant_id: TenantId,
        run_id: RunId,
        cutoff_time: DateTime<Utc>,
        isolation_level: IsolationLevel,
    ) -> Self {
        Self {
            tenant_id,
            project_id: None,
            run_id: Some(run_id),
            cutoff_time: Some(cutoff_time),
            isolation_level,
            temporal_mode: TemporalMode::Backtest,
        }
    }
}

/// The response handed back to callers: filtered data plus audit metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataGatewayResponse {
    pub data: Vec<Value>,
    pub record_count: usize,
    pub payload_hash: String,
    pub manifest_entry_id: ManifestEntryId,
    /// Records discarded by the guard for crossing the cutoff.
    pub records_filtered: usize,
}

/// Per-run guard statistics surfaced into run outputs and the Evidence Pack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LeakageGuardStats {
    pub requests: u64,
    pub records_fetched: u64,
    pub records_filtered: u64,
    pub blocked_access_attempts: u64,
    pub sources_blocked: u64,
}

impl LeakageGuardStats {
    pub fn leakage_detected(&self) -> bool {
        self.blocked_access_attempts > 0 || self.sources_blocked > 0
    }
}

pub struct DataGateway {
    registry: SourceRegistry,
    guard: LeakageGuard,
    manifest: Arc<ManifestLog>,
    run_stats: DashMap<RunId, LeakageGuardStats>,
}

impl DataGateway {
    pub fn new(registry: SourceRegistry, manifest: Arc<ManifestLog>) -> Self {
        Self {
            registry,
            guard: LeakageGuard::default(),
            manifest,
            run_stats: DashMap::new(),
        }
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn manifest(&self) -> &ManifestLog {
        &self.manifest
    }

    /// Guard statistics accumulated for a run across all its requests.
    pub fn guard_stats(&self, run_id: RunId) -> LeakageGuardStats {
        self.run_stats
            .get(&run_id)
            .map(|entry| *entry)
            .unwrap_or_default()
    }

    /// Execute one external read through the guard.
    ///
    /// Order of operations: source registration and availability checks, fetch,
    /// temporal filtering, manifest append. Every violation is recorded in the run's
    /// stats even when it does not fail the request.
    pub async fn request(
        &self,
        source_name: &str,
        endpoint: &str,
        params: Value,
        context: &DataGatewayContext,
        data_fetcher: &dyn DataFetcher,
        timestamp_field: Option<&str>,
    ) -> WorldlineResult<DataGatewayResponse> {
        let source = self.registry.get(source_name).ok_or_else(|| {
            GatewayError::SourceNotRegistered(source_name.to_string())
        })?;

        if let Err(err) = self.guard.check_source(&source, context) {
            self.record_source_block(context);
            return Err(err);
        }

        let records = data_fetcher
            .fetch(endpoint, &params)
            .await
            .map_err(|e| GatewayError::Fetch {
                source_name: source_name.to_string(),
                msg: e.to_string(),
            })?;
        let fetched = records.len();

        let FilterOutcome { kept, dropped } = match self.guard.filter_records(
            records,
            timestamp_field,
            context,
            source_name,
        ) {
            Ok(outcome) => outcome,
            Err(err) => {
                // Strict-level violations still leave an audit trail.
                self.record_blocked(context, fetched as u64);
                return Err(err);
            }
        };

        if dropped > 0 {
            warn!(
                source = source_name,
                dropped,
                cutoff = ?context.cutoff_time,
                "leakage guard filtered records beyond cutoff"
            );
        }

        let payload_hash = canonical::sha256_hex(&Value::Array(kept.clone()));
        let entry_id = self.manifest.append(ManifestEntry {
            id: ManifestEntryId::new(),
            tenant_id: context.tenant_id,
            run_id: context.run_id,
            source_name: source_name.to_string(),
            endpoint: endpoint.to_string(),
            params_normalized: canonical::normalize(&params),
            cutoff_time: context.cutoff_time,
            payload_hash: payload_hash.clone(),
            record_count: kept.len(),
            captured_at: Utc::now(),
        });

        if let Some(run_id) = context.run_id {
            let mut stats = self.run_stats.entry(run_id).or_default();
            stats.requests += 1;
            stats.records_fetched += fetched as u64;
            stats.records_filtered += dropped as u64;
            stats.blocked_access_attempts += dropped as u64;
        }

        info!(
            source = source_name,
            endpoint,
            records = kept.len(),
            filtered = dropped,
            hash = %&payload_hash[..16.min(payload_hash.len())],
            "gateway request served"
        );

        Ok(DataGatewayResponse {
            record_count: kept.len(),
            data: kept,
            payload_hash,
            manifest_entry_id: entry_id,
            records_filtered: dropped,
        })
    }

    fn record_source_block(&self, context: &DataGatewayContext) {
        if let Some(run_id) = context.run_id {
            let mut stats = self.run_stats.entry(run_id).or_default();
            stats.requests += 1;
            stats.sources_blocked += 1;
            stats.blocked_access_attempts += 1;
        }
    }

    fn record_blocked(&self, context: &DataGatewayContext, attempted: u64) {
        if let Some(run_id) = context.run_id {
            let mut stats = self.run_stats.entry(run_id).or_default();
            stats.requests += 1;
            stats.records_fetched += attempted;
            stats.blocked_access_attempts += attempted.max(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use crate::gateway::source::{SourceSpec, StaticFetcher};

    use super::*;

    fn gateway_with(source: SourceSpec) -> DataGateway {
        let registry = SourceRegistry::new();
        registry.register(source);
        DataGateway::new(registry, Arc::new(ManifestLog::new()))
    }

    fn backtest_ctx(level: IsolationLevel) -> (DataGatewayContext, RunId) {
        let run_id = RunId::new();
        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (
            DataGatewayContext::backtest(TenantId::new(), run_id, cutoff, level),
            run_id,
        )
    }

    fn record(ts: &str) -> Value {
        json!({"observed_at": ts, "value": 1.0})
    }

    #[tokio::test]
    async fn unregistered_source_is_rejected() {
        let gateway = gateway_with(SourceSpec::new("census"));
        let (ctx, _) = backtest_ctx(IsolationLevel::Filter);
        let fetcher = StaticFetcher::new(vec![]);
        let result = gateway
            .request("unknown", "/v1", json!({}), &ctx, &fetcher, Some("observed_at"))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::WorldlineError::Gateway(
                GatewayError::SourceNotRegistered(_)
            ))
        ));
    }

    #[tokio::test]
    async fn filter_level_drops_future_records_and_counts_them() {
        let gateway = gateway_with(SourceSpec::new("census"));
        let (ctx, run_id) = backtest_ctx(IsolationLevel::Filter);
        let fetcher = StaticFetcher::new(vec![
            record("2023-06-01T00:00:00Z"),
            record("2024-06-01T00:00:00Z"),
        ]);

        let response = gateway
            .request("census", "/v1", json!({}), &ctx, &fetcher, Some("observed_at"))
            .await
            .unwrap();
        assert_eq!(response.record_count, 1);
        assert_eq!(response.records_filtered, 1);

        let stats = gateway.guard_stats(run_id);
        assert_eq!(stats.blocked_access_attempts, 1);
        assert!(stats.leakage_detected());
        assert_eq!(gateway.manifest().len(), 1);
    }

    #[tokio::test]
    async fn strict_level_fails_when_any_record_would_drop() {
        let gateway = gateway_with(SourceSpec::new("census"));
        let (ctx, run_id) = backtest_ctx(IsolationLevel::Strict);
        let fetcher = StaticFetcher::new(vec![
            record("2023-06-01T00:00:00Z"),
            record("2024-06-01T00:00:00Z"),
        ]);

        let result = gateway
            .request("census", "/v1", json!({}), &ctx, &fetcher, Some("observed_at"))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::WorldlineError::Gateway(
                GatewayError::FutureDataAccess { .. }
            ))
        ));
        assert!(gateway.guard_stats(run_id).blocked_access_attempts >= 1);
        // Failed requests never reach the manifest.
        assert_eq!(gateway.manifest().len(), 0);
    }

    #[tokio::test]
    async fn strict_level_blocks_sources_without_timestamp_field() {
        let gateway = gateway_with(SourceSpec::new("census"));
        let (ctx, run_id) = backtest_ctx(IsolationLevel::Strict);
        let fetcher = StaticFetcher::new(vec![record("2023-06-01T00:00:00Z")]);

        let result = gateway
            .request("census", "/v1", json!({}), &ctx, &fetcher, None)
            .await;
        assert!(result.is_err());
        assert!(gateway.guard_stats(run_id).blocked_access_attempts >= 1);
    }

    #[tokio::test]
    async fn permissive_level_warns_but_keeps_everything() {
        let gateway = gateway_with(SourceSpec::new("census"));
        let (ctx, run_id) = backtest_ctx(IsolationLevel::Permissive);
        let fetcher = StaticFetcher::new(vec![
            record("2023-06-01T00:00:00Z"),
            record("2024-06-01T00:00:00Z"),
        ]);

        let response = gateway
            .request("census", "/v1", json!({}), &ctx, &fetcher, None)
            .await
            .unwrap();
        assert_eq!(response.record_count, 2);
        assert_eq!(gateway.guard_stats(run_id).blocked_access_attempts, 0);
    }

    #[tokio::test]
    async fn source_unavailable_before_cutoff_is_blocked() {
        let mut spec = SourceSpec::new("late_source");
        spec.earliest_available_at = Some(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap());
        let gateway = gateway_with(spec);
        let (ctx, run_id) = backtest_ctx(IsolationLevel::Filter);
        let fetcher = StaticFetcher::new(vec![record("2023-01-01T00:00:00Z")]);

        let result = gateway
            .request("late_source", "/v1", json!({}), &ctx, &fetcher, Some("observed_at"))
            .await;
        assert!(matches!(
            result,
            Err(crate::error::WorldlineError::Gateway(
                GatewayError::SourceBlocked { .. }
            ))
        ));
        assert_eq!(gateway.guard_stats(run_id).sources_blocked, 1);
    }

    #[tokio::test]
    async fn identical_payloads_hash_identically() {
        let gateway = gateway_with(SourceSpec::new("census"));
        let (ctx, _) = backtest_ctx(IsolationLevel::Filter);
        let fetcher = StaticFetcher::new(vec![record("2023-06-01T00:00:00Z")]);

        let a = gateway
            .request("census", "/v1", json!({"q": 1}), &ctx, &fetcher, Some("observed_at"))
            .await
            .unwrap();
        let b = gateway
            .request("census", "/v1", json!({"q": 1}), &ctx, &fetcher, Some("observed_at"))
            .await
            .unwrap();
        assert_eq!(a.payload_hash, b.payload_hash);
        assert_ne!(a.manifest_entry_id, b.manifest_entry_id);
    }
}
