// ================================================================================================
// Data Sources
// ================================================================================================

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WorldlineResult;

/// Registered external data source and its temporal metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub name: String,
    /// Earliest instant the source's data existed. A backtest whose cutoff precedes
    /// this is reading data that did not exist yet; the guard blocks it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub earliest_available_at: Option<DateTime<Utc>>,
    /// Administratively blocked regardless of isolation level.
    #[serde(default)]
    pub blocked: bool,
}

impl SourceSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            earliest_available_at: None,
            blocked: false,
        }
    }
}

/// Registry of sources the gateway will serve.
pub struct SourceRegistry {
    sources: DashMap<String, SourceSpec>,
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            sources: DashMap::new(),
        }
    }

    pub fn register(&self, spec: SourceSpec) {
        self.sources.insert(spec.name.clone(), spec);
    }

    pub fn get(&self, name: &str) -> Option<SourceSpec> {
        self.sources.get(name).map(|entry| entry.clone())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.sources.iter().map(|entry| entry.name.clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// The actual fetch operation, injected by the caller. The gateway never contacts a
/// source except through this seam.
#[async_trait]
pub trait DataFetcher: Send + Sync {
    async fn fetch(&self, endpoint: &str, params: &Value) -> WorldlineResult<Vec<Value>>;
}

/// Fixed-payload fetcher for tests and replayed captures.
pub struct StaticFetcher {
    records: Vec<Value>,
}

impl StaticFetcher {
    pub fn new(records: Vec<Value>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl DataFetcher for StaticFetcher {
    async fn fetch(&self, _endpoint: &str, _params: &Value) -> WorldlineResult<Vec<Value>> {
        Ok(self.records.clone())
    }
}
