// ================================================================================================
// Manifest Log
// ================================================================================================

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{ManifestEntryId, RunId, TenantId};

/// One external read, recorded append-only. Evidence packs reference these entries for
/// every external read a run performed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub id: ManifestEntryId,
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<RunId>,
    pub source_name: String,
    pub endpoint: String,
    pub params_normalized: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cutoff_time: Option<DateTime<Utc>>,
    pub payload_hash: String,
    pub record_count: usize,
    pub captured_at: DateTime<Utc>,
}

/// Durable append-only manifest. Entries are never updated or removed.
#[derive(Default)]
pub struct ManifestLog {
    entries: RwLock<Vec<ManifestEntry>>,
}

impl ManifestLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, entry: ManifestEntry) -> ManifestEntryId {
        let id = entry.id;
        self.entries.write().expect("manifest lock poisoned").push(entry);
        id
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("manifest lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries for a run, in append order.
    pub fn by_run(&self, run_id: RunId) -> Vec<ManifestEntry> {
        self.entries
            .read()
            .expect("manifest lock poisoned")
            .iter()
            .filter(|entry| entry.run_id == Some(run_id))
            .cloned()
            .collect()
    }

    pub fn get(&self, id: ManifestEntryId) -> Option<ManifestEntry> {
        self.entries
            .read()
            .expect("manifest lock poisoned")
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }
}
