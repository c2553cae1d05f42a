// ================================================================================================
// Content-Addressed Blob Storage
// ================================================================================================

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{ObjectStore, PutPayload, local::LocalFileSystem, memory::InMemory, path::Path};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{IoError, WorldlineResult},
    evidence::canonical,
    telemetry::blob::TelemetryBlob,
};

/// Pointer to a stored blob. The key embeds the content hash, so identical payloads
/// dedupe to a single object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageRef {
    pub backend: String,
    pub key: String,
    pub content_hash: String,
    pub size_bytes: u64,
}

/// Pluggable object-storage seam.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store bytes content-addressed. Idempotent: re-putting identical content
    /// returns the same ref without a second write.
    async fn put_blob(&self, prefix: &str, bytes: Bytes) -> WorldlineResult<StorageRef>;

    async fn get_blob(&self, storage_ref: &StorageRef) -> WorldlineResult<Bytes>;

    /// Short-lived signed URL for external readers.
    async fn signed_url(&self, storage_ref: &StorageRef, expires_secs: u64)
    -> WorldlineResult<String>;
}

/// `BlobStore` over any `object_store` backend.
pub struct ObjectStoreBlobStore {
    backend: String,
    store: Arc<dyn ObjectStore>,
}

/// In-memory store for tests and single-process deployments.
pub type MemoryBlobStore = ObjectStoreBlobStore;

impl ObjectStoreBlobStore {
    pub fn in_memory() -> Self {
        Self {
            backend: "mem".to_string(),
            store: Arc::new(InMemory::new()),
        }
    }

    pub fn local(root: &std::path::Path) -> WorldlineResult<Self> {
        let store = LocalFileSystem::new_with_prefix(root)
            .map_err(|e| IoError::ObjectStore(e.to_string()))?;
        Ok(Self {
            backend: "file".to_string(),
            store: Arc::new(store),
        })
    }
}

#[async_trait]
impl BlobStore for ObjectStoreBlobStore {
    async fn put_blob(&self, prefix: &str, bytes: Bytes) -> WorldlineResult<StorageRef> {
        let content_hash = canonical::sha256_hex_bytes(&bytes);
        let key = format!("{prefix}/{content_hash}.json");
        let path = Path::from(key.clone());
        let storage_ref = StorageRef {
            backend: self.backend.clone(),
            key,
            content_hash,
            size_bytes: bytes.len() as u64,
        };

        // Dedupe on content hash.
        if self.store.head(&path).await.is_ok() {
            debug!(key = %storage_ref.key, "blob already stored; dedup hit");
            return Ok(storage_ref);
        }

        // One retry before surfacing storage_unavailable.
        let payload = PutPayload::from(bytes);
        if let Err(first) = self.store.put(&path, payload.clone()).await {
            warn!(error = %first, "blob put failed; retrying once");
            self.store
                .put(&path, payload)
                .await
                .map_err(|e| IoError::StorageUnavailable(e.to_string()))?;
        }
        debug!(key = %storage_ref.key, size = storage_ref.size_bytes, "blob stored");
        Ok(storage_ref)
    }

    async fn get_blob(&self, storage_ref: &StorageRef) -> WorldlineResult<Bytes> {
        let path = Path::from(storage_ref.key.clone());
        let result = self
            .store
            .get(&path)
            .await
            .map_err(|e| IoError::ObjectStore(e.to_string()))?;
        Ok(result
            .bytes()
            .await
            .map_err(|e| IoError::ObjectStore(e.to_string()))?)
    }

    async fn signed_url(
        &self,
        storage_ref: &StorageRef,
        expires_secs: u64,
    ) -> WorldlineResult<String> {
        // Local backends have no signing authority; the URL embeds the expiry so
        // callers exercise the same contract as against cloud storage.
        Ok(format!(
            "{}://{}?expires={}",
            self.backend, storage_ref.key, expires_secs
        ))
    }
}

/// Telemetry persistence over a `BlobStore`: canonical bytes in, verified blobs out.
pub struct TelemetryStore {
    store: Arc<dyn BlobStore>,
}

impl TelemetryStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(ObjectStoreBlobStore::in_memory()))
    }

    /// Serialize canonically and store content-addressed.
    pub async fn persist(&self, blob: &TelemetryBlob) -> WorldlineResult<StorageRef> {
        let bytes = blob.canonical_bytes()?;
        self.store.put_blob("telemetry", Bytes::from(bytes)).await
    }

    /// Fetch and decode, verifying the content hash.
    pub async fn fetch(&self, storage_ref: &StorageRef) -> WorldlineResult<TelemetryBlob> {
        let bytes = self.store.get_blob(storage_ref).await?;
        let actual = canonical::sha256_hex_bytes(&bytes);
        if actual != storage_ref.content_hash {
            return Err(crate::error::SystemError::DeterminismViolation(format!(
                "telemetry content hash mismatch: expected {}, got {actual}",
                storage_ref.content_hash
            ))
            .into());
        }
        TelemetryBlob::from_bytes(&bytes)
    }

    pub async fn signed_url(
        &self,
        storage_ref: &StorageRef,
        expires_secs: u64,
    ) -> WorldlineResult<String> {
        self.store.signed_url(storage_ref, expires_secs).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::{
        telemetry::blob::{
            AgentStates, Capabilities, TELEMETRY_VERSION, SCHEMA_VERSION, TelemetryIndex,
        },
        types::RunId,
    };

    use super::*;

    fn blob() -> TelemetryBlob {
        TelemetryBlob {
            version: TELEMETRY_VERSION.to_string(),
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: RunId::new(),
            seed_used: 42,
            agent_count: 2,
            ticks_executed: 5,
            keyframes: Vec::new(),
            deltas: Vec::new(),
            final_states: AgentStates::new(),
            index: TelemetryIndex::default(),
            metrics_summary: BTreeMap::new(),
            capabilities: Capabilities::default(),
        }
    }

    #[tokio::test]
    async fn persist_and_fetch_round_trip() {
        let store = TelemetryStore::in_memory();
        let blob = blob();
        let storage_ref = store.persist(&blob).await.unwrap();
        assert_eq!(storage_ref.backend, "mem");
        assert!(storage_ref.key.contains(&storage_ref.content_hash));

        let fetched = store.fetch(&storage_ref).await.unwrap();
        assert_eq!(fetched, blob);
    }

    #[tokio::test]
    async fn identical_content_dedupes_to_one_ref() {
        let store = TelemetryStore::in_memory();
        let blob = blob();
        let first = store.persist(&blob).await.unwrap();
        let second = store.persist(&blob).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn corrupted_ref_fails_hash_verification() {
        let store = TelemetryStore::in_memory();
        let blob = blob();
        let mut storage_ref = store.persist(&blob).await.unwrap();
        storage_ref.content_hash = "0".repeat(64);
        assert!(store.fetch(&storage_ref).await.is_err());
    }

    #[tokio::test]
    async fn local_backend_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = TelemetryStore::new(Arc::new(
            ObjectStoreBlobStore::local(dir.path()).unwrap(),
        ));
        let blob = blob();
        let storage_ref = store.persist(&blob).await.unwrap();
        assert_eq!(storage_ref.backend, "file");
        let fetched = store.fetch(&storage_ref).await.unwrap();
        assert_eq!(fetched, blob);
    }

    #[tokio::test]
    async fn signed_urls_embed_expiry() {
        let store = TelemetryStore::in_memory();
        let blob = blob();
        let storage_ref = store.persist(&blob).await.unwrap();
        let url = store.signed_url(&storage_ref, 3600).await.unwrap();
        assert!(url.starts_with("mem://telemetry/"));
        assert!(url.ends_with("expires=3600"));
    }
}
