//! In-memory checkpoint storage for development and testing
//!
//! [`InMemoryCheckpointStore`] keeps every checkpoint for the lifetime of the
//! process in a map keyed by lineage id, each lineage holding its checkpoints
//! in save order:
//!
//! ```text
//! Arc<RwLock<HashMap>>
//!   "lineage-a" -> [cp-1, cp-2, cp-3]   (append-only, last = latest)
//!   "lineage-b" -> [cp-1]
//! ```
//!
//! Entries are stored as encoded bytes. Every `load` decodes a fresh copy, so
//! callers can never mutate a stored checkpoint and two loads of the same id
//! are identical.

use crate::{
    checkpoint::{Checkpoint, CheckpointId, CheckpointSummary},
    error::{CheckpointError, Result},
    serializer::{JsonSerializer, SerializerProtocol},
    traits::CheckpointStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
struct StoredCheckpoint {
    checkpoint_id: CheckpointId,
    summary: CheckpointSummary,
    bytes: Arc<Vec<u8>>,
}

type CheckpointStorage = Arc<RwLock<HashMap<String, Vec<StoredCheckpoint>>>>;

/// Process-lifetime checkpoint store
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    storage: CheckpointStorage,
    serializer: JsonSerializer,
}

impl InMemoryCheckpointStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of lineages being tracked
    pub async fn lineage_count(&self) -> usize {
        self.storage.read().await.len()
    }

    /// Total number of checkpoints across all lineages
    pub async fn checkpoint_count(&self) -> usize {
        self.storage
            .read()
            .await
            .values()
            .map(|entries| entries.len())
            .sum()
    }

    /// Remove everything (test isolation)
    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn save(&self, checkpoint: Checkpoint) -> Result<CheckpointId> {
        if checkpoint.lineage_id.is_empty() {
            return Err(CheckpointError::Invalid("lineage_id is required".to_string()));
        }
        if checkpoint.checkpoint_id.is_empty() {
            return Err(CheckpointError::Invalid("checkpoint_id is required".to_string()));
        }

        let bytes = self.serializer.dumps(&checkpoint)?;
        let mut storage = self.storage.write().await;
        let entries = storage.entry(checkpoint.lineage_id.clone()).or_default();

        if entries.iter().any(|e| e.checkpoint_id == checkpoint.checkpoint_id) {
            return Err(CheckpointError::AlreadyExists {
                lineage_id: checkpoint.lineage_id,
                checkpoint_id: checkpoint.checkpoint_id,
            });
        }

        if let Some(parent) = &checkpoint.parent_id {
            if !entries.iter().any(|e| &e.checkpoint_id == parent) {
                tracing::warn!(
                    lineage_id = %checkpoint.lineage_id,
                    parent_id = %parent,
                    "Saving checkpoint whose parent is not in this store"
                );
            }
        }

        entries.push(StoredCheckpoint {
            checkpoint_id: checkpoint.checkpoint_id.clone(),
            summary: checkpoint.summary(),
            bytes: Arc::new(bytes),
        });

        Ok(checkpoint.checkpoint_id)
    }

    async fn load(&self, lineage_id: &str, checkpoint_id: &str) -> Result<Checkpoint> {
        let bytes = {
            let storage = self.storage.read().await;
            storage
                .get(lineage_id)
                .and_then(|entries| entries.iter().find(|e| e.checkpoint_id == checkpoint_id))
                .map(|entry| entry.bytes.clone())
                .ok_or_else(|| CheckpointError::not_found(lineage_id, checkpoint_id))?
        };

        self.serializer.loads(&bytes)
    }

    async fn latest_for(&self, lineage_id: &str) -> Result<Option<CheckpointId>> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(lineage_id)
            .and_then(|entries| entries.last())
            .map(|entry| entry.checkpoint_id.clone()))
    }

    async fn list(&self, lineage_id: &str) -> Result<Vec<CheckpointSummary>> {
        let storage = self.storage.read().await;
        Ok(storage
            .get(lineage_id)
            .map(|entries| entries.iter().map(|e| e.summary.clone()).collect())
            .unwrap_or_default())
    }

    async fn lineages(&self) -> Result<Vec<String>> {
        let storage = self.storage.read().await;
        let mut ids: Vec<String> = storage.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{CheckpointMetadata, CheckpointSource, StateSnapshot};
    use crate::pending::PendingWork;
    use serde_json::json;

    fn checkpoint(lineage: &str, parent: Option<String>, step: u64) -> Checkpoint {
        let mut snapshot = StateSnapshot::new();
        snapshot.insert("step".to_string(), json!(step));
        Checkpoint::new(
            lineage,
            parent,
            snapshot,
            PendingWork::Complete,
            CheckpointMetadata::new(CheckpointSource::Step, step),
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("run-1", None, 1);
        let id = store.save(cp.clone()).await.unwrap();

        let loaded = store.load("run-1", &id).await.unwrap();
        assert_eq!(loaded, cp);
        assert_eq!(store.latest_for("run-1").await.unwrap(), Some(id));
    }

    #[tokio::test]
    async fn test_load_unknown_id_is_not_found() {
        let store = InMemoryCheckpointStore::new();
        store.save(checkpoint("run-1", None, 1)).await.unwrap();

        let err = store.load("run-1", "missing").await.unwrap_err();
        assert!(err.is_not_found());

        let err = store.load("other", "missing").await.unwrap_err();
        assert!(matches!(err, CheckpointError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_save_is_append_only() {
        let store = InMemoryCheckpointStore::new();
        let cp = checkpoint("run-1", None, 1);
        store.save(cp.clone()).await.unwrap();

        let err = store.save(cp).await.unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyExists { .. }));
        assert_eq!(store.checkpoint_count().await, 1);
    }

    #[tokio::test]
    async fn test_latest_tracks_last_save_and_chain() {
        let store = InMemoryCheckpointStore::new();
        let first = store.save(checkpoint("run-1", None, 1)).await.unwrap();
        let second = store
            .save(checkpoint("run-1", Some(first.clone()), 2))
            .await
            .unwrap();
        store.save(checkpoint("run-2", None, 1)).await.unwrap();

        assert_eq!(store.latest_for("run-1").await.unwrap(), Some(second.clone()));
        assert_eq!(store.latest_for("nope").await.unwrap(), None);

        let history = store.list("run-1").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].checkpoint_id, first);
        assert_eq!(history[1].parent_id.as_deref(), Some(first.as_str()));

        assert_eq!(store.lineages().await.unwrap(), vec!["run-1", "run-2"]);
        assert_eq!(store.lineage_count().await, 2);

        let latest = store.load_latest("run-1").await.unwrap().unwrap();
        assert_eq!(latest.checkpoint_id, second);
    }

    #[tokio::test]
    async fn test_repeated_loads_are_identical() {
        let store = InMemoryCheckpointStore::new();
        let id = store.save(checkpoint("run-1", None, 3)).await.unwrap();

        let a = store.load("run-1", &id).await.unwrap();
        let b = store.load("run-1", &id).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(serde_json::to_vec(&a).unwrap(), serde_json::to_vec(&b).unwrap());
    }

    #[tokio::test]
    async fn test_rejects_missing_ids() {
        let store = InMemoryCheckpointStore::new();
        let mut cp = checkpoint("", None, 1);
        assert!(matches!(store.save(cp.clone()).await, Err(CheckpointError::Invalid(_))));

        cp.lineage_id = "run".to_string();
        cp.checkpoint_id.clear();
        assert!(matches!(store.save(cp).await, Err(CheckpointError::Invalid(_))));
    }

    #[tokio::test]
    async fn test_clear() {
        let store = InMemoryCheckpointStore::new();
        store.save(checkpoint("run-1", None, 1)).await.unwrap();
        store.clear().await;
        assert_eq!(store.checkpoint_count().await, 0);
    }
}
