//! Storage trait for checkpoint backends
//!
//! [`CheckpointStore`] is the contract both schedulers rely on:
//!
//! - `save` is append-only. Writing an id that already exists in the lineage
//!   fails with [`CheckpointError::AlreadyExists`](crate::CheckpointError::AlreadyExists).
//! - `load` fails with [`CheckpointError::NotFound`](crate::CheckpointError::NotFound)
//!   for an unknown lineage or id, and returns identical content on every call.
//! - `latest_for` names the most recently saved checkpoint of a lineage.
//!
//! A durable backend must honor the same contract with crash-safe writes. The
//! crate ships [`InMemoryCheckpointStore`](crate::InMemoryCheckpointStore) for
//! process-lifetime storage.
//!
//! # Implementing a backend
//!
//! ```rust,ignore
//! use async_trait::async_trait;
//! use stepgraph_checkpoint::{Checkpoint, CheckpointStore, CheckpointSummary, Result};
//!
//! struct SqliteStore { /* connection pool */ }
//!
//! #[async_trait]
//! impl CheckpointStore for SqliteStore {
//!     async fn save(&self, checkpoint: Checkpoint) -> Result<String> {
//!         // INSERT ... (lineage_id, checkpoint_id, body) with a unique key
//!         Ok(checkpoint.checkpoint_id)
//!     }
//!     // load, latest_for, list, lineages ...
//! #   async fn load(&self, _: &str, _: &str) -> Result<Checkpoint> { todo!() }
//! #   async fn latest_for(&self, _: &str) -> Result<Option<String>> { todo!() }
//! #   async fn list(&self, _: &str) -> Result<Vec<CheckpointSummary>> { todo!() }
//! #   async fn lineages(&self) -> Result<Vec<String>> { todo!() }
//! }
//! ```

use crate::checkpoint::{Checkpoint, CheckpointId, CheckpointSummary};
use crate::error::Result;
use async_trait::async_trait;

/// Persistence backend for checkpoints, keyed by lineage then checkpoint id
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Append a checkpoint to its lineage and return its id
    async fn save(&self, checkpoint: Checkpoint) -> Result<CheckpointId>;

    /// Load a checkpoint by lineage and id
    async fn load(&self, lineage_id: &str, checkpoint_id: &str) -> Result<Checkpoint>;

    /// Id of the most recently saved checkpoint in a lineage
    async fn latest_for(&self, lineage_id: &str) -> Result<Option<CheckpointId>>;

    /// Checkpoints of a lineage, oldest first
    async fn list(&self, lineage_id: &str) -> Result<Vec<CheckpointSummary>>;

    /// All known lineage ids
    async fn lineages(&self) -> Result<Vec<String>>;

    /// Load the most recent checkpoint of a lineage, if any
    async fn load_latest(&self, lineage_id: &str) -> Result<Option<Checkpoint>> {
        match self.latest_for(lineage_id).await? {
            Some(checkpoint_id) => Ok(Some(self.load(lineage_id, &checkpoint_id).await?)),
            None => Ok(None),
        }
    }
}
