//! # stepgraph-checkpoint - Durable Points for Graph Runs
//!
//! Checkpoint data model and storage abstraction used by the stepgraph
//! schedulers to suspend and resume runs.
//!
//! ## Overview
//!
//! - [`Checkpoint`] - lineage id, checkpoint id, parent id, state snapshot,
//!   pending-work descriptor and metadata
//! - [`PendingWork`] - engine-specific bookkeeping needed to re-enter a run
//!   ([`SuperstepFrontier`] for BSP, [`DataflowFrontier`] for DAG)
//! - [`CheckpointStore`] - async storage trait (`save`, `load`, `latest_for`)
//! - [`InMemoryCheckpointStore`] - process-lifetime implementation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stepgraph_checkpoint::{
//!     Checkpoint, CheckpointMetadata, CheckpointSource, CheckpointStore,
//!     InMemoryCheckpointStore, PendingWork, StateSnapshot,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = InMemoryCheckpointStore::new();
//!
//!     let checkpoint = Checkpoint::new(
//!         "lineage-1",
//!         None,
//!         StateSnapshot::new(),
//!         PendingWork::Complete,
//!         CheckpointMetadata::new(CheckpointSource::Final, 1),
//!     );
//!     let id = store.save(checkpoint).await?;
//!
//!     let restored = store.load("lineage-1", &id).await?;
//!     assert_eq!(restored.checkpoint_id, id);
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod pending;
pub mod serializer;
pub mod traits;

pub use checkpoint::{
    Checkpoint, CheckpointId, CheckpointMetadata, CheckpointSource, CheckpointSummary, LineageId,
    StateSnapshot,
};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryCheckpointStore;
pub use pending::{
    DataflowFrontier, JoinArrivals, PendingInterrupt, PendingWork, ReadyEntry, SuperstepFrontier,
    TaskRecord,
};
pub use serializer::{JsonSerializer, SerializerProtocol};
pub use traits::CheckpointStore;
