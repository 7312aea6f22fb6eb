//! Core checkpoint data structures
//!
//! A [`Checkpoint`] is one durable point within a lineage. Lineage ids name a
//! logical run across all of its pause/resume cycles; checkpoint ids name a
//! point inside that lineage. Each checkpoint links to its parent, so a lineage
//! forms a chain that can be walked for replay or audit.
//!
//! ```text
//! lineage "run-7"
//!   cp-1 (parent: none)   step 1, source: step
//!   cp-2 (parent: cp-1)   step 2, source: interrupt   <- resume point
//!   cp-3 (parent: cp-2)   step 2, source: step        <- after resume
//!   cp-4 (parent: cp-3)   step 3, source: final
//! ```
//!
//! Checkpoints are never mutated after they are saved. Later checkpoints
//! supersede earlier ones without deleting them.

use crate::pending::PendingWork;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier of a checkpoint within a lineage
pub type CheckpointId = String;

/// Identifier of a logical run across pause/resume cycles
pub type LineageId = String;

/// Field name to value mapping captured from the run state
pub type StateSnapshot = BTreeMap<String, Value>;

/// Why a checkpoint was written
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointSource {
    /// Written at a round boundary (BSP) or after a node completion (DAG)
    Step,
    /// Written because one or more nodes suspended
    Interrupt,
    /// Written when the run completed
    Final,
}

/// Descriptive data attached to a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// What triggered the checkpoint
    pub source: CheckpointSource,
    /// Round number (BSP) or execution count (DAG) at the time of writing
    pub step: u64,
    /// Wall-clock creation time
    pub created_at: DateTime<Utc>,
    /// Additional custom metadata
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl CheckpointMetadata {
    /// Create metadata stamped with the current time
    pub fn new(source: CheckpointSource, step: u64) -> Self {
        Self {
            source,
            step,
            created_at: Utc::now(),
            extra: BTreeMap::new(),
        }
    }

    /// Add custom metadata
    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// A durable snapshot of run state plus scheduler pending work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Lineage this checkpoint belongs to
    pub lineage_id: LineageId,
    /// Unique id within the lineage
    pub checkpoint_id: CheckpointId,
    /// Previous checkpoint in the lineage, if any
    pub parent_id: Option<CheckpointId>,
    /// Merged state at the time of writing
    pub snapshot: StateSnapshot,
    /// Work the scheduler still has to do
    pub pending: PendingWork,
    /// Source, step and timestamp
    pub metadata: CheckpointMetadata,
}

impl Checkpoint {
    /// Create a checkpoint with a fresh random id
    pub fn new(
        lineage_id: impl Into<LineageId>,
        parent_id: Option<CheckpointId>,
        snapshot: StateSnapshot,
        pending: PendingWork,
        metadata: CheckpointMetadata,
    ) -> Self {
        Self {
            lineage_id: lineage_id.into(),
            checkpoint_id: Uuid::new_v4().to_string(),
            parent_id,
            snapshot,
            pending,
            metadata,
        }
    }

    /// Summary view used when listing a lineage
    pub fn summary(&self) -> CheckpointSummary {
        CheckpointSummary {
            checkpoint_id: self.checkpoint_id.clone(),
            parent_id: self.parent_id.clone(),
            source: self.metadata.source,
            step: self.metadata.step,
            created_at: self.metadata.created_at,
            suspended: self.pending.is_suspended(),
        }
    }
}

/// Lightweight listing entry for a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: CheckpointId,
    pub parent_id: Option<CheckpointId>,
    pub source: CheckpointSource,
    pub step: u64,
    pub created_at: DateTime<Utc>,
    /// Whether the checkpoint holds unresolved interrupts
    pub suspended: bool,
}
