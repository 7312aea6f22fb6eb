//! Error types for checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors raised by checkpoint stores and the checkpoint data model
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No checkpoint with this id exists in the lineage
    #[error("Checkpoint not found: lineage '{lineage_id}', checkpoint '{checkpoint_id}'")]
    NotFound {
        lineage_id: String,
        checkpoint_id: String,
    },

    /// Saves are append-only; a checkpoint id can only be written once per lineage
    #[error("Checkpoint '{checkpoint_id}' already exists in lineage '{lineage_id}'")]
    AlreadyExists {
        lineage_id: String,
        checkpoint_id: String,
    },

    /// Checkpoint content violates the data model
    #[error("Invalid checkpoint: {0}")]
    Invalid(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Backend storage failure
    #[error("Storage error: {0}")]
    Storage(String),
}

impl CheckpointError {
    /// Create a not-found error
    pub fn not_found(lineage_id: impl Into<String>, checkpoint_id: impl Into<String>) -> Self {
        Self::NotFound {
            lineage_id: lineage_id.into(),
            checkpoint_id: checkpoint_id.into(),
        }
    }

    /// Whether this error means the requested checkpoint does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
