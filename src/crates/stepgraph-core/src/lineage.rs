//! Lineage bookkeeping between schedulers and the checkpoint store
//!
//! A [`LineageManager`] is created per run. It decides which lineage the run
//! belongs to, loads the checkpoint a resuming run starts from, and chains
//! every checkpoint the run writes to the one before it:
//!
//! ```text
//! fresh run, no lineage  -> new uuid lineage, first checkpoint has no parent
//! fresh run, lineage L   -> parent = latest_for(L)
//! resume L @ C           -> load C, parent = C
//! resume L (no id)       -> load latest_for(L), parent = that checkpoint
//! ```

use crate::config::Engine;
use crate::error::{GraphError, Result};
use crate::event::{Event, EventSink};
use crate::state::{ResumeCommand, StartRequest};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use stepgraph_checkpoint::{
    Checkpoint, CheckpointError, CheckpointId, CheckpointMetadata, CheckpointSource,
    CheckpointStore, LineageId, PendingWork,
};
use uuid::Uuid;

/// Where a run starts from
#[derive(Debug)]
pub(crate) enum Origin {
    Fresh,
    Resume {
        checkpoint: Box<Checkpoint>,
        command: ResumeCommand,
    },
}

pub(crate) struct LineageManager {
    store: Arc<dyn CheckpointStore>,
    lineage_id: LineageId,
    head: Option<CheckpointId>,
    engine: Engine,
    invocation_id: String,
    /// Invocation tags copied into every checkpoint's metadata
    tags: BTreeMap<String, serde_json::Value>,
    events: EventSink,
}

impl LineageManager {
    /// Resolve the lineage for a run and load its resume point
    pub async fn open(
        store: Arc<dyn CheckpointStore>,
        engine: Engine,
        invocation_id: &str,
        events: EventSink,
        request: StartRequest,
    ) -> Result<(Self, Origin)> {
        let (lineage_id, head, origin) = match request {
            StartRequest::Fresh { lineage_id: None } => {
                (Uuid::new_v4().to_string(), None, Origin::Fresh)
            }
            StartRequest::Fresh {
                lineage_id: Some(lineage_id),
            } => {
                let head = store.latest_for(&lineage_id).await?;
                (lineage_id, head, Origin::Fresh)
            }
            StartRequest::Resume {
                lineage_id,
                checkpoint_id,
                command,
            } => {
                let checkpoint_id = match checkpoint_id {
                    Some(id) => id,
                    None => store
                        .latest_for(&lineage_id)
                        .await?
                        .ok_or_else(|| CheckpointError::not_found(&lineage_id, "latest"))?,
                };
                let checkpoint = store.load(&lineage_id, &checkpoint_id).await?;
                check_engine(engine, &checkpoint)?;

                tracing::info!(
                    lineage_id = %lineage_id,
                    checkpoint_id = %checkpoint_id,
                    pending = checkpoint.pending.interrupts().len(),
                    "Resuming from checkpoint"
                );
                (
                    lineage_id,
                    Some(checkpoint_id),
                    Origin::Resume {
                        checkpoint: Box::new(checkpoint),
                        command,
                    },
                )
            }
        };

        Ok((
            Self {
                store,
                lineage_id,
                head,
                engine,
                invocation_id: invocation_id.to_string(),
                tags: BTreeMap::new(),
                events,
            },
            origin,
        ))
    }

    pub fn with_tags(mut self, tags: BTreeMap<String, serde_json::Value>) -> Self {
        self.tags = tags;
        self
    }

    pub fn lineage_id(&self) -> &str {
        &self.lineage_id
    }

    /// Most recent checkpoint of this run's lineage
    pub fn head(&self) -> Option<&str> {
        self.head.as_deref()
    }

    /// Save a checkpoint chained to the current head and announce it
    pub async fn record(
        &mut self,
        source: CheckpointSource,
        step: u64,
        snapshot: &BTreeMap<String, serde_json::Value>,
        pending: PendingWork,
    ) -> Result<CheckpointId> {
        let mut metadata = CheckpointMetadata::new(source, step)
            .with_extra("engine", json!(self.engine.to_string()))
            .with_extra("invocation_id", json!(self.invocation_id));
        if !self.tags.is_empty() {
            metadata = metadata.with_extra("tags", json!(self.tags));
        }
        let checkpoint = Checkpoint::new(
            self.lineage_id.clone(),
            self.head.clone(),
            snapshot.clone(),
            pending,
            metadata,
        );
        let parent_id = checkpoint.parent_id.clone();

        let checkpoint_id = self.store.save(checkpoint).await?;
        tracing::info!(
            lineage_id = %self.lineage_id,
            checkpoint_id = %checkpoint_id,
            step,
            source = ?source,
            "Checkpoint saved"
        );

        self.events
            .emit(Event::Checkpoint {
                lineage_id: self.lineage_id.clone(),
                checkpoint_id: checkpoint_id.clone(),
                parent_id,
                step,
                source,
            })
            .await;
        self.head = Some(checkpoint_id.clone());
        Ok(checkpoint_id)
    }
}

fn check_engine(engine: Engine, checkpoint: &Checkpoint) -> Result<()> {
    let matches = match (&checkpoint.pending, engine) {
        (PendingWork::Complete, _) => true,
        (PendingWork::Superstep(_), Engine::Bsp) => true,
        (PendingWork::Dataflow(_), Engine::Dag) => true,
        _ => false,
    };
    if matches {
        Ok(())
    } else {
        Err(GraphError::Usage(format!(
            "checkpoint '{}' was written by the {} engine and cannot be resumed with {}",
            checkpoint.checkpoint_id,
            checkpoint.pending.engine_name(),
            engine
        )))
    }
}
