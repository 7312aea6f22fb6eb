//! Schedulers: the superstep (BSP) and dataflow (DAG) engines
//!
//! Both engines implement [`Scheduler`] and share the same building blocks:
//!
//! - [`RunContext`]: per-run handles (graph, options, events, lineage, token)
//! - [`frontier::Readiness`]: join bookkeeping
//! - [`dispatch`]: node invocation and the bounded worker pool
//!
//! The engine owns all mutable run state. Node tasks only ever see a
//! snapshot of the state and hand their update back through the pool.

pub(crate) mod bsp;
pub(crate) mod dag;
pub(crate) mod dispatch;
pub(crate) mod frontier;

use crate::config::{CheckpointCadence, Engine};
use crate::error::{GraphError, Result};
use crate::event::{Event, EventSink};
use crate::executor::ExecutorOptions;
use crate::graph::Graph;
use crate::hooks::HookChain;
use crate::lineage::{LineageManager, Origin};
use crate::state::State;
use async_trait::async_trait;
use dispatch::{NodeTask, TaskOutcome, TaskResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use stepgraph_checkpoint::{CheckpointId, CheckpointSource, PendingInterrupt, PendingWork};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub(crate) use bsp::BspScheduler;
pub(crate) use dag::DagScheduler;

/// Handles shared by the coordinator for the duration of one run
pub(crate) struct RunContext {
    pub graph: Arc<Graph>,
    pub options: Arc<ExecutorOptions>,
    pub events: EventSink,
    pub lineage: LineageManager,
    /// Run token; fired by `Executor::cancel` or the invocation deadline
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
    pub hooks: Arc<HookChain>,
}

impl RunContext {
    /// Build the task for one invocation of `node`
    pub fn node_task(
        &self,
        node: &str,
        step: u64,
        state: State,
        token: CancellationToken,
        resume: BTreeMap<String, Value>,
    ) -> Result<NodeTask> {
        let node = self.graph.node(node).cloned().ok_or_else(|| {
            GraphError::Invariant(format!("scheduled node '{}' is not part of the graph", node))
        })?;
        let ctx = crate::node::NodeContext::new(
            node.id.clone(),
            node.kind,
            step,
            token,
            Arc::new(resume),
        );
        Ok(NodeTask {
            node,
            ctx,
            state,
            hooks: self.hooks.clone(),
            retry: self.options.retry.clone(),
            timeout: self.options.node_timeout,
            events: self.events.clone(),
        })
    }

    /// Write a checkpoint if the cadence asks for one
    ///
    /// Interrupt checkpoints are always written.
    pub async fn checkpoint(
        &mut self,
        source: CheckpointSource,
        step: u64,
        values: &BTreeMap<String, Value>,
        pending: PendingWork,
    ) -> Result<Option<CheckpointId>> {
        let wanted = match (self.options.checkpoint_cadence, source) {
            (_, CheckpointSource::Interrupt) => true,
            (CheckpointCadence::EveryStep, _) => true,
            (CheckpointCadence::InterruptOnly, _) => false,
        };
        if !wanted {
            return Ok(None);
        }
        self.lineage.record(source, step, values, pending).await.map(Some)
    }

    /// Emit one interrupt event per pending interrupt
    pub async fn announce_interrupts(&self, interrupts: &[PendingInterrupt], checkpoint_id: &str) {
        for pending in interrupts {
            tracing::info!(
                node = %pending.node,
                key = %pending.key,
                lineage_id = %self.lineage.lineage_id(),
                checkpoint_id = %checkpoint_id,
                "Run suspended on interrupt"
            );
            self.events
                .emit(Event::Interrupt {
                    node: pending.node.clone(),
                    key: pending.key.clone(),
                    prompt: pending.prompt.clone(),
                    lineage_id: self.lineage.lineage_id().to_string(),
                    checkpoint_id: checkpoint_id.to_string(),
                })
                .await;
        }
    }

    pub async fn emit_node_end(&self, result: &TaskResult) {
        let (update, error) = match &result.outcome {
            TaskOutcome::Updated(update) => (Some(update.clone()), None),
            TaskOutcome::Failed(error) => (None, Some(error.clone())),
            TaskOutcome::Interrupted(_) => (None, None),
        };
        self.events
            .emit(Event::NodeEnd {
                node: result.node.clone(),
                step: result.step,
                elapsed: self.events.elapsed(),
                update,
                error,
            })
            .await;
    }

    /// Error for a fired run token
    pub fn cancelled_error(&self) -> GraphError {
        let reason = match self.deadline {
            Some(deadline) if Instant::now() >= deadline => "invocation deadline exceeded",
            _ => "cancelled by caller",
        };
        GraphError::Cancelled(reason.to_string())
    }
}

/// How a scheduler left the run
#[derive(Debug)]
pub(crate) enum RunEnd {
    Completed {
        values: BTreeMap<String, Value>,
        checkpoint_id: Option<CheckpointId>,
    },
    /// Interrupt checkpoint written and interrupt events emitted
    Suspended,
}

#[async_trait]
pub(crate) trait Scheduler: Send + Sync {
    fn engine(&self) -> Engine;

    async fn run(
        &self,
        run: &mut RunContext,
        origin: Origin,
        input: BTreeMap<String, Value>,
    ) -> Result<RunEnd>;
}

/// Scheduler for an engine
pub(crate) fn for_engine(engine: Engine) -> Box<dyn Scheduler> {
    match engine {
        Engine::Bsp => Box::new(BspScheduler),
        Engine::Dag => Box::new(DagScheduler),
    }
}
