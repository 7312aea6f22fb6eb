//! Eager dataflow engine
//!
//! There are no rounds. A node is dispatched as soon as it is ready and a
//! worker slot is free; each completion merges its update immediately and
//! evaluates only that node's out-edges.
//!
//! ```text
//!            ┌─ slow_a ───────────────┐
//!  split ────┤                        ├─ join
//!            └─ fast_b ─ fast_b_next ─┘
//!                        ^ starts as soon as fast_b merges
//! ```
//!
//! The ready set is ordered by readiness sequence, then node id. All nodes
//! made ready by one completion share a sequence number.
//!
//! Termination:
//! - nothing ready and nothing in flight (after releasing partial joins)
//! - a finish point completed with no further routes: admission stops and
//!   in-flight nodes drain
//! - an interrupt: admission stops, in-flight nodes drain, then the run
//!   suspends with the readiness frontier in its checkpoint
//! - the execution limit or a fatal error
//!
//! A failure with a fallback edge routes there. Without one only that branch
//! stops; siblings run on and the run finally fails with a routing error
//! naming the failed nodes.

use super::dispatch::{TaskOutcome, TaskResult, WorkerPool};
use super::frontier::Readiness;
use super::{RunContext, RunEnd, Scheduler};
use crate::config::{CheckpointCadence, Engine};
use crate::error::{GraphError, Result};
use crate::graph::NodeId;
use crate::lineage::Origin;
use crate::state::{ResumeCommand, State};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use stepgraph_checkpoint::{
    CheckpointSource, DataflowFrontier, PendingInterrupt, PendingWork, ReadyEntry,
};
use tokio_util::sync::CancellationToken;

pub(crate) struct DagScheduler;

#[async_trait]
impl Scheduler for DagScheduler {
    fn engine(&self) -> Engine {
        Engine::Dag
    }

    async fn run(
        &self,
        run: &mut RunContext,
        origin: Origin,
        input: BTreeMap<String, Value>,
    ) -> Result<RunEnd> {
        let (values, mut flow) = match origin {
            Origin::Fresh => (input, Dataflow::fresh(run)),
            Origin::Resume { checkpoint, command } => {
                let checkpoint = *checkpoint;
                match checkpoint.pending {
                    PendingWork::Complete => {
                        return Ok(RunEnd::Completed {
                            values: checkpoint.snapshot,
                            checkpoint_id: Some(checkpoint.checkpoint_id),
                        })
                    }
                    PendingWork::Dataflow(frontier) => {
                        (checkpoint.snapshot, Dataflow::restore(run, frontier, &command)?)
                    }
                    PendingWork::Superstep(_) => {
                        return Err(GraphError::Invariant(
                            "superstep checkpoint handed to the dataflow engine".to_string(),
                        ))
                    }
                }
            }
        };

        let mut pool = WorkerPool::new(run.options.max_concurrency);
        let result = flow.drive(run, &mut pool, values).await;
        if result.is_err() {
            flow.token.cancel();
            pool.shutdown().await;
        }
        result
    }
}

/// Run-local dataflow state, owned by the coordinator
struct Dataflow {
    ready: BTreeSet<ReadyEntry>,
    queued: BTreeSet<NodeId>,
    /// Running nodes and the sequence they were dispatched with
    in_flight: BTreeMap<NodeId, u64>,
    readiness: Readiness,
    executions: u64,
    next_seq: u64,
    interrupts: Vec<PendingInterrupt>,
    /// Ready entries of interrupted nodes, re-dispatched on resume
    suspended: Vec<ReadyEntry>,
    failed: Vec<NodeId>,
    finishing: bool,
    resume_for: BTreeMap<NodeId, BTreeMap<String, Value>>,
    token: CancellationToken,
}

impl Dataflow {
    fn empty(run: &RunContext) -> Self {
        Self {
            ready: BTreeSet::new(),
            queued: BTreeSet::new(),
            in_flight: BTreeMap::new(),
            readiness: Readiness::default(),
            executions: 0,
            next_seq: 0,
            interrupts: Vec::new(),
            suspended: Vec::new(),
            failed: Vec::new(),
            finishing: false,
            resume_for: BTreeMap::new(),
            token: run.cancel.child_token(),
        }
    }

    fn fresh(run: &RunContext) -> Self {
        let mut flow = Self::empty(run);
        let seq = flow.take_seq();
        for entry in run.graph.entries() {
            flow.enqueue(entry, seq);
        }
        flow
    }

    fn restore(run: &RunContext, frontier: DataflowFrontier, command: &ResumeCommand) -> Result<Self> {
        let mut flow = Self::empty(run);
        flow.executions = frontier.executions;
        flow.next_seq = frontier.next_seq;
        flow.readiness = Readiness::new(frontier.arrivals);
        flow.failed = frontier.failed;

        for entry in frontier.ready {
            if !run.graph.contains(&entry.node) {
                return Err(GraphError::Invariant(format!(
                    "checkpoint queues unknown node '{}'",
                    entry.node
                )));
            }
            flow.next_seq = flow.next_seq.max(entry.seq + 1);
            flow.enqueue(&entry.node, entry.seq);
        }

        for interrupt in frontier.interrupts {
            if !flow.queued.contains(&interrupt.node) {
                return Err(GraphError::Invariant(format!(
                    "interrupted node '{}' is missing from the ready set",
                    interrupt.node
                )));
            }
            let mut values = interrupt.resolved;
            values.extend(command.values.clone());
            flow.resume_for.insert(interrupt.node, values);
        }
        Ok(flow)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    fn enqueue(&mut self, node: &str, seq: u64) {
        if self.queued.insert(node.to_string()) {
            self.ready.insert(ReadyEntry {
                seq,
                node: node.to_string(),
            });
        }
    }

    async fn drive(
        &mut self,
        run: &mut RunContext,
        pool: &mut WorkerPool,
        mut values: BTreeMap<String, Value>,
    ) -> Result<RunEnd> {
        loop {
            self.admit(run, pool, &values)?;

            if pool.is_empty() {
                if !self.interrupts.is_empty() {
                    return self.suspend(run, &values).await;
                }
                if self.finishing {
                    break;
                }
                let released = self.readiness.release_partial();
                if released.is_empty() {
                    break;
                }
                tracing::debug!(nodes = ?released, "Releasing partially joined nodes");
                let seq = self.take_seq();
                for node in &released {
                    self.enqueue(node, seq);
                }
                continue;
            }

            let joined = tokio::select! {
                biased;
                _ = run.cancel.cancelled() => return Err(run.cancelled_error()),
                joined = pool.join_next() => joined,
            };
            if let Some(result) = joined {
                self.complete(run, &mut values, result?).await?;
            }
        }

        if !self.failed.is_empty() {
            return Err(GraphError::Routing(format!(
                "branches stopped by node failures without a fallback route: {}",
                self.failed.join(", ")
            )));
        }

        let checkpoint_id = match run
            .checkpoint(
                CheckpointSource::Final,
                self.executions,
                &values,
                PendingWork::Complete,
            )
            .await?
        {
            Some(id) => Some(id),
            None => run.lineage.head().map(str::to_string),
        };
        Ok(RunEnd::Completed {
            values,
            checkpoint_id,
        })
    }

    /// Dispatch ready nodes while worker slots are free
    fn admit(
        &mut self,
        run: &RunContext,
        pool: &mut WorkerPool,
        values: &BTreeMap<String, Value>,
    ) -> Result<()> {
        if self.finishing || !self.interrupts.is_empty() {
            return Ok(());
        }

        loop {
            let entry = match self
                .ready
                .iter()
                .find(|entry| !self.in_flight.contains_key(&entry.node))
            {
                Some(entry) => entry.clone(),
                None => return Ok(()),
            };

            if self.executions >= run.options.max_steps {
                tracing::error!(
                    node = %entry.node,
                    limit = run.options.max_steps,
                    "Node execution limit exceeded"
                );
                return Err(GraphError::NodeExecutionLimitExceeded {
                    limit: run.options.max_steps,
                });
            }
            let permit = match pool.try_admit() {
                Some(permit) => permit,
                None => return Ok(()),
            };

            self.ready.remove(&entry);
            self.queued.remove(&entry.node);
            self.executions += 1;
            self.readiness.dispatched(&entry.node);

            let resume = self.resume_for.remove(&entry.node).unwrap_or_default();
            let task = run.node_task(
                &entry.node,
                self.executions,
                State::from_values(values.clone()),
                self.token.child_token(),
                resume,
            )?;
            tracing::debug!(node = %entry.node, seq = entry.seq, execution = self.executions, "Dispatching node");
            self.in_flight.insert(entry.node, entry.seq);
            pool.spawn_admitted(permit, task);
        }
    }

    async fn complete(
        &mut self,
        run: &mut RunContext,
        values: &mut BTreeMap<String, Value>,
        result: TaskResult,
    ) -> Result<()> {
        run.emit_node_end(&result).await;
        let seq = self.in_flight.remove(&result.node).ok_or_else(|| {
            GraphError::Invariant(format!("completion for node '{}' that was not in flight", result.node))
        })?;

        let graph = run.graph.clone();
        let node = result.node;
        match result.outcome {
            TaskOutcome::Updated(update) => {
                graph.schema().apply_update(values, &node, &update)?;
                let successors = graph.successors(&node, &State::from_values(values.clone()))?;
                if successors.is_empty() && graph.is_finish(&node) {
                    tracing::info!(node = %node, in_flight = self.in_flight.len(), "Finish point reached, draining");
                    self.finishing = true;
                }
                let ready = self.readiness.advance(&graph, &node, &successors);
                if !ready.is_empty() {
                    let seq = self.take_seq();
                    for next in &ready {
                        self.enqueue(next, seq);
                    }
                }
            }
            TaskOutcome::Failed(error) => {
                let fallbacks = graph.fallbacks(&node);
                if fallbacks.is_empty() {
                    tracing::warn!(node = %node, error = %error, "Branch stopped: no fallback route");
                    self.failed.push(node);
                } else {
                    let seq = self.take_seq();
                    for fallback in &fallbacks {
                        tracing::info!(node = %node, fallback = %fallback, "Routing failure to fallback");
                        self.enqueue(fallback, seq);
                    }
                }
            }
            TaskOutcome::Interrupted(interrupt) => {
                // the node runs again on resume; count it once
                self.executions = self.executions.saturating_sub(1);
                self.interrupts.push(PendingInterrupt {
                    node: node.clone(),
                    key: interrupt.key,
                    prompt: interrupt.prompt,
                    resolved: (*result.resume).clone(),
                });
                self.suspended.push(ReadyEntry { seq, node });
            }
        }

        if run.options.checkpoint_cadence == CheckpointCadence::EveryStep
            && self.interrupts.is_empty()
            && !self.finishing
        {
            let frontier = self.frontier();
            run.checkpoint(
                CheckpointSource::Step,
                self.executions,
                values,
                PendingWork::Dataflow(frontier),
            )
            .await?;
        }
        Ok(())
    }

    async fn suspend(&mut self, run: &mut RunContext, values: &BTreeMap<String, Value>) -> Result<RunEnd> {
        let frontier = self.frontier();
        let interrupts = frontier.interrupts.clone();
        let checkpoint_id = run
            .checkpoint(
                CheckpointSource::Interrupt,
                self.executions,
                values,
                PendingWork::Dataflow(frontier),
            )
            .await?
            .ok_or_else(|| GraphError::Invariant("interrupt checkpoint was not written".to_string()))?;
        run.announce_interrupts(&interrupts, &checkpoint_id).await;
        Ok(RunEnd::Suspended)
    }

    /// Pending-work descriptor; running nodes are recorded as ready
    fn frontier(&self) -> DataflowFrontier {
        let mut ready: BTreeSet<ReadyEntry> = self.ready.clone();
        ready.extend(self.suspended.iter().cloned());
        ready.extend(self.in_flight.iter().map(|(node, seq)| ReadyEntry {
            seq: *seq,
            node: node.clone(),
        }));

        DataflowFrontier {
            executions: self.executions,
            next_seq: self.next_seq,
            ready: ready.into_iter().collect(),
            arrivals: self.readiness.arrivals().clone(),
            interrupts: self.interrupts.clone(),
            failed: self.failed.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(seq: u64, node: &str) -> ReadyEntry {
        ReadyEntry {
            seq,
            node: node.to_string(),
        }
    }

    #[test]
    fn test_ready_order_is_sequence_then_id() {
        let mut ready = BTreeSet::new();
        ready.insert(entry(2, "a"));
        ready.insert(entry(1, "z"));
        ready.insert(entry(1, "b"));

        let order: Vec<_> = ready.into_iter().map(|e| e.node).collect();
        assert_eq!(order, vec!["b", "z", "a"]);
    }
}
