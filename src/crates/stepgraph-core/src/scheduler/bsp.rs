//! Bulk-synchronous superstep engine
//!
//! # Execution Model
//!
//! Each round moves through three phases separated by a global barrier:
//!
//! 1. **Planning**: the nodes made ready by the previous round (entry points
//!    for round 1) become the round's plan, in ascending id order
//! 2. **Executing**: every planned node runs concurrently against the same
//!    round-start snapshot, bounded by `max_concurrency` and `step_timeout`
//! 3. **Updating**: partial updates merge in ascending node-id order, then
//!    routing is evaluated on the merged state
//!
//! ```text
//! round n:  snapshot ──┬─ a ─┐
//!                      ├─ b ─┼─ barrier ─ merge(a, b, c) ─ route ─ round n+1
//!                      └─ c ─┘
//! ```
//!
//! A node failure is that node's result for the round: nothing is merged for
//! it, and after the merge the failure follows its fallback edge or aborts
//! the run with a routing error.
//!
//! # Suspension
//!
//! If any planned node interrupts, no update of the round is merged. The
//! checkpoint keeps the round-start state, the plan, the results of siblings
//! that finished, and the interrupts. On resume only the interrupted nodes
//! run again; the stored sibling results are merged with theirs.

use super::dispatch::{TaskOutcome, TaskResult, WorkerPool};
use super::frontier::Readiness;
use super::{RunContext, RunEnd, Scheduler};
use crate::config::Engine;
use crate::error::{GraphError, Result};
use crate::event::Event;
use crate::graph::{push_unique, NodeId};
use crate::lineage::Origin;
use crate::state::{ResumeCommand, State};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use stepgraph_checkpoint::{
    CheckpointSource, PendingInterrupt, PendingWork, SuperstepFrontier, TaskRecord,
};

pub(crate) struct BspScheduler;

/// Outcome of a planned node once the round has settled
#[derive(Debug, Clone)]
enum Settled {
    Updated(Value),
    Failed(String),
    Interrupted(PendingInterrupt),
}

/// A round waiting to execute
#[derive(Debug, Default)]
struct Round {
    step: u64,
    planned: Vec<NodeId>,
    /// Results carried over from a suspended execution of this round
    completed: BTreeMap<NodeId, TaskRecord>,
    /// Resume values for nodes that interrupted in this round
    resume_for: BTreeMap<NodeId, BTreeMap<String, Value>>,
}

impl Round {
    fn first(entries: &[NodeId]) -> Self {
        let mut planned = entries.to_vec();
        planned.sort();
        planned.dedup();
        Self {
            step: 1,
            planned,
            ..Default::default()
        }
    }

    fn next(step: u64, planned: Vec<NodeId>) -> Self {
        Self {
            step,
            planned,
            ..Default::default()
        }
    }

    fn restore(run: &RunContext, frontier: SuperstepFrontier, command: &ResumeCommand) -> Result<Self> {
        for node in &frontier.planned {
            if !run.graph.contains(node) {
                return Err(GraphError::Invariant(format!(
                    "checkpoint plans unknown node '{}'",
                    node
                )));
            }
        }

        let mut resume_for = BTreeMap::new();
        for interrupt in &frontier.interrupts {
            if !frontier.planned.contains(&interrupt.node) {
                return Err(GraphError::Invariant(format!(
                    "interrupted node '{}' is not planned for round {}",
                    interrupt.node, frontier.step
                )));
            }
            let mut values = interrupt.resolved.clone();
            values.extend(command.values.clone());
            resume_for.insert(interrupt.node.clone(), values);
        }

        Ok(Self {
            step: frontier.step.max(1),
            planned: frontier.planned,
            completed: frontier.completed,
            resume_for,
        })
    }
}

#[async_trait]
impl Scheduler for BspScheduler {
    fn engine(&self) -> Engine {
        Engine::Bsp
    }

    async fn run(
        &self,
        run: &mut RunContext,
        origin: Origin,
        input: BTreeMap<String, Value>,
    ) -> Result<RunEnd> {
        let (mut values, mut round, mut readiness) = match origin {
            Origin::Fresh => (input, Round::first(run.graph.entries()), Readiness::default()),
            Origin::Resume { checkpoint, command } => {
                let checkpoint = *checkpoint;
                match checkpoint.pending {
                    PendingWork::Complete => {
                        return Ok(RunEnd::Completed {
                            values: checkpoint.snapshot,
                            checkpoint_id: Some(checkpoint.checkpoint_id),
                        })
                    }
                    PendingWork::Superstep(frontier) => {
                        let readiness = Readiness::new(frontier.arrivals.clone());
                        let round = Round::restore(run, frontier, &command)?;
                        (checkpoint.snapshot, round, readiness)
                    }
                    PendingWork::Dataflow(_) => {
                        return Err(GraphError::Invariant(
                            "dataflow checkpoint handed to the superstep engine".to_string(),
                        ))
                    }
                }
            }
        };

        let max_steps = run.options.max_steps;
        loop {
            if round.planned.is_empty() {
                return finish(run, round.step.saturating_sub(1), values).await;
            }
            if round.step > max_steps {
                tracing::error!(step = round.step, limit = max_steps, "Round limit exceeded");
                return Err(GraphError::StepLimitExceeded { limit: max_steps });
            }

            tracing::debug!(step = round.step, nodes = ?round.planned, "Executing round");
            run.events
                .emit(Event::Step {
                    step: round.step,
                    nodes: round.planned.clone(),
                })
                .await;

            let snapshot = State::from_values(values.clone());
            let results = execute_round(run, &round, snapshot).await?;
            let settled = settle(&mut round, results);

            let interrupts: Vec<PendingInterrupt> = settled
                .values()
                .filter_map(|outcome| match outcome {
                    Settled::Interrupted(pending) => Some(pending.clone()),
                    _ => None,
                })
                .collect();
            if !interrupts.is_empty() {
                let frontier = SuperstepFrontier {
                    step: round.step,
                    planned: round.planned.clone(),
                    completed: records(&settled),
                    interrupts: interrupts.clone(),
                    arrivals: readiness.arrivals().clone(),
                };
                let checkpoint_id = run
                    .checkpoint(
                        CheckpointSource::Interrupt,
                        round.step,
                        &values,
                        PendingWork::Superstep(frontier),
                    )
                    .await?
                    .ok_or_else(|| {
                        GraphError::Invariant("interrupt checkpoint was not written".to_string())
                    })?;
                run.announce_interrupts(&interrupts, &checkpoint_id).await;
                return Ok(RunEnd::Suspended);
            }

            let graph = run.graph.clone();
            graph.schema().merge_all(
                &mut values,
                settled.iter().filter_map(|(node, outcome)| match outcome {
                    Settled::Updated(update) => Some((node.as_str(), update)),
                    _ => None,
                }),
            )?;

            let merged = State::from_values(values.clone());
            let mut next: Vec<NodeId> = Vec::new();
            let mut finished = false;
            let mut unroutable = Vec::new();
            for (node, outcome) in &settled {
                match outcome {
                    Settled::Updated(_) => {
                        let successors = graph.successors(node, &merged)?;
                        if successors.is_empty() && graph.is_finish(node) {
                            finished = true;
                        }
                        for ready in readiness.advance(&graph, node, &successors) {
                            push_unique(&mut next, &ready);
                        }
                    }
                    Settled::Failed(error) => {
                        let fallbacks = graph.fallbacks(node);
                        if fallbacks.is_empty() {
                            unroutable.push(format!("'{}' ({})", node, error));
                        }
                        for fallback in fallbacks {
                            tracing::info!(node = %node, fallback = %fallback, "Routing failure to fallback");
                            push_unique(&mut next, &fallback);
                        }
                    }
                    Settled::Interrupted(_) => {}
                }
            }

            if !unroutable.is_empty() {
                return Err(GraphError::Routing(format!(
                    "node failure without a fallback route: {}",
                    unroutable.join(", ")
                )));
            }
            if finished {
                return finish(run, round.step, values).await;
            }

            if next.is_empty() {
                next = readiness.release_partial();
            }
            next.sort();
            next.dedup();
            for node in &next {
                readiness.dispatched(node);
            }

            let completed_step = round.step;
            round = Round::next(completed_step + 1, next);
            if !round.planned.is_empty() {
                let frontier = SuperstepFrontier {
                    step: round.step,
                    planned: round.planned.clone(),
                    arrivals: readiness.arrivals().clone(),
                    ..Default::default()
                };
                run.checkpoint(
                    CheckpointSource::Step,
                    completed_step,
                    &values,
                    PendingWork::Superstep(frontier),
                )
                .await?;
            }
        }
    }
}

/// Run every planned node that has no stored result yet; barrier on all of them
async fn execute_round(run: &RunContext, round: &Round, snapshot: State) -> Result<Vec<TaskResult>> {
    let token = run.cancel.child_token();
    let mut pool = WorkerPool::new(run.options.max_concurrency);
    for node in &round.planned {
        if round.completed.contains_key(node) {
            continue;
        }
        let resume = round.resume_for.get(node).cloned().unwrap_or_default();
        pool.spawn_queued(run.node_task(node, round.step, snapshot.clone(), token.child_token(), resume)?);
    }

    let result = match run.options.step_timeout {
        Some(limit) => match tokio::time::timeout(limit, collect(run, &mut pool)).await {
            Ok(result) => result,
            Err(_) => {
                tracing::error!(step = round.step, timeout_ms = limit.as_millis() as u64, "Round deadline exceeded");
                Err(GraphError::StepTimeout {
                    step: round.step,
                    timeout: limit,
                })
            }
        },
        None => collect(run, &mut pool).await,
    };

    if result.is_err() {
        token.cancel();
        pool.shutdown().await;
    }
    result
}

async fn collect(run: &RunContext, pool: &mut WorkerPool) -> Result<Vec<TaskResult>> {
    let mut results = Vec::with_capacity(pool.len());
    loop {
        tokio::select! {
            biased;
            _ = run.cancel.cancelled() => return Err(run.cancelled_error()),
            joined = pool.join_next() => match joined {
                Some(result) => {
                    let result = result?;
                    run.emit_node_end(&result).await;
                    results.push(result);
                }
                None => return Ok(results),
            },
        }
    }
}

/// Combine stored sibling results with this execution's results
fn settle(round: &mut Round, results: Vec<TaskResult>) -> BTreeMap<NodeId, Settled> {
    let mut settled: BTreeMap<NodeId, Settled> = std::mem::take(&mut round.completed)
        .into_iter()
        .map(|(node, record)| {
            let outcome = match record {
                TaskRecord::Updated { update } => Settled::Updated(update),
                TaskRecord::Failed { error } => Settled::Failed(error),
            };
            (node, outcome)
        })
        .collect();

    for result in results {
        let outcome = match result.outcome {
            TaskOutcome::Updated(update) => Settled::Updated(update),
            TaskOutcome::Failed(error) => Settled::Failed(error.to_string()),
            TaskOutcome::Interrupted(interrupt) => Settled::Interrupted(PendingInterrupt {
                node: result.node.clone(),
                key: interrupt.key,
                prompt: interrupt.prompt,
                resolved: (*result.resume).clone(),
            }),
        };
        settled.insert(result.node, outcome);
    }
    settled
}

fn records(settled: &BTreeMap<NodeId, Settled>) -> BTreeMap<NodeId, TaskRecord> {
    settled
        .iter()
        .filter_map(|(node, outcome)| {
            let record = match outcome {
                Settled::Updated(update) => TaskRecord::Updated {
                    update: update.clone(),
                },
                Settled::Failed(error) => TaskRecord::Failed {
                    error: error.clone(),
                },
                Settled::Interrupted(_) => return None,
            };
            Some((node.clone(), record))
        })
        .collect()
}

async fn finish(run: &mut RunContext, step: u64, values: BTreeMap<String, Value>) -> Result<RunEnd> {
    let checkpoint_id = match run
        .checkpoint(CheckpointSource::Final, step, &values, PendingWork::Complete)
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
