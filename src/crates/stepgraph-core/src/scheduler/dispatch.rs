//! Node invocation: hooks, timeout, retries, panic capture, worker slots
//!
//! [`NodeTask`] is everything a spawned worker needs to run one node. The
//! coordinator builds it, hands it to the [`WorkerPool`], and later receives a
//! [`TaskResult`] back through the pool's `JoinSet`.
//!
//! ```text
//! attempt n:  [ before-hook ─ body ─ after-hook ]   <- inside node_timeout
//!                      │ Err(NodeExecution)
//!                      └─ retry policy allows n+1? ── sleep(backoff) ── attempt n+1
//! ```
//!
//! Failures never escape as panics or task errors: a panic inside a body is
//! captured and reported as that node's failure.

use crate::error::GraphError;
use crate::event::EventSink;
use crate::graph::{Node, NodeId};
use crate::hooks::{HookAction, HookChain};
use crate::node::{Interrupt, NodeContext};
use crate::retry::RetryPolicy;
use crate::state::State;
use futures::FutureExt;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

#[derive(Debug)]
pub(crate) enum TaskOutcome {
    /// Update to merge (a before-hook substitute counts as an update)
    Updated(Value),
    Failed(Arc<GraphError>),
    Interrupted(Interrupt),
}

#[derive(Debug)]
pub(crate) struct TaskResult {
    pub node: NodeId,
    pub step: u64,
    pub outcome: TaskOutcome,
    /// Resume values the invocation had access to
    pub resume: Arc<BTreeMap<String, Value>>,
}

pub(crate) struct NodeTask {
    pub node: Node,
    pub ctx: NodeContext,
    pub state: State,
    pub hooks: Arc<HookChain>,
    pub retry: Option<RetryPolicy>,
    pub timeout: Option<Duration>,
    pub events: EventSink,
}

impl NodeTask {
    pub async fn run(self) -> TaskResult {
        self.events.node_start(&self.node.id, self.ctx.step()).await;

        let outcome = self.run_attempts().await;
        TaskResult {
            node: self.node.id.clone(),
            step: self.ctx.step(),
            outcome,
            resume: Arc::new(self.ctx.resume_values().clone()),
        }
    }

    async fn run_attempts(&self) -> TaskOutcome {
        let mut attempt = 1;
        loop {
            let ctx = self.ctx.for_attempt(attempt);
            tracing::debug!(node = %self.node.id, step = ctx.step(), attempt, "Executing node");

            let error = match self.attempt(&ctx).await {
                Ok(update) => return TaskOutcome::Updated(update),
                Err(GraphError::Interrupted { interrupt, .. }) => {
                    return TaskOutcome::Interrupted(interrupt)
                }
                Err(error) => error,
            };

            let retry = self
                .retry
                .as_ref()
                .filter(|policy| error.is_retryable() && policy.allows_attempt(attempt + 1));
            match retry {
                Some(policy) => {
                    let delay = policy.delay_after(attempt);
                    tracing::warn!(
                        node = %self.node.id,
                        attempt,
                        max_attempts = policy.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Node failed, retrying after delay"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = ctx.cancelled() => {
                            return TaskOutcome::Failed(Arc::new(cancelled(&self.node.id)));
                        }
                    }
                    attempt += 1;
                }
                None => {
                    tracing::warn!(node = %self.node.id, attempt, error = %error, "Node failed");
                    self.hooks.on_error(&ctx, &error).await;
                    return TaskOutcome::Failed(Arc::new(error));
                }
            }
        }
    }

    /// One attempt, bounded by the node timeout and the cancellation token
    async fn attempt(&self, ctx: &NodeContext) -> Result<Value, GraphError> {
        let node_id = self.node.id.as_str();
        let work = async {
            if let HookAction::Skip(update) = self.hooks.before(ctx, &self.state).await? {
                tracing::debug!(node = %node_id, "Node skipped by hook");
                return normalize(node_id, update);
            }
            let update = (self.node.body)(ctx.clone(), self.state.clone()).await?;
            let update = normalize(node_id, update)?;
            self.hooks.after(ctx, &update).await?;
            Ok(update)
        };

        let guarded = AssertUnwindSafe(work).catch_unwind().map(|result| {
            result.unwrap_or_else(|panic| {
                Err(GraphError::node_execution(
                    node_id,
                    format!("node panicked: {}", panic_message(panic.as_ref())),
                ))
            })
        });

        let timed = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, guarded)
                    .await
                    .unwrap_or_else(|_| {
                        Err(GraphError::NodeTimeout {
                            node: node_id.to_string(),
                            timeout: limit,
                        })
                    }),
                None => guarded.await,
            }
        };

        tokio::select! {
            biased;
            _ = ctx.cancelled() => Err(cancelled(node_id)),
            result = timed => result,
        }
    }
}

fn cancelled(node: &str) -> GraphError {
    GraphError::Cancelled(format!("node '{}' was cancelled", node))
}

/// Accept objects and null; anything else is a node failure
fn normalize(node: &str, update: Value) -> Result<Value, GraphError> {
    match update {
        Value::Object(_) => Ok(update),
        Value::Null => Ok(Value::Object(Map::new())),
        other => Err(GraphError::node_execution(
            node,
            format!("node must return an object or null, got {}", other),
        )),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Bounded set of running node tasks
pub(crate) struct WorkerPool {
    permits: Arc<Semaphore>,
    tasks: JoinSet<TaskResult>,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_concurrency.max(1))),
            tasks: JoinSet::new(),
        }
    }

    /// Spawn a task that waits for a worker slot itself (FIFO)
    pub fn spawn_queued(&mut self, task: NodeTask) {
        let permits = self.permits.clone();
        self.tasks.spawn(async move {
            let _permit = permits.acquire_owned().await.ok();
            task.run().await
        });
    }

    /// Claim a worker slot without waiting
    pub fn try_admit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    /// Spawn a task on a slot claimed with [`WorkerPool::try_admit`]
    pub fn spawn_admitted(&mut self, permit: OwnedSemaphorePermit, task: NodeTask) {
        self.tasks.spawn(async move {
            let _permit = permit;
            task.run().await
        });
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Next finished task; `None` once the pool is empty
    pub async fn join_next(&mut self) -> Option<Result<TaskResult, GraphError>> {
        let joined = self.tasks.join_next().await?;
        Some(joined.map_err(|error| {
            if error.is_cancelled() {
                GraphError::Cancelled("node task aborted".to_string())
            } else {
                GraphError::Invariant(format!("node task failed outside its body: {}", error))
            }
        }))
    }

    /// Abort everything still running and wait for the aborts to land
    pub async fn shutdown(&mut self) {
        self.tasks.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStream;
    use crate::hooks::NodeHooks;
    use crate::node::{node_fn, NodeKind};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio_util::sync::CancellationToken;

    fn task(
        body: crate::node::NodeBody,
        retry: Option<RetryPolicy>,
        timeout: Option<Duration>,
    ) -> (NodeTask, EventStream) {
        let (events, stream) = EventSink::channel(64);
        let node = Node {
            id: "n".to_string(),
            kind: NodeKind::Function,
            body,
        };
        let ctx = NodeContext::new(
            "n",
            NodeKind::Function,
            1,
            CancellationToken::new(),
            Arc::new(BTreeMap::new()),
        );
        (
            NodeTask {
                node,
                ctx,
                state: State::new(),
                hooks: Arc::new(HookChain::default()),
                retry,
                timeout,
                events,
            },
            stream,
        )
    }

    #[tokio::test]
    async fn test_null_update_becomes_empty_object() {
        let (task, _) = task(node_fn(|_, _| async { Ok(json!(null)) }), None, None);
        match task.run().await.outcome {
            TaskOutcome::Updated(update) => assert_eq!(update, json!({})),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_object_update_fails() {
        let (task, _) = task(node_fn(|_, _| async { Ok(json!(42)) }), None, None);
        assert!(matches!(task.run().await.outcome, TaskOutcome::Failed(_)));
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let (task, _) = task(
            node_fn(|_, _| async {
                if true {
                    panic!("kaboom");
                }
                Ok(json!({}))
            }),
            None,
            None,
        );
        match task.run().await.outcome {
            TaskOutcome::Failed(error) => assert!(error.to_string().contains("kaboom")),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_body_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let body = node_fn(move |ctx: NodeContext, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if ctx.attempt() < 3 {
                    Err(GraphError::node_execution("n", "flaky"))
                } else {
                    Ok(json!({"ok": true}))
                }
            }
        });
        let policy = RetryPolicy::new(3)
            .with_initial_interval(Duration::from_millis(10))
            .with_jitter(false);

        let (task, _) = task(body, Some(policy), None);
        assert!(matches!(task.run().await.outcome, TaskOutcome::Updated(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let body = node_fn(move |_, _| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(json!({}))
            }
        });

        let (task, _) = task(
            body,
            Some(RetryPolicy::new(3).with_jitter(false)),
            Some(Duration::from_millis(100)),
        );
        match task.run().await.outcome {
            TaskOutcome::Failed(error) => {
                assert!(matches!(*error, GraphError::NodeTimeout { .. }))
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_interrupt_is_reported() {
        let body = node_fn(|ctx: NodeContext, _| async move {
            let answer = ctx.interrupt("approval", json!("?"))?;
            Ok(json!({ "answer": answer }))
        });
        let (task, _) = task(body, Some(RetryPolicy::new(3)), None);
        match task.run().await.outcome {
            TaskOutcome::Interrupted(interrupt) => assert_eq!(interrupt.key, "approval"),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    struct Substitute;

    #[async_trait]
    impl NodeHooks for Substitute {
        async fn before(
            &self,
            _ctx: &NodeContext,
            _state: &State,
        ) -> crate::error::Result<HookAction> {
            Ok(HookAction::Skip(json!({"from": "hook"})))
        }
    }

    #[tokio::test]
    async fn test_before_hook_short_circuits_body() {
        let (mut task, _) = task(
            node_fn(|_, _| async { panic!("body must not run") }),
            None,
            None,
        );
        task.hooks = Arc::new(HookChain::new(vec![Arc::new(Substitute)]));
        match task.run().await.outcome {
            TaskOutcome::Updated(update) => assert_eq!(update, json!({"from": "hook"})),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_pool_admission_limit() {
        let pool = WorkerPool::new(1);
        let first = pool.try_admit();
        assert!(first.is_some());
        assert!(pool.try_admit().is_none());
        drop(first);
        assert!(pool.try_admit().is_some());
    }
}
