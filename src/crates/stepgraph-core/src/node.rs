//! Node bodies and the per-invocation context handed to them
//!
//! Every node invocation receives a [`NodeContext`] and a read-only copy of the
//! state as it was when the node was dispatched. The context carries the
//! cancellation token for the invocation and the interrupt primitive:
//!
//! ```rust
//! use serde_json::json;
//! use stepgraph_core::node::{node_fn, NodeContext};
//! use stepgraph_core::State;
//!
//! let ask = node_fn(|ctx: NodeContext, _state: State| async move {
//!     let answer = ctx.interrupt("approval", json!("ship it?"))?;
//!     Ok(json!({ "answer": answer }))
//! });
//! # let _ = ask;
//! ```
//!
//! The first time `ask` runs the call to [`NodeContext::interrupt`] fails with
//! [`GraphError::Interrupted`] and the run suspends. When the run is resumed
//! with a command answering `"approval"`, the same call returns the answer.

use crate::error::{GraphError, Result};
use crate::state::State;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by a node body
pub type NodeFuture = Pin<Box<dyn Future<Output = Result<Value>> + Send>>;

/// Node body: `(context, state snapshot) -> partial update`
///
/// The returned value must be a JSON object (fields to merge) or `null`.
pub type NodeBody = Arc<dyn Fn(NodeContext, State) -> NodeFuture + Send + Sync>;

/// Wrap an async closure as a [`NodeBody`]
pub fn node_fn<F, Fut>(f: F) -> NodeBody
where
    F: Fn(NodeContext, State) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Arc::new(move |ctx, state| Box::pin(f(ctx, state)))
}

/// Closed set of node kinds, resolved when the graph is compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Ordinary node producing partial updates
    Function,
    /// Pass-through node whose only job is conditional routing
    Router,
}

/// Suspension request raised by a node body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    pub key: String,
    pub prompt: Value,
}

/// Per-invocation handle given to node bodies
#[derive(Debug, Clone)]
pub struct NodeContext {
    node: String,
    kind: NodeKind,
    step: u64,
    attempt: u32,
    cancel: CancellationToken,
    resume: Arc<BTreeMap<String, Value>>,
}

impl NodeContext {
    pub(crate) fn new(
        node: impl Into<String>,
        kind: NodeKind,
        step: u64,
        cancel: CancellationToken,
        resume: Arc<BTreeMap<String, Value>>,
    ) -> Self {
        Self {
            node: node.into(),
            kind,
            step,
            attempt: 1,
            cancel,
            resume,
        }
    }

    pub(crate) fn for_attempt(&self, attempt: u32) -> Self {
        Self {
            attempt,
            ..self.clone()
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    /// BSP round or DAG execution number this invocation belongs to
    pub fn step(&self) -> u64 {
        self.step
    }

    /// 1-based attempt number under the retry policy
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the invocation has been cancelled
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Resume value supplied for `key`, if any
    pub fn resume_value(&self, key: &str) -> Option<&Value> {
        self.resume.get(key)
    }

    pub(crate) fn resume_values(&self) -> &BTreeMap<String, Value> {
        &self.resume
    }

    /// Ask the caller for input
    ///
    /// Returns the resume value when the current run was resumed with an answer
    /// for `key`; otherwise fails with [`GraphError::Interrupted`], which the
    /// scheduler turns into a suspension. Propagate it with `?`.
    pub fn interrupt(&self, key: impl Into<String>, prompt: Value) -> Result<Value> {
        let key = key.into();
        match self.resume.get(&key) {
            Some(value) => Ok(value.clone()),
            None => Err(GraphError::Interrupted {
                node: self.node.clone(),
                interrupt: Interrupt { key, prompt },
            }),
        }
    }
}
