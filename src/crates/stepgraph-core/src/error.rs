//! Error types for graph construction and execution
//!
//! All errors implement `std::error::Error` via `thiserror`.
//!
//! # Error Hierarchy
//!
//! ```text
//! GraphError
//! ├── Invalid                      - compile-time graph rule violations (never retried)
//! ├── StepLimitExceeded            - BSP round limit hit
//! ├── NodeExecutionLimitExceeded   - DAG execution limit hit
//! ├── StepTimeout                  - BSP round deadline expired
//! ├── NodeTimeout                  - single node deadline expired
//! ├── NodeExecution                - node body failure
//! ├── Interrupted                  - node suspension (not a failure)
//! ├── Routing                      - failure with no fallback, unknown route target
//! ├── State                        - value violates the state schema
//! ├── Invariant                    - scheduler-internal invariant violated
//! ├── Checkpoint                   - store errors, including not-found on resume
//! ├── Usage                        - caller supplied inconsistent input
//! ├── Cancelled                    - run token fired (deadline or caller)
//! └── Configuration / Serialization / Yaml / Io
//! ```
//!
//! Interrupts travel through `GraphError::Interrupted` so node bodies can use `?`
//! on [`NodeContext::interrupt`](crate::node::NodeContext::interrupt). The
//! schedulers intercept it; it never reaches the caller as a run error.

use crate::node::Interrupt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, GraphError>;

/// Compile-time rule violated by a graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphInvalidError {
    #[error("duplicate node id '{0}'")]
    DuplicateNode(String),

    #[error("node id '{0}' is reserved")]
    ReservedNodeId(String),

    #[error("graph has no entry point")]
    MissingEntryPoint,

    #[error("entry point '{0}' is not a declared node")]
    UnknownEntryPoint(String),

    #[error("edge '{from}' -> '{to}' references an undeclared node")]
    DanglingEdge { from: String, to: String },

    #[error("conditional edge from '{from}' declares unknown target '{target}'")]
    UnknownRouteTarget { from: String, target: String },

    #[error("finish point '{0}' is not a declared node")]
    UnknownFinishPoint(String),

    #[error("finish point '{0}' is unreachable from the entry points")]
    UnreachableFinish(String),
}

/// Copyable classification of a [`GraphError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    GraphInvalid,
    StepLimitExceeded,
    NodeExecutionLimitExceeded,
    StepTimeout,
    NodeTimeout,
    NodeExecution,
    Interrupted,
    Routing,
    State,
    Invariant,
    CheckpointNotFound,
    Checkpoint,
    Usage,
    Cancelled,
    Configuration,
    Serialization,
}

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Graph validation failed: {0}")]
    Invalid(#[from] GraphInvalidError),

    #[error("Step limit exceeded: more than {limit} rounds required")]
    StepLimitExceeded { limit: u64 },

    #[error("Node execution limit exceeded: more than {limit} node executions required")]
    NodeExecutionLimitExceeded { limit: u64 },

    #[error("Round {step} exceeded its deadline of {}ms", timeout.as_millis())]
    StepTimeout { step: u64, timeout: Duration },

    #[error("Node '{node}' exceeded its deadline of {}ms", timeout.as_millis())]
    NodeTimeout { node: String, timeout: Duration },

    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution { node: String, error: String },

    #[error("Node '{node}' interrupted with key '{}'", interrupt.key)]
    Interrupted { node: String, interrupt: Interrupt },

    #[error("Routing error: {0}")]
    Routing(String),

    #[error("State error{}: {error}", field.as_ref().map(|f| format!(" in field '{}'", f)).unwrap_or_default())]
    State { field: Option<String>, error: String },

    #[error("Scheduler invariant violated: {0}")]
    Invariant(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] stepgraph_checkpoint::CheckpointError),

    #[error("Usage error: {0}")]
    Usage(String),

    #[error("Run cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
        }
    }

    pub fn state(field: Option<impl Into<String>>, error: impl Into<String>) -> Self {
        Self::State {
            field: field.map(|f| f.into()),
            error: error.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::Invalid(_) => ErrorKind::GraphInvalid,
            GraphError::StepLimitExceeded { .. } => ErrorKind::StepLimitExceeded,
            GraphError::NodeExecutionLimitExceeded { .. } => ErrorKind::NodeExecutionLimitExceeded,
            GraphError::StepTimeout { .. } => ErrorKind::StepTimeout,
            GraphError::NodeTimeout { .. } => ErrorKind::NodeTimeout,
            GraphError::NodeExecution { .. } => ErrorKind::NodeExecution,
            GraphError::Interrupted { .. } => ErrorKind::Interrupted,
            GraphError::Routing(_) => ErrorKind::Routing,
            GraphError::State { .. } => ErrorKind::State,
            GraphError::Invariant(_) => ErrorKind::Invariant,
            GraphError::Checkpoint(e) if e.is_not_found() => ErrorKind::CheckpointNotFound,
            GraphError::Checkpoint(_) => ErrorKind::Checkpoint,
            GraphError::Usage(_) => ErrorKind::Usage,
            GraphError::Cancelled(_) => ErrorKind::Cancelled,
            GraphError::Configuration(_) => ErrorKind::Configuration,
            GraphError::Serialization(_) | GraphError::Yaml(_) | GraphError::Io(_) => {
                ErrorKind::Serialization
            }
        }
    }

    /// Whether a node failure with this error may be retried
    ///
    /// Interrupts, timeouts and cancellations are never retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GraphError::NodeExecution { .. })
    }

    /// Whether this is a checkpoint-not-found error
    pub fn is_checkpoint_not_found(&self) -> bool {
        self.kind() == ErrorKind::CheckpointNotFound
    }
}
