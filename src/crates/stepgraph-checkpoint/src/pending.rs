//! Pending-work descriptors persisted alongside state snapshots
//!
//! A checkpoint stores the merged state plus enough scheduler bookkeeping to
//! continue the run later. The two engines need different bookkeeping:
//!
//! - [`SuperstepFrontier`] - the BSP engine resumes at a round. It records the
//!   nodes planned for that round, results of siblings that already finished,
//!   and the nodes that suspended.
//! - [`DataflowFrontier`] - the DAG engine resumes with a readiness frontier.
//!   It records queued nodes in dispatch order, partial join arrivals, the
//!   execution counter, suspended nodes and failed branches.
//!
//! Both are plain data. Interpretation lives in the schedulers.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// An interrupt raised by a node and not yet resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingInterrupt {
    /// Node that raised the interrupt
    pub node: String,
    /// Interrupt key the resume command must answer
    pub key: String,
    /// Prompt payload shown to the caller
    pub prompt: Value,
    /// Resume values the node had already consumed before suspending again
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resolved: BTreeMap<String, Value>,
}

impl PendingInterrupt {
    pub fn new(node: impl Into<String>, key: impl Into<String>, prompt: Value) -> Self {
        Self {
            node: node.into(),
            key: key.into(),
            prompt,
            resolved: BTreeMap::new(),
        }
    }
}

/// Recorded outcome of a node that completed before the run suspended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskRecord {
    /// Node produced a partial update (not yet merged)
    Updated { update: Value },
    /// Node failed; the message is kept for routing and reporting
    Failed { error: String },
}

/// Nodes waiting on a join, mapped to the predecessors that already arrived
pub type JoinArrivals = BTreeMap<String, BTreeSet<String>>;

/// BSP bookkeeping: everything needed to re-enter a round
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuperstepFrontier {
    /// Round to execute on resume (1-based)
    pub step: u64,
    /// Nodes planned for that round, ascending id order
    pub planned: Vec<String>,
    /// Results already produced by planned nodes, keyed by node id
    #[serde(default)]
    pub completed: BTreeMap<String, TaskRecord>,
    /// Planned nodes that suspended
    #[serde(default)]
    pub interrupts: Vec<PendingInterrupt>,
    /// Partial join arrivals carried to later rounds
    #[serde(default)]
    pub arrivals: JoinArrivals,
}

/// A node queued for dispatch in the DAG engine
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReadyEntry {
    /// Readiness sequence number; lower values were ready earlier
    pub seq: u64,
    /// Node id, the tie-breaker within one sequence number
    pub node: String,
}

/// DAG bookkeeping: the readiness frontier at the time of the checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataflowFrontier {
    /// Node executions performed so far
    pub executions: u64,
    /// Next readiness sequence number to hand out
    pub next_seq: u64,
    /// Nodes ready to run, in dispatch order
    #[serde(default)]
    pub ready: Vec<ReadyEntry>,
    /// Partial join arrivals
    #[serde(default)]
    pub arrivals: JoinArrivals,
    /// Nodes that suspended and must be dispatched again first
    #[serde(default)]
    pub interrupts: Vec<PendingInterrupt>,
    /// Nodes whose failure had no fallback route
    #[serde(default)]
    pub failed: Vec<String>,
}

/// Scheduler-internal work remaining at a checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "snake_case")]
pub enum PendingWork {
    /// Checkpoint written by the BSP engine
    Superstep(SuperstepFrontier),
    /// Checkpoint written by the DAG engine
    Dataflow(DataflowFrontier),
    /// Run finished; nothing is left to schedule
    Complete,
}

impl PendingWork {
    /// Interrupts recorded in this descriptor
    pub fn interrupts(&self) -> &[PendingInterrupt] {
        match self {
            PendingWork::Superstep(frontier) => &frontier.interrupts,
            PendingWork::Dataflow(frontier) => &frontier.interrupts,
            PendingWork::Complete => &[],
        }
    }

    /// Whether the descriptor still holds unresolved interrupts
    pub fn is_suspended(&self) -> bool {
        !self.interrupts().is_empty()
    }

    /// Engine label used in metadata and error messages
    pub fn engine_name(&self) -> &'static str {
        match self {
            PendingWork::Superstep(_) => "bsp",
            PendingWork::Dataflow(_) => "dag",
            PendingWork::Complete => "complete",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_interrupts_accessor() {
        let work = PendingWork::Superstep(SuperstepFrontier {
            step: 2,
            planned: vec!["ask".to_string()],
            interrupts: vec![PendingInterrupt::new("ask", "approval", json!("approve?"))],
            ..Default::default()
        });

        assert!(work.is_suspended());
        assert_eq!(work.interrupts()[0].key, "approval");
        assert!(!PendingWork::Complete.is_suspended());
    }

    #[test]
    fn test_resolved_values_are_omitted_when_empty() {
        let mut pending = PendingInterrupt::new("ask", "second", json!(null));
        let value = serde_json::to_value(&pending).unwrap();
        assert!(value.get("resolved").is_none());

        pending.resolved.insert("first".to_string(), json!("yes"));
        let value = serde_json::to_value(&pending).unwrap();
        assert_eq!(value["resolved"]["first"], "yes");
    }

    #[test]
    fn test_descriptor_is_tagged_by_engine() {
        let work = PendingWork::Dataflow(DataflowFrontier {
            executions: 3,
            next_seq: 4,
            ready: vec![ReadyEntry { seq: 3, node: "b".to_string() }],
            ..Default::default()
        });

        let value = serde_json::to_value(&work).unwrap();
        assert_eq!(value["engine"], "dataflow");
        assert_eq!(value["ready"][0]["node"], "b");
    }

    #[test]
    fn test_ready_entries_order_by_seq_then_node() {
        let mut entries = vec![
            ReadyEntry { seq: 2, node: "a".to_string() },
            ReadyEntry { seq: 1, node: "z".to_string() },
            ReadyEntry { seq: 1, node: "b".to_string() },
        ];
        entries.sort();

        let order: Vec<&str> = entries.iter().map(|e| e.node.as_str()).collect();
        assert_eq!(order, vec!["b", "z", "a"]);
    }
}
