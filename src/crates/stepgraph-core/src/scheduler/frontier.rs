//! Join readiness shared by both engines
//!
//! A node becomes ready in one of two ways:
//!
//! - **immediately**, when a router or fallback edge selects it (and for entry
//!   points when a run starts)
//! - **by join**, once every source of its direct in-edges has arrived since
//!   the node last ran
//!
//! Arrivals are forgotten when the node is dispatched. When a run would
//! otherwise stop while some joins are only partially satisfied (for example a
//! router skipped one of the predecessors), the scheduler releases those nodes
//! in id order with [`Readiness::release_partial`].

use crate::graph::{push_unique, Graph, NodeId, Successors};
use stepgraph_checkpoint::JoinArrivals;

#[derive(Debug, Clone, Default, PartialEq)]
pub(crate) struct Readiness {
    arrivals: JoinArrivals,
}

impl Readiness {
    pub fn new(arrivals: JoinArrivals) -> Self {
        Self { arrivals }
    }

    pub fn arrivals(&self) -> &JoinArrivals {
        &self.arrivals
    }

    /// Apply a completed node's successors; returns nodes that became ready
    ///
    /// Triggered nodes come first (in route order), then joins completed by
    /// this arrival.
    pub fn advance(&mut self, graph: &Graph, from: &str, successors: &Successors) -> Vec<NodeId> {
        let mut ready: Vec<NodeId> = Vec::new();
        for node in &successors.triggered {
            push_unique(&mut ready, node);
        }

        for node in &successors.arrivals {
            let arrived = self.arrivals.entry(node.clone()).or_default();
            arrived.insert(from.to_string());

            let satisfied = graph
                .join_set(node)
                .map(|join| join.is_subset(arrived))
                .unwrap_or(true);
            if satisfied {
                self.arrivals.remove(node);
                push_unique(&mut ready, node);
            }
        }
        ready
    }

    /// Forget arrivals for a node that is being dispatched
    pub fn dispatched(&mut self, node: &str) {
        self.arrivals.remove(node);
    }

    /// Hand out every partially joined node, in id order
    pub fn release_partial(&mut self) -> Vec<NodeId> {
        std::mem::take(&mut self.arrivals).into_keys().collect()
    }
}
