//! Compiled graph structure: nodes, edges, entry and finish points
//!
//! A [`Graph`] is produced by [`GraphBuilder::compile`](crate::builder::GraphBuilder::compile)
//! and is immutable afterwards. It holds no run-local data, so one graph can be
//! shared behind an `Arc` by any number of concurrent runs.
//!
//! # Edges
//!
//! ```text
//!   a ──Direct──> b          b joins on a: b waits until every direct
//!                            predecessor has completed
//!
//!   r ──Conditional──> {x, y, END}
//!                            router inspects merged state; the chosen
//!                            targets are triggered immediately
//!
//!   f ──Fallback──> h        followed only when f fails
//! ```
//!
//! Each node's *join set* (the sources of its direct in-edges) is computed at
//! compile time and drives readiness in both schedulers.

use crate::error::{GraphError, Result};
use crate::node::{NodeBody, NodeKind};
use crate::schema::StateSchema;
use crate::state::State;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

/// Node identifier, unique within a graph
pub type NodeId = String;

/// Reserved id for the virtual entry; `add_edge(START, x)` marks `x` as an entry
pub const START: &str = "__start__";

/// Reserved id for the virtual exit; `add_edge(x, END)` marks `x` as a finish point
pub const END: &str = "__end__";

/// Routing function evaluated against the merged state
pub type RouterFn = Arc<dyn Fn(&State) -> Route + Send + Sync>;

/// Decision returned by a router
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Continue with one node
    To(NodeId),
    /// Fan out to several nodes
    Many(Vec<NodeId>),
    /// Stop this branch
    End,
}

impl Route {
    pub fn to(node: impl Into<NodeId>) -> Self {
        Route::To(node.into())
    }

    pub fn many<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        Route::Many(nodes.into_iter().map(Into::into).collect())
    }
}

impl From<&str> for Route {
    fn from(node: &str) -> Self {
        if node == END {
            Route::End
        } else {
            Route::To(node.to_string())
        }
    }
}

#[derive(Clone)]
pub enum Edge {
    /// Unconditional edge; the target joins on this source
    Direct(NodeId),

    /// Router-selected targets, restricted to the declared set
    Conditional {
        router: RouterFn,
        targets: BTreeSet<NodeId>,
    },

    /// Taken only when the source node fails
    Fallback(NodeId),
}

impl fmt::Debug for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edge::Direct(to) => f.debug_tuple("Direct").field(to).finish(),
            Edge::Conditional { targets, .. } => f
                .debug_struct("Conditional")
                .field("router", &"<fn>")
                .field("targets", targets)
                .finish(),
            Edge::Fallback(to) => f.debug_tuple("Fallback").field(to).finish(),
        }
    }
}

impl Edge {
    /// Every node this edge may lead to (END included for routers)
    pub fn declared_targets(&self) -> Vec<&str> {
        match self {
            Edge::Direct(to) | Edge::Fallback(to) => vec![to.as_str()],
            Edge::Conditional { targets, .. } => targets.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Clone)]
pub struct Node {
    pub(crate) id: NodeId,
    pub(crate) kind: NodeKind,
    pub(crate) body: NodeBody,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("body", &"<fn>")
            .finish()
    }
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }
}

/// Where a completed node sends control
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Successors {
    /// Targets triggered immediately (router choices, fallbacks)
    pub triggered: Vec<NodeId>,
    /// Direct-edge targets that record an arrival from the source
    pub arrivals: Vec<NodeId>,
}

impl Successors {
    pub fn is_empty(&self) -> bool {
        self.triggered.is_empty() && self.arrivals.is_empty()
    }
}

/// Immutable, validated graph
#[derive(Debug, Clone)]
pub struct Graph {
    pub(crate) nodes: BTreeMap<NodeId, Node>,
    pub(crate) edges: BTreeMap<NodeId, Vec<Edge>>,
    pub(crate) entries: Vec<NodeId>,
    pub(crate) finish: BTreeSet<NodeId>,
    pub(crate) joins: BTreeMap<NodeId, BTreeSet<NodeId>>,
    pub(crate) schema: StateSchema,
}

impl Graph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Node ids in ascending order
    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(String::as_str)
    }

    pub fn edges_from(&self, id: &str) -> &[Edge] {
        self.edges.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn entries(&self) -> &[NodeId] {
        &self.entries
    }

    pub fn finish_points(&self) -> &BTreeSet<NodeId> {
        &self.finish
    }

    pub fn is_finish(&self, id: &str) -> bool {
        self.finish.contains(id)
    }

    /// Sources of direct edges into `id`
    pub fn join_set(&self, id: &str) -> Option<&BTreeSet<NodeId>> {
        self.joins.get(id)
    }

    pub fn schema(&self) -> &StateSchema {
        &self.schema
    }

    /// Evaluate the out-edges of a node that completed successfully
    pub(crate) fn successors(&self, node: &str, state: &State) -> Result<Successors> {
        let mut next = Successors::default();
        for edge in self.edges_from(node) {
            match edge {
                Edge::Direct(to) => push_unique(&mut next.arrivals, to),
                Edge::Conditional { router, targets } => {
                    let chosen = match router(state) {
                        Route::To(target) => vec![target],
                        Route::Many(targets) => targets,
                        Route::End => Vec::new(),
                    };
                    for target in chosen {
                        if target == END {
                            continue;
                        }
                        if !targets.contains(&target) {
                            return Err(GraphError::Routing(format!(
                                "router on '{}' chose '{}', which is not one of its declared targets",
                                node, target
                            )));
                        }
                        push_unique(&mut next.triggered, &target);
                    }
                }
                Edge::Fallback(_) => {}
            }
        }
        Ok(next)
    }

    /// Fallback targets of a failed node
    pub(crate) fn fallbacks(&self, node: &str) -> Vec<NodeId> {
        self.edges_from(node)
            .iter()
            .filter_map(|edge| match edge {
                Edge::Fallback(to) => Some(to.clone()),
                _ => None,
            })
            .collect()
    }
}

pub(crate) fn push_unique(list: &mut Vec<NodeId>, node: &str) {
    if !list.iter().any(|n| n == node) {
        list.push(node.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::GraphBuilder;
    use crate::node::node_fn;
    use crate::schema::{FieldType, StateSchema};
    use serde_json::json;

    fn noop() -> NodeBody {
        node_fn(|_, _| async { Ok(json!({})) })
    }

    fn routed_graph() -> Graph {
        let mut builder = GraphBuilder::new(StateSchema::new().field("go", FieldType::String));
        builder
            .add_node("a", noop())
            .add_node("b", noop())
            .add_node("c", noop())
            .add_node("recover", noop())
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_conditional_edge(
                "a",
                |state: &State| match state.get_str("go") {
                    Some("c") => Route::to("c"),
                    Some("rogue") => Route::to("recover"),
                    Some("both") => Route::many(["c", END]),
                    _ => Route::End,
                },
                ["c", END],
            )
            .add_fallback_edge("a", "recover")
            .add_edge("b", END)
            .add_edge("c", END);
        builder.compile().unwrap()
    }

    #[test]
    fn test_successors_split_arrivals_and_triggers() {
        let graph = routed_graph();
        let next = graph
            .successors("a", &State::new().with("go", "c"))
            .unwrap();
        assert_eq!(next.arrivals, vec!["b"]);
        assert_eq!(next.triggered, vec!["c"]);

        let next = graph.successors("a", &State::new()).unwrap();
        assert!(next.triggered.is_empty());

        let next = graph
            .successors("a", &State::new().with("go", "both"))
            .unwrap();
        assert_eq!(next.triggered, vec!["c"]);
    }

    #[test]
    fn test_undeclared_route_target_is_routing_error() {
        let graph = routed_graph();
        let err = graph
            .successors("a", &State::new().with("go", "rogue"))
            .unwrap_err();
        assert!(matches!(err, GraphError::Routing(_)));
    }

    #[test]
    fn test_joins_and_fallbacks() {
        let graph = routed_graph();
        assert_eq!(
            graph.join_set("b").unwrap().iter().collect::<Vec<_>>(),
            vec!["a"]
        );
        assert!(graph.join_set("c").is_none());
        assert_eq!(graph.fallbacks("a"), vec!["recover"]);
        assert!(graph.is_finish("b"));
        assert_eq!(graph.entries(), &["a".to_string()]);
    }

    #[test]
    fn test_route_from_str() {
        assert_eq!(Route::from(END), Route::End);
        assert_eq!(Route::from("x"), Route::To("x".to_string()));
    }
}
