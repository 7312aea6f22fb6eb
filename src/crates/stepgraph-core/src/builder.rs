//! Mutable graph builder and the compile step
//!
//! [`GraphBuilder`] collects nodes, edges, entry and finish points. Nothing is
//! checked while building; [`GraphBuilder::compile`] validates everything at
//! once and reports the first violated rule as a [`GraphInvalidError`].
//!
//! Compile rules, in the order they are checked:
//!
//! 1. node ids are unique (`DuplicateNode`)
//! 2. `START` and `END` are not used as node ids (`ReservedNodeId`)
//! 3. at least one entry point exists and each is declared
//!    (`MissingEntryPoint`, `UnknownEntryPoint`)
//! 4. every edge endpoint is declared (`DanglingEdge`); router targets are
//!    declared nodes or `END` (`UnknownRouteTarget`)
//! 5. every finish point is declared (`UnknownFinishPoint`) and reachable from
//!    an entry point (`UnreachableFinish`)
//!
//! Compiling does not consume the builder and may be repeated; each call
//! returns an independent [`Graph`].
//!
//! # Example
//!
//! ```rust
//! use serde_json::json;
//! use stepgraph_core::{node_fn, FieldType, GraphBuilder, StateSchema, END, START};
//!
//! let schema = StateSchema::new().field("answer", FieldType::String);
//! let mut builder = GraphBuilder::new(schema);
//! builder
//!     .add_node("draft", node_fn(|_, _| async { Ok(json!({"answer": "draft"})) }))
//!     .add_node("review", node_fn(|_, _| async { Ok(json!(null)) }))
//!     .add_edge(START, "draft")
//!     .add_edge("draft", "review")
//!     .add_edge("review", END);
//!
//! let graph = builder.compile().unwrap();
//! assert!(graph.is_finish("review"));
//! ```

use crate::error::{GraphInvalidError, Result};
use crate::graph::{Edge, Graph, Node, NodeId, Route, END, START};
use crate::node::{node_fn, NodeBody, NodeKind};
use crate::schema::StateSchema;
use crate::state::State;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct GraphBuilder {
    schema: StateSchema,
    nodes: Vec<Node>,
    edges: Vec<(NodeId, Edge)>,
    entries: Vec<NodeId>,
    finish: Vec<NodeId>,
}

impl GraphBuilder {
    pub fn new(schema: StateSchema) -> Self {
        Self {
            schema,
            nodes: Vec::new(),
            edges: Vec::new(),
            entries: Vec::new(),
            finish: Vec::new(),
        }
    }

    /// Add a function node
    pub fn add_node(&mut self, id: impl Into<NodeId>, body: NodeBody) -> &mut Self {
        self.nodes.push(Node {
            id: id.into(),
            kind: NodeKind::Function,
            body,
        });
        self
    }

    /// Add a pass-through node that only routes
    ///
    /// Shorthand for a router-kind node producing no update plus a conditional
    /// edge from it.
    pub fn add_router<F, I, S>(&mut self, id: impl Into<NodeId>, router: F, targets: I) -> &mut Self
    where
        F: Fn(&State) -> Route + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        let id = id.into();
        self.nodes.push(Node {
            id: id.clone(),
            kind: NodeKind::Router,
            body: node_fn(|_, _| async { Ok(Value::Null) }),
        });
        self.add_conditional_edge(id, router, targets)
    }

    /// Add an unconditional edge
    ///
    /// `add_edge(START, x)` marks `x` as an entry point and `add_edge(x, END)`
    /// marks `x` as a finish point.
    pub fn add_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        let from = from.into();
        let to = to.into();
        if from == START {
            return self.set_entry(to);
        }
        if to == END {
            return self.set_finish(from);
        }
        self.edges.push((from, Edge::Direct(to)));
        self
    }

    /// Add a router edge restricted to `targets` (which may include `END`)
    pub fn add_conditional_edge<F, I, S>(
        &mut self,
        from: impl Into<NodeId>,
        router: F,
        targets: I,
    ) -> &mut Self
    where
        F: Fn(&State) -> Route + Send + Sync + 'static,
        I: IntoIterator<Item = S>,
        S: Into<NodeId>,
    {
        self.edges.push((
            from.into(),
            Edge::Conditional {
                router: Arc::new(router),
                targets: targets.into_iter().map(Into::into).collect(),
            },
        ));
        self
    }

    /// Add an edge followed only when `from` fails
    pub fn add_fallback_edge(&mut self, from: impl Into<NodeId>, to: impl Into<NodeId>) -> &mut Self {
        self.edges.push((from.into(), Edge::Fallback(to.into())));
        self
    }

    /// Add an entry point (repeatable)
    pub fn set_entry(&mut self, node: impl Into<NodeId>) -> &mut Self {
        let node = node.into();
        if !self.entries.contains(&node) {
            self.entries.push(node);
        }
        self
    }

    /// Add a finish point (repeatable)
    pub fn set_finish(&mut self, node: impl Into<NodeId>) -> &mut Self {
        let node = node.into();
        if !self.finish.contains(&node) {
            self.finish.push(node);
        }
        self
    }

    /// Validate and freeze the graph
    pub fn compile(&self) -> Result<Graph> {
        let mut nodes = BTreeMap::new();
        for node in &self.nodes {
            if node.id == START || node.id == END {
                return Err(GraphInvalidError::ReservedNodeId(node.id.clone()).into());
            }
            if nodes.insert(node.id.clone(), node.clone()).is_some() {
                return Err(GraphInvalidError::DuplicateNode(node.id.clone()).into());
            }
        }

        if self.entries.is_empty() {
            return Err(GraphInvalidError::MissingEntryPoint.into());
        }
        if let Some(unknown) = self.entries.iter().find(|e| !nodes.contains_key(*e)) {
            return Err(GraphInvalidError::UnknownEntryPoint(unknown.clone()).into());
        }

        let mut edges: BTreeMap<NodeId, Vec<Edge>> = BTreeMap::new();
        let mut joins: BTreeMap<NodeId, BTreeSet<NodeId>> = BTreeMap::new();
        for (from, edge) in &self.edges {
            match edge {
                Edge::Direct(to) | Edge::Fallback(to) => {
                    if !nodes.contains_key(from) || !nodes.contains_key(to) {
                        return Err(GraphInvalidError::DanglingEdge {
                            from: from.clone(),
                            to: to.clone(),
                        }
                        .into());
                    }
                    if let Edge::Direct(to) = edge {
                        joins.entry(to.clone()).or_default().insert(from.clone());
                    }
                }
                Edge::Conditional { targets, .. } => {
                    if !nodes.contains_key(from) {
                        return Err(GraphInvalidError::DanglingEdge {
                            from: from.clone(),
                            to: targets.iter().next().cloned().unwrap_or_else(|| END.to_string()),
                        }
                        .into());
                    }
                    if let Some(target) = targets
                        .iter()
                        .find(|t| t.as_str() != END && !nodes.contains_key(*t))
                    {
                        return Err(GraphInvalidError::UnknownRouteTarget {
                            from: from.clone(),
                            target: target.clone(),
                        }
                        .into());
                    }
                }
            }
            edges.entry(from.clone()).or_default().push(edge.clone());
        }

        let finish: BTreeSet<NodeId> = self.finish.iter().cloned().collect();
        if let Some(unknown) = finish.iter().find(|f| !nodes.contains_key(*f)) {
            return Err(GraphInvalidError::UnknownFinishPoint(unknown.clone()).into());
        }

        let reachable = reachable_from(&self.entries, &edges);
        if let Some(unreachable) = finish.iter().find(|f| !reachable.contains(*f)) {
            return Err(GraphInvalidError::UnreachableFinish(unreachable.clone()).into());
        }

        Ok(Graph {
            nodes,
            edges,
            entries: self.entries.clone(),
            finish,
            joins,
            schema: self.schema.clone(),
        })
    }
}

fn reachable_from(entries: &[NodeId], edges: &BTreeMap<NodeId, Vec<Edge>>) -> BTreeSet<NodeId> {
    let mut seen: BTreeSet<NodeId> = entries.iter().cloned().collect();
    let mut queue: VecDeque<&str> = entries.iter().map(String::as_str).collect();

    while let Some(node) = queue.pop_front() {
        for edge in edges.get(node).into_iter().flatten() {
            for target in edge.declared_targets() {
                if target != END && seen.insert(target.to_string()) {
                    queue.push_back(target);
                }
            }
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GraphError;
    use serde_json::json;

    fn noop() -> NodeBody {
        node_fn(|_, _| async { Ok(json!({})) })
    }

    fn invalid(builder: &GraphBuilder) -> GraphInvalidError {
        match builder.compile() {
            Err(GraphError::Invalid(rule)) => rule,
            other => panic!("expected invalid graph, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_compile_simple_chain() {
        let mut builder = GraphBuilder::new(StateSchema::new());
        builder
            .add_node("a", noop())
            .add_node("b", noop())
            .add_edge(START, "a")
            .add_edge("a", "b")
            .add_edge("b", END);

        let graph = builder.compile().unwrap();
        assert_eq!(graph.node_ids().collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(graph.is_finish("b"));

        // compiling twice yields equivalent graphs
        let again = builder.compile().unwrap();
        assert_eq!(again.entries(), graph.entries());
    }

    #[test]
    fn test_duplicate_node() {
        let mut builder = GraphBuilder::new(StateSchema::new());
        builder.add_node("a", noop()).add_node("a", noop()).set_entry("a");
        assert_eq!(invalid(&builder), GraphInvalidError::DuplicateNode("a".into()));
    }

    #[test]
    fn test_reserved_node_id() {
        let mut builder = GraphBuilder::new(StateSchema::new());
        builder.add_node(END, noop());
        assert_eq!(invalid(&builder), GraphInvalidError::ReservedNodeId(END.into()));
    }

    #[test]
    fn test_missing_and_unknown_entry() {
        let mut builder = GraphBuilder::new(StateSchema::new());
        builder.add_node("a", noop());
        assert_eq!(invalid(&builder), GraphInvalidError::MissingEntryPoint);

        builder.set_entry("ghost");
        assert_eq!(invalid(&builder), GraphInvalidError::UnknownEntryPoint("ghost".into()));
    }

    #[test]
    fn test_dangling_edge() {
        let mut builder = GraphBuilder::new(StateSchema::new());
        builder.add_node("a", noop()).set_entry("a").add_edge("a", "nowhere");
        assert_eq!(
            invalid(&builder),
            GraphInvalidError::DanglingEdge {
                from: "a".into(),
                to: "nowhere".into()
            }
        );
    }

    #[test]
    fn test_unknown_route_target() {
        let mut builder = GraphBuilder::new(StateSchema::new());
        builder
            .add_node("a", noop())
            .set_entry("a")
            .add_conditional_edge("a", |_: &State| Route::End, ["b", END]);
        assert_eq!(
            invalid(&builder),
            GraphInvalidError::UnknownRouteTarget {
                from: "a".into(),
                target: "b".into()
            }
        );
    }

    #[test]
    fn test_unreachable_finish() {
        let mut builder = GraphBuilder::new(StateSchema::new());
        builder
            .add_node("a", noop())
            .add_node("island", noop())
            .set_entry("a")
            .set_finish("island");
        assert_eq!(invalid(&builder), GraphInvalidError::UnreachableFinish("island".into()));

        // reachable through a router or a fallback counts
        builder.add_fallback_edge("a", "island");
        assert!(builder.compile().is_ok());
    }

    #[test]
    fn test_add_router_creates_router_node() {
        let mut builder = GraphBuilder::new(StateSchema::new());
        builder
            .add_node("work", noop())
            .add_router("decide", |_: &State| Route::to("work"), ["work", END])
            .set_entry("decide");

        let graph = builder.compile().unwrap();
        assert_eq!(graph.node("decide").unwrap().kind(), NodeKind::Router);
        assert_eq!(graph.node("work").unwrap().kind(), NodeKind::Function);
    }
}
