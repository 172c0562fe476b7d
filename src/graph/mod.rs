// src/graph/mod.rs

//! Generic directed graph keyed by node ID.
//!
//! The container is intentionally lightweight: it keeps node identity,
//! adjacency in connect order, and enough metadata to hand off to the DOT
//! renderer. It does not enforce acyclicity on insertion — the job layer
//! guarantees it by construction — but [`Graph::topo_order`] exposes a
//! petgraph-backed check for callers composing graphs by hand.

pub mod dot;

use std::collections::HashMap;
use std::fmt;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use thiserror::Error;

pub use dot::{DotEdgeSpec, DotNodeSpec};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("node [{0}] already present in graph")]
    DuplicateNode(String),

    #[error("cannot connect missing node [{0}]")]
    MissingNode(String),

    #[error("cycle detected in graph involving node [{0}]")]
    Cycle(String),
}

/// A renderable graph node with a stable identity.
pub trait GraphNode {
    fn id(&self) -> &str;
    fn dot_spec(&self) -> DotNodeSpec;
}

/// Decorates an edge from its endpoint nodes.
pub type EdgeSpecFn<N> = fn(&N, &N) -> DotEdgeSpec;

pub struct Graph<N: GraphNode> {
    nodes: HashMap<String, N>,
    /// Node IDs in insertion order; drives deterministic iteration.
    order: Vec<String>,
    /// Edges as (from, to) ID pairs, in connect order.
    edges: Vec<(String, String)>,
    edge_spec: EdgeSpecFn<N>,
}

impl<N: GraphNode> fmt::Debug for Graph<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Graph")
            .field("nodes", &self.order)
            .field("edges", &self.edges)
            .finish_non_exhaustive()
    }
}

impl<N: GraphNode> Graph<N> {
    pub fn new(edge_spec: EdgeSpecFn<N>) -> Self {
        Self {
            nodes: HashMap::new(),
            order: Vec::new(),
            edges: Vec::new(),
            edge_spec,
        }
    }

    pub fn add_node(&mut self, node: N) -> Result<(), GraphError> {
        let id = node.id().to_string();
        if self.nodes.contains_key(&id) {
            return Err(GraphError::DuplicateNode(id));
        }
        self.order.push(id.clone());
        self.nodes.insert(id, node);
        Ok(())
    }

    /// Add a directed edge `from -> to`. Both endpoints must exist.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<(), GraphError> {
        if !self.nodes.contains_key(from) {
            return Err(GraphError::MissingNode(from.to_string()));
        }
        if !self.nodes.contains_key(to) {
            return Err(GraphError::MissingNode(to.to_string()));
        }
        self.edges.push((from.to_string(), to.to_string()));
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&N> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &N> {
        self.order.iter().filter_map(move |id| self.nodes.get(id))
    }

    /// Edges in connect order, resolved to their endpoint nodes.
    pub fn edges(&self) -> impl Iterator<Item = (&N, &N)> {
        self.edges.iter().filter_map(move |(from, to)| {
            match (self.nodes.get(from), self.nodes.get(to)) {
                (Some(from), Some(to)) => Some((from, to)),
                _ => None,
            }
        })
    }

    /// A topological order over the node IDs, or the node on a cycle.
    pub fn topo_order(&self) -> Result<Vec<&str>, GraphError> {
        let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
        for id in &self.order {
            graph.add_node(id.as_str());
        }
        for (from, to) in &self.edges {
            graph.add_edge(from.as_str(), to.as_str(), ());
        }

        match toposort(&graph, None) {
            Ok(order) => Ok(order),
            Err(cycle) => Err(GraphError::Cycle(cycle.node_id().to_string())),
        }
    }

    pub fn is_acyclic(&self) -> bool {
        self.topo_order().is_ok()
    }

    /// Render the graph as a DOT `digraph` block.
    pub fn to_dot(&self, name: &str) -> String {
        let nodes: Vec<DotNodeSpec> = self.nodes().map(|node| node.dot_spec()).collect();
        let edges: Vec<DotEdgeSpec> = self
            .edges()
            .map(|(from, to)| (self.edge_spec)(from, to))
            .collect();
        dot::render(name, &nodes, &edges)
    }
}
