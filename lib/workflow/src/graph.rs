//! Graph analysis over workflow definitions.
//!
//! Everything here is a pure function of the node and edge lists: no state
//! is kept between calls and inputs are never mutated. Results are
//! deterministic for a given declaration order, which keeps scheduling and
//! error messages stable across runs.
//!
//! Edges whose endpoints are not declared nodes are ignored by the analysis
//! and reported by [`validate`].

use crate::definition::{EdgeDefinition, NodeDefinition, NodeId, WorkflowDefinition};
use crate::error::GraphError;
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{HashMap, HashSet};

/// Dependency graph built from a definition's node and edge lists.
///
/// Node indices follow declaration order; duplicate ids keep their first
/// declaration.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    graph: DiGraph<NodeId, ()>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
}

impl DependencyGraph {
    /// Builds the graph, skipping edges with an undeclared endpoint.
    #[must_use]
    pub fn build(nodes: &[NodeDefinition], edges: &[EdgeDefinition]) -> Self {
        let mut graph = DiGraph::new();
        let mut node_index_map = HashMap::new();

        for node in nodes {
            if node_index_map.contains_key(&node.node_id) {
                continue;
            }
            let index = graph.add_node(node.node_id.clone());
            node_index_map.insert(node.node_id.clone(), index);
        }

        for edge in edges {
            let (Some(&source), Some(&target)) = (
                node_index_map.get(&edge.source),
                node_index_map.get(&edge.target),
            ) else {
                continue;
            };
            graph.add_edge(source, target, ());
        }

        Self {
            graph,
            node_index_map,
        }
    }

    /// Returns the number of distinct nodes.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Successors of `index` in edge declaration order.
    ///
    /// petgraph walks adjacency lists newest-first, so the list is reversed.
    fn successors(&self, index: NodeIndex) -> Vec<NodeIndex> {
        let mut successors: Vec<_> = self.graph.neighbors(index).collect();
        successors.reverse();
        successors
    }

    fn id(&self, index: NodeIndex) -> NodeId {
        self.graph[index].clone()
    }

    /// Maps every node to its direct successors.
    #[must_use]
    pub fn adjacency(&self) -> HashMap<NodeId, Vec<NodeId>> {
        self.graph
            .node_indices()
            .map(|index| {
                let targets = self
                    .successors(index)
                    .into_iter()
                    .map(|s| self.id(s))
                    .collect();
                (self.id(index), targets)
            })
            .collect()
    }

    /// Nodes with no incoming edges, in declaration order.
    #[must_use]
    pub fn start_nodes(&self) -> Vec<NodeId> {
        self.graph
            .node_indices()
            .filter(|&index| {
                self.graph
                    .neighbors_directed(index, petgraph::Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|index| self.id(index))
            .collect()
    }

    /// Returns true if the node is part of the graph.
    #[must_use]
    pub fn contains(&self, node_id: &NodeId) -> bool {
        self.node_index_map.contains_key(node_id)
    }

    /// Finds cycles with a depth-first walk that tracks the current path.
    ///
    /// Every back edge found during the walk yields one cycle: the slice of
    /// the current path from the back edge's target to the node being
    /// visited. The walk uses an explicit stack so deep graphs cannot
    /// exhaust the call stack.
    #[must_use]
    pub fn detect_cycles(&self) -> Vec<Vec<NodeId>> {
        let mut visited = HashSet::new();
        let mut on_path = HashSet::new();
        let mut path: Vec<NodeIndex> = Vec::new();
        let mut cycles = Vec::new();

        for root in self.graph.node_indices() {
            if visited.contains(&root) {
                continue;
            }

            let mut frames = vec![Frame::new(root, self.successors(root))];
            visited.insert(root);
            on_path.insert(root);
            path.push(root);

            while let Some(frame) = frames.last_mut() {
                let Some(next) = frame.advance() else {
                    on_path.remove(&frame.index);
                    path.pop();
                    frames.pop();
                    continue;
                };

                if !visited.contains(&next) {
                    visited.insert(next);
                    on_path.insert(next);
                    path.push(next);
                    frames.push(Frame::new(next, self.successors(next)));
                } else if on_path.contains(&next)
                    && let Some(start) = path.iter().position(|&p| p == next)
                {
                    cycles.push(path[start..].iter().map(|&i| self.id(i)).collect());
                }
            }
        }

        cycles
    }

    /// Orders nodes so every edge's source precedes its target.
    ///
    /// Built by reversing a post-order depth-first walk rooted at each node
    /// in declaration order.
    ///
    /// # Errors
    ///
    /// Returns [`GraphError::Cyclic`] carrying every detected cycle.
    pub fn topological_order(&self) -> Result<Vec<NodeId>, GraphError> {
        let cycles = self.detect_cycles();
        if !cycles.is_empty() {
            return Err(GraphError::Cyclic { cycles });
        }

        let mut visited = HashSet::new();
        let mut finished: Vec<NodeIndex> = Vec::with_capacity(self.node_count());

        for root in self.graph.node_indices() {
            if !visited.insert(root) {
                continue;
            }
            let mut frames = vec![Frame::new(root, self.successors(root))];

            while let Some(frame) = frames.last_mut() {
                match frame.advance() {
                    Some(next) => {
                        if visited.insert(next) {
                            frames.push(Frame::new(next, self.successors(next)));
                        }
                    }
                    None => {
                        finished.push(frame.index);
                        frames.pop();
                    }
                }
            }
        }

        Ok(finished.into_iter().rev().map(|i| self.id(i)).collect())
    }
}

/// One level of an explicit depth-first walk.
#[derive(Debug)]
struct Frame {
    index: NodeIndex,
    successors: Vec<NodeIndex>,
    cursor: usize,
}

impl Frame {
    fn new(index: NodeIndex, successors: Vec<NodeIndex>) -> Self {
        Self {
            index,
            successors,
            cursor: 0,
        }
    }

    fn advance(&mut self) -> Option<NodeIndex> {
        let next = self.successors.get(self.cursor).copied();
        self.cursor += 1;
        next
    }
}

/// Maps every node to its direct successors.
#[must_use]
pub fn adjacency(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
) -> HashMap<NodeId, Vec<NodeId>> {
    DependencyGraph::build(nodes, edges).adjacency()
}

/// Nodes with zero in-degree, in declaration order.
#[must_use]
pub fn start_nodes(nodes: &[NodeDefinition], edges: &[EdgeDefinition]) -> Vec<NodeId> {
    DependencyGraph::build(nodes, edges).start_nodes()
}

/// Every distinct cycle as an ordered list of node ids.
#[must_use]
pub fn detect_cycles(nodes: &[NodeDefinition], edges: &[EdgeDefinition]) -> Vec<Vec<NodeId>> {
    DependencyGraph::build(nodes, edges).detect_cycles()
}

/// Topological ordering of the node ids.
///
/// # Errors
///
/// Returns [`GraphError::Cyclic`] if the graph has any cycle.
pub fn topological_order(
    nodes: &[NodeDefinition],
    edges: &[EdgeDefinition],
) -> Result<Vec<NodeId>, GraphError> {
    DependencyGraph::build(nodes, edges).topological_order()
}

/// Checks a definition before any of it is dispatched.
///
/// Checks, in order:
/// - node ids are unique
/// - every edge endpoint is a declared node
/// - the graph is acyclic
///
/// Returns the topological order on success.
///
/// # Errors
///
/// Returns the first structural problem found.
pub fn validate(definition: &WorkflowDefinition) -> Result<Vec<NodeId>, GraphError> {
    let mut seen = HashSet::new();
    for node in &definition.nodes {
        if !seen.insert(&node.node_id) {
            return Err(GraphError::DuplicateNode {
                node_id: node.node_id.clone(),
            });
        }
    }

    if let Some(edge) = definition
        .edges
        .iter()
        .find(|e| !seen.contains(&e.source) || !seen.contains(&e.target))
    {
        return Err(GraphError::DanglingEdge {
            source: edge.source.clone(),
            target: edge.target.clone(),
        });
    }

    DependencyGraph::build(&definition.nodes, &definition.edges).topological_order()
}
