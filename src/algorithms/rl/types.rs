//! Core types for the resilient consensus actor-critic.
//!
//! Defines agent roles and the static communication graph over which
//! cooperative agents exchange parameter estimates.

use std::fmt;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use serde::{Deserialize, Serialize};

/// Behavioral role of an agent, fixed for the whole run.
///
/// Only cooperative agents receive and aggregate neighbor estimates; the
/// other roles model selfish, adversarial or unresponsive participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AgentRole {
    Cooperative,
    Greedy,
    Malicious,
    Faulty,
}

impl AgentRole {
    /// Returns all roles in declaration order.
    pub fn all() -> [AgentRole; 4] {
        [
            AgentRole::Cooperative,
            AgentRole::Greedy,
            AgentRole::Malicious,
            AgentRole::Faulty,
        ]
    }

    /// Whether this role runs the resilient consensus protocol.
    pub fn is_cooperative(&self) -> bool {
        matches!(self, AgentRole::Cooperative)
    }
}

impl fmt::Display for AgentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentRole::Cooperative => write!(f, "cooperative"),
            AgentRole::Greedy => write!(f, "greedy"),
            AgentRole::Malicious => write!(f, "malicious"),
            AgentRole::Faulty => write!(f, "faulty"),
        }
    }
}

/// Indices of the cooperative agents in a role assignment.
pub fn cooperative_nodes(roles: &[AgentRole]) -> Vec<usize> {
    roles
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_cooperative())
        .map(|(i, _)| i)
        .collect()
}

/// Static directed communication graph.
///
/// An edge `u → v` means node `v` may read the weight snapshots published
/// by node `u`. Self-loops are allowed: a node may list itself as an
/// in-neighbor and then takes part in its own aggregation.
#[derive(Debug, Clone)]
pub struct NeighborGraph {
    graph: DiGraph<usize, ()>,
    in_nodes: Vec<Vec<usize>>,
}

impl NeighborGraph {
    /// Builds the graph from per-node in-neighbor lists.
    ///
    /// `in_nodes[v]` lists the nodes whose snapshots `v` consumes. Lists
    /// shorter than `n_nodes` are padded with empty neighbor sets. Indices
    /// must be `< n_nodes`; callers validate this beforehand.
    pub fn from_in_nodes(n_nodes: usize, in_nodes: &[Vec<usize>]) -> Self {
        let mut graph = DiGraph::with_capacity(n_nodes, in_nodes.iter().map(Vec::len).sum());
        for v in 0..n_nodes {
            graph.add_node(v);
        }
        let mut lists = vec![Vec::new(); n_nodes];
        for (v, sources) in in_nodes.iter().enumerate().take(n_nodes) {
            let mut sorted = sources.clone();
            sorted.sort_unstable();
            sorted.dedup();
            for &u in &sorted {
                graph.add_edge(NodeIndex::new(u), NodeIndex::new(v), ());
            }
            lists[v] = sorted;
        }
        Self {
            graph,
            in_nodes: lists,
        }
    }

    /// Number of nodes in the graph.
    pub fn n_nodes(&self) -> usize {
        self.graph.node_count()
    }

    /// Ordered in-neighbors of `node`.
    pub fn in_nodes(&self, node: usize) -> &[usize] {
        self.in_nodes
            .get(node)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Number of in-neighbors of `node`.
    pub fn in_degree(&self, node: usize) -> usize {
        self.graph
            .neighbors_directed(NodeIndex::new(node), Direction::Incoming)
            .count()
    }

    /// Nodes that read `node`'s snapshots.
    pub fn out_nodes(&self, node: usize) -> Vec<usize> {
        let mut out: Vec<usize> = self
            .graph
            .neighbors_directed(NodeIndex::new(node), Direction::Outgoing)
            .map(|n| self.graph[n])
            .collect();
        out.sort_unstable();
        out
    }
}
