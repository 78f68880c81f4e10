//! Two-stage resilient consensus over critic and TR approximators.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use super::aggregator::{Aggregator, TrimmedMean};
use crate::algorithms::rl::agent::Agent;
use crate::algorithms::rl::network::{LayerWeights, WeightSnapshot};
use crate::algorithms::rl::training::buffer::Batch;
use crate::algorithms::rl::types::NeighborGraph;

/// Weight snapshots broadcast by every node after Stage I, indexed by node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PublishedWeights {
    pub critic: Vec<WeightSnapshot>,
    pub tr: Vec<WeightSnapshot>,
}

/// Losses of the Stage C team update of one cooperative node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TeamUpdate {
    pub node: usize,
    pub critic_loss: f64,
    pub tr_loss: f64,
}

/// Stage A: coordinate-wise aggregation of the hidden layers of `neighbors`.
///
/// Layers are matched by name against the first snapshot. A layer missing
/// from, or shaped differently in, any neighbor is left out of the result so
/// the receiving node keeps its own value for it.
pub fn hidden_consensus(
    aggregator: &dyn Aggregator,
    neighbors: &[&WeightSnapshot],
) -> Vec<LayerWeights> {
    let Some(template) = neighbors.first() else {
        return Vec::new();
    };
    template
        .hidden()
        .filter_map(|layer| {
            let contributions: Option<Vec<&[f64]>> = neighbors
                .iter()
                .map(|s| {
                    s.layer(&layer.name)
                        .filter(|l| l.is_compatible(layer))
                        .map(|l| l.values.as_slice())
                })
                .collect();
            match contributions {
                Some(values) => Some(LayerWeights::new(
                    layer.name.clone(),
                    layer.kind,
                    layer.shape.clone(),
                    aggregator.aggregate_vectors(&values),
                )),
                None => {
                    tracing::warn!(layer = %layer.name, "incompatible neighbor layer skipped in consensus");
                    None
                }
            }
        })
        .collect()
}

/// Stage B: per-sample aggregation of neighbor-evaluated outputs.
///
/// `estimates[k][t]` is the prediction made with neighbor `k`'s output layer
/// for sample `t`.
pub fn output_consensus(aggregator: &dyn Aggregator, estimates: &[Vec<f64>]) -> Vec<f64> {
    let columns: Vec<&[f64]> = estimates.iter().map(Vec::as_slice).collect();
    aggregator.aggregate_vectors(&columns)
}

/// Runs the consensus stages for every cooperative node.
///
/// Each node only ever reads the snapshots published by its own in-neighbors.
#[derive(Debug, Clone)]
pub struct ConsensusEngine<A = TrimmedMean> {
    graph: NeighborGraph,
    aggregator: A,
}

impl ConsensusEngine<TrimmedMean> {
    /// Engine using a trimmed mean that tolerates `f` Byzantine neighbors.
    pub fn trimmed_mean(graph: NeighborGraph, f: usize) -> Self {
        Self::new(graph, TrimmedMean::new(f))
    }
}

impl<A: Aggregator> ConsensusEngine<A> {
    pub fn new(graph: NeighborGraph, aggregator: A) -> Self {
        Self { graph, aggregator }
    }

    pub fn graph(&self) -> &NeighborGraph {
        &self.graph
    }

    pub fn aggregator(&self) -> &A {
        &self.aggregator
    }

    /// Snapshots published by the in-neighbors of `node`, in neighbor order.
    pub fn neighbor_snapshots<'a>(
        &self,
        node: usize,
        published: &'a [WeightSnapshot],
    ) -> Vec<&'a WeightSnapshot> {
        self.graph
            .in_nodes(node)
            .iter()
            .filter_map(|&n| published.get(n))
            .collect()
    }

    /// Stages A, B and C for both approximators of one cooperative agent.
    ///
    /// `batch` is the full materialized buffer of the current cycle.
    pub fn update_node(
        &self,
        agent: &mut Agent,
        published: &PublishedWeights,
        batch: &Batch,
    ) -> TeamUpdate {
        let node = agent.node();
        let critic_neighbors = self.neighbor_snapshots(node, &published.critic);
        let tr_neighbors = self.neighbor_snapshots(node, &published.tr);

        agent.resilient_consensus_critic_hidden(&critic_neighbors, &self.aggregator);
        agent.resilient_consensus_tr_hidden(&tr_neighbors, &self.aggregator);

        let observations = batch.observations_of(node);
        let state_actions = batch.state_actions_of(node);
        let critic_estimate =
            agent.resilient_consensus_critic(&observations, &critic_neighbors, &self.aggregator);
        let tr_estimate =
            agent.resilient_consensus_tr(&state_actions, &tr_neighbors, &self.aggregator);

        TeamUpdate {
            node,
            critic_loss: agent.critic_update_team(&observations, &critic_estimate),
            tr_loss: agent.tr_update_team(&state_actions, &tr_estimate),
        }
    }

    /// Stage II of one epoch: consensus for every agent whose role joins it.
    ///
    /// Nodes are independent of each other here; all of them read the same
    /// immutable `published` set.
    pub fn run(
        &self,
        agents: &mut [Agent],
        published: &PublishedWeights,
        batch: &Batch,
    ) -> Vec<TeamUpdate> {
        #[cfg(feature = "parallel")]
        {
            agents
                .par_iter_mut()
                .filter(|a| a.behavior().joins_consensus())
                .map(|a| self.update_node(a, published, batch))
                .collect()
        }
        #[cfg(not(feature = "parallel"))]
        {
            agents
                .iter_mut()
                .filter(|a| a.behavior().joins_consensus())
                .map(|a| self.update_node(a, published, batch))
                .collect()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithms::rl::network::LayerKind;

    fn snapshot(hidden: Vec<f64>, output: Vec<f64>) -> WeightSnapshot {
        WeightSnapshot::new(vec![
            LayerWeights::new("hidden_0.weight", LayerKind::Hidden, vec![hidden.len()], hidden),
            LayerWeights::new("output.weight", LayerKind::Output, vec![output.len()], output),
        ])
    }

    #[test]
    fn single_neighbor_without_trimming_is_copied() {
        let agg = TrimmedMean::new(0);
        let neighbor = snapshot(vec![0.25, -1.5, 3.0], vec![9.0]);
        let hidden = hidden_consensus(&agg, &[&neighbor]);
        assert_eq!(hidden.len(), 1);
        assert_eq!(hidden[0].name, "hidden_0.weight");
        assert_eq!(hidden[0].values, vec![0.25, -1.5, 3.0]);
    }

    #[test]
    fn hidden_consensus_filters_outlier_neighbor() {
        let agg = TrimmedMean::new(1);
        let a = snapshot(vec![1.0, 2.0], vec![0.0]);
        let b = snapshot(vec![1.2, 2.2], vec![0.0]);
        let c = snapshot(vec![1.1, 2.1], vec![0.0]);
        let evil = snapshot(vec![1e6, -1e6], vec![0.0]);
        let hidden = hidden_consensus(&agg, &[&a, &evil, &b, &c]);
        let v = &hidden[0].values;
        assert!((1.0..=1.2).contains(&v[0]));
        assert!((2.0..=2.2).contains(&v[1]));
    }

    #[test]
    fn incompatible_layers_are_skipped() {
        let agg = TrimmedMean::new(0);
        let a = snapshot(vec![1.0, 2.0], vec![0.0]);
        let b = snapshot(vec![1.0], vec![0.0]);
        assert!(hidden_consensus(&agg, &[&a, &b]).is_empty());
        assert!(hidden_consensus(&agg, &[]).is_empty());
    }

    #[test]
    fn output_consensus_aggregates_per_sample() {
        let agg = TrimmedMean::new(1);
        let estimates = vec![
            vec![1.0, 10.0],
            vec![2.0, 20.0],
            vec![3.0, -500.0],
        ];
        assert_eq!(output_consensus(&agg, &estimates), vec![2.0, 10.0]);
    }

    #[test]
    fn neighbor_snapshots_follow_graph() {
        let graph = NeighborGraph::from_in_nodes(3, &[vec![1, 2], vec![0], vec![]]);
        let engine = ConsensusEngine::trimmed_mean(graph, 0);
        let published: Vec<WeightSnapshot> = (0..3)
            .map(|i| snapshot(vec![i as f64], vec![0.0]))
            .collect();
        let picked = engine.neighbor_snapshots(0, &published);
        assert_eq!(picked.len(), 2);
        assert_eq!(picked[0].layers[0].values, vec![1.0]);
        assert_eq!(picked[1].layers[0].values, vec![2.0]);
        assert!(engine.neighbor_snapshots(2, &published).is_empty());
    }
}
