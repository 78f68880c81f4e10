//! Experience buffer for batched consensus updates.

use std::collections::VecDeque;

/// Per-agent observation rows, `[n_agents][observation_dim]`.
pub type Observation = Vec<Vec<f64>>;

/// A single simulation step across all agents.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    /// Environment state before the step.
    pub state: Vec<f64>,
    /// Environment state after the step.
    pub next_state: Vec<f64>,
    /// Joint action, one entry per agent.
    pub actions: Vec<usize>,
    /// Per-agent rewards.
    pub rewards: Vec<f64>,
    /// Observations before the step.
    pub observation: Observation,
    /// Observations after the step.
    pub next_observation: Observation,
}

/// Bounded FIFO store of transitions.
///
/// Grows freely while a cycle is being collected; [`ExperienceBuffer::trim`]
/// drops the oldest entries once a cycle's updates are done, keeping older
/// experience available for off-policy critic updates.
#[derive(Debug, Clone, Default)]
pub struct ExperienceBuffer {
    transitions: VecDeque<Transition>,
}

impl ExperienceBuffer {
    /// Creates a new empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a buffer pre-filled with experience, oldest first.
    pub fn from_transitions(transitions: impl IntoIterator<Item = Transition>) -> Self {
        Self {
            transitions: transitions.into_iter().collect(),
        }
    }

    /// Adds a transition to the buffer.
    pub fn append(&mut self, transition: Transition) {
        self.transitions.push_back(transition);
    }

    /// Drops the oldest entries until at most `capacity` remain.
    ///
    /// Returns the number of removed transitions.
    pub fn trim(&mut self, capacity: usize) -> usize {
        let excess = self.transitions.len().saturating_sub(capacity);
        self.transitions.drain(..excess);
        excess
    }

    /// Stacks every stored transition along a leading time axis.
    pub fn as_batch(&self) -> Batch {
        Batch::from_transitions(self.transitions.iter())
    }

    /// Iterates over stored transitions, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &Transition> {
        self.transitions.iter()
    }

    /// Returns the number of stored transitions.
    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    /// Returns true if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Clears all stored data.
    pub fn clear(&mut self) {
        self.transitions.clear();
    }
}

/// Column-oriented view of a run of transitions, indexed `[t][...]`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub states: Vec<Vec<f64>>,
    pub next_states: Vec<Vec<f64>>,
    pub actions: Vec<Vec<usize>>,
    pub rewards: Vec<Vec<f64>>,
    pub observations: Vec<Observation>,
    pub next_observations: Vec<Observation>,
}

impl Batch {
    fn from_transitions<'a>(transitions: impl Iterator<Item = &'a Transition>) -> Self {
        let mut batch = Batch::default();
        for t in transitions {
            batch.states.push(t.state.clone());
            batch.next_states.push(t.next_state.clone());
            batch.actions.push(t.actions.clone());
            batch.rewards.push(t.rewards.clone());
            batch.observations.push(t.observation.clone());
            batch.next_observations.push(t.next_observation.clone());
        }
        batch
    }

    /// Number of time steps.
    pub fn len(&self) -> usize {
        self.rewards.len()
    }

    /// Returns true if the batch holds no time steps.
    pub fn is_empty(&self) -> bool {
        self.rewards.is_empty()
    }

    /// The most recent `k` time steps (all of them if fewer are stored).
    pub fn tail(&self, k: usize) -> Batch {
        let start = self.len().saturating_sub(k);
        Batch {
            states: self.states[start..].to_vec(),
            next_states: self.next_states[start..].to_vec(),
            actions: self.actions[start..].to_vec(),
            rewards: self.rewards[start..].to_vec(),
            observations: self.observations[start..].to_vec(),
            next_observations: self.next_observations[start..].to_vec(),
        }
    }

    /// Reward stream of one agent.
    pub fn rewards_of(&self, node: usize) -> Vec<f64> {
        self.rewards.iter().map(|r| r[node]).collect()
    }

    /// Unweighted mean reward over `nodes` at every time step.
    pub fn mean_reward(&self, nodes: &[usize]) -> Vec<f64> {
        if nodes.is_empty() {
            return vec![0.0; self.len()];
        }
        self.rewards
            .iter()
            .map(|r| nodes.iter().map(|&n| r[n]).sum::<f64>() / nodes.len() as f64)
            .collect()
    }

    /// Action stream of one agent.
    pub fn actions_of(&self, node: usize) -> Vec<usize> {
        self.actions.iter().map(|a| a[node]).collect()
    }

    /// Observation rows of one agent (critic inputs).
    pub fn observations_of(&self, node: usize) -> Vec<Vec<f64>> {
        self.observations.iter().map(|o| o[node].clone()).collect()
    }

    /// Next-observation rows of one agent.
    pub fn next_observations_of(&self, node: usize) -> Vec<Vec<f64>> {
        self.next_observations
            .iter()
            .map(|o| o[node].clone())
            .collect()
    }

    /// State-action rows of one agent (TR inputs): the agent's observation
    /// row followed by the joint action.
    pub fn state_actions_of(&self, node: usize) -> Vec<Vec<f64>> {
        self.observations
            .iter()
            .zip(&self.actions)
            .map(|(o, a)| state_action(&o[node], a))
            .collect()
    }
}

/// Concatenates an observation row with the joint action.
pub fn state_action(observation_row: &[f64], joint_action: &[usize]) -> Vec<f64> {
    let mut row = Vec::with_capacity(observation_row.len() + joint_action.len());
    row.extend_from_slice(observation_row);
    row.extend(joint_action.iter().map(|&a| a as f64));
    row
}
