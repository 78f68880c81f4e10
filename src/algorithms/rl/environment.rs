//! Multi-agent environments.
//!
//! [`Environment`] is the contract the trainer drives; [`GridWorld`] is a
//! small seeded cooperative-navigation task used by the binary and tests.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::training::buffer::Observation;

/// A synchronous multi-agent environment.
///
/// After [`Environment::step`], [`Environment::get_data`] reports the new
/// global state together with the per-agent rewards of that step.
pub trait Environment {
    fn n_agents(&self) -> usize;

    /// Dimension of a single agent's state.
    fn n_states(&self) -> usize;

    /// Number of discrete actions available to each agent.
    fn n_actions(&self) -> usize;

    /// Width of one agent's observation row.
    fn observation_dim(&self) -> usize;

    /// Starts a new episode.
    fn reset(&mut self);

    /// Global state and the per-agent rewards of the last step.
    fn get_data(&self) -> (Vec<f64>, Vec<f64>);

    /// Observation rows, shaped `[n_agents][observation_dim]`.
    fn get_observations(&self) -> Observation;

    /// Applies one joint action.
    fn step(&mut self, actions: &[usize]);
}

/// Grid moves available to every agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Move {
    Stay,
    Up,
    Down,
    Left,
    Right,
}

impl Move {
    pub const ALL: [Move; 5] = [Move::Stay, Move::Up, Move::Down, Move::Left, Move::Right];

    /// Maps an action index to a move; out-of-range indices stay in place.
    pub fn from_action(action: usize) -> Self {
        Self::ALL.get(action).copied().unwrap_or(Move::Stay)
    }

    fn delta(self) -> (i64, i64) {
        match self {
            Move::Stay => (0, 0),
            Move::Up => (-1, 0),
            Move::Down => (1, 0),
            Move::Left => (0, -1),
            Move::Right => (0, 1),
        }
    }
}

/// Cooperative navigation on an `nrow × ncol` grid.
///
/// Every agent has a fixed goal cell drawn once at construction and is
/// rewarded with its negated, normalized Manhattan distance to that goal
/// after each step. Agent positions are re-drawn on every reset.
///
/// The observation row of agent `i` holds every agent's position followed by
/// agent `i`'s goal, all normalized to `[0, 1]`.
#[derive(Debug, Clone)]
pub struct GridWorld {
    nrow: usize,
    ncol: usize,
    positions: Vec<(i64, i64)>,
    goals: Vec<(i64, i64)>,
    rewards: Vec<f64>,
    rng: StdRng,
}

impl GridWorld {
    pub fn new(nrow: usize, ncol: usize, n_agents: usize, seed: u64) -> Self {
        let nrow = nrow.max(1);
        let ncol = ncol.max(1);
        let mut rng = StdRng::seed_from_u64(seed);
        let goals = (0..n_agents)
            .map(|_| random_cell(&mut rng, nrow, ncol))
            .collect();
        let mut world = Self {
            nrow,
            ncol,
            positions: Vec::new(),
            goals,
            rewards: vec![0.0; n_agents],
            rng,
        };
        world.reset();
        world
    }

    pub fn positions(&self) -> &[(i64, i64)] {
        &self.positions
    }

    pub fn goals(&self) -> &[(i64, i64)] {
        &self.goals
    }

    fn distance_reward(&self, agent: usize) -> f64 {
        let (r, c) = self.positions[agent];
        let (gr, gc) = self.goals[agent];
        let dist = (r - gr).abs() + (c - gc).abs();
        -(dist as f64) / (self.nrow + self.ncol) as f64
    }

    fn normalized(&self, (r, c): (i64, i64)) -> [f64; 2] {
        let scale = |v: i64, n: usize| {
            if n > 1 {
                v as f64 / (n - 1) as f64
            } else {
                0.0
            }
        };
        [scale(r, self.nrow), scale(c, self.ncol)]
    }
}

fn random_cell(rng: &mut StdRng, nrow: usize, ncol: usize) -> (i64, i64) {
    (
        rng.gen_range(0..nrow) as i64,
        rng.gen_range(0..ncol) as i64,
    )
}

impl Environment for GridWorld {
    fn n_agents(&self) -> usize {
        self.goals.len()
    }

    fn n_states(&self) -> usize {
        2
    }

    fn n_actions(&self) -> usize {
        Move::ALL.len()
    }

    fn observation_dim(&self) -> usize {
        (self.n_agents() + 1) * 2
    }

    fn reset(&mut self) {
        let (nrow, ncol) = (self.nrow, self.ncol);
        self.positions = (0..self.goals.len())
            .map(|_| random_cell(&mut self.rng, nrow, ncol))
            .collect();
        self.rewards = vec![0.0; self.goals.len()];
    }

    fn get_data(&self) -> (Vec<f64>, Vec<f64>) {
        let state = self
            .positions
            .iter()
            .flat_map(|&(r, c)| [r as f64, c as f64])
            .collect();
        (state, self.rewards.clone())
    }

    fn get_observations(&self) -> Observation {
        let shared: Vec<f64> = self
            .positions
            .iter()
            .flat_map(|&p| self.normalized(p))
            .collect();
        self.goals
            .iter()
            .map(|&goal| {
                let mut row = shared.clone();
                row.extend(self.normalized(goal));
                row
            })
            .collect()
    }

    fn step(&mut self, actions: &[usize]) {
        let max_r = self.nrow as i64 - 1;
        let max_c = self.ncol as i64 - 1;
        for (pos, &action) in self.positions.iter_mut().zip(actions) {
            let (dr, dc) = Move::from_action(action).delta();
            pos.0 = (pos.0 + dr).clamp(0, max_r);
            pos.1 = (pos.1 + dc).clamp(0, max_c);
        }
        self.rewards = (0..self.goals.len())
            .map(|i| self.distance_reward(i))
            .collect();
    }
}
