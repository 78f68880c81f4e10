//! Per-episode returns, loss reporting and run artifacts.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::AgentRole;
use crate::error::TrainingError;

/// One row of the run's output table.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpisodeSummary {
    /// Mean critic estimate of the cooperative agents at episode start.
    pub estimated_team_return: f64,
    /// Mean discounted return of the cooperative agents.
    pub true_team_return: f64,
    /// Mean discounted return of the non-cooperative agents (0 if none).
    pub true_adversary_return: f64,
}

impl EpisodeSummary {
    /// Builds the summary from per-agent values indexed by node.
    ///
    /// Entries of `estimated` belonging to non-cooperative nodes are ignored.
    pub fn from_returns(roles: &[AgentRole], discounted: &[f64], estimated: &[f64]) -> Self {
        let mean_over = |values: &[f64], cooperative: bool| {
            let selected: Vec<f64> = roles
                .iter()
                .zip(values)
                .filter(|(r, _)| r.is_cooperative() == cooperative)
                .map(|(_, &v)| v)
                .collect();
            if selected.is_empty() {
                0.0
            } else {
                selected.iter().sum::<f64>() / selected.len() as f64
            }
        };
        Self {
            estimated_team_return: mean_over(estimated, true),
            true_team_return: mean_over(discounted, true),
            true_adversary_return: mean_over(discounted, false),
        }
    }
}

/// Accumulates `sum_j gamma^j r_j` per agent over one episode.
#[derive(Debug, Clone)]
pub struct DiscountedReturns {
    gamma: f64,
    discount: f64,
    returns: Vec<f64>,
}

impl DiscountedReturns {
    pub fn new(n_agents: usize, gamma: f64) -> Self {
        Self {
            gamma,
            discount: 1.0,
            returns: vec![0.0; n_agents],
        }
    }

    /// Adds the rewards of the next step.
    pub fn push(&mut self, rewards: &[f64]) {
        for (acc, r) in self.returns.iter_mut().zip(rewards) {
            *acc += self.discount * r;
        }
        self.discount *= self.gamma;
    }

    pub fn returns(&self) -> &[f64] {
        &self.returns
    }
}

/// Per-agent losses of the most recent update cycle.
///
/// `None` marks an update the agent's role does not perform, or a cycle
/// that has not happened yet.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleLosses {
    pub critic: Vec<Option<f64>>,
    pub tr: Vec<Option<f64>>,
    pub actor: Vec<Option<f64>>,
}

impl CycleLosses {
    pub fn new(n_agents: usize) -> Self {
        Self {
            critic: vec![None; n_agents],
            tr: vec![None; n_agents],
            actor: vec![None; n_agents],
        }
    }

    /// Whether any recorded loss is NaN or infinite.
    pub fn has_non_finite(&self) -> bool {
        self.critic
            .iter()
            .chain(&self.tr)
            .chain(&self.actor)
            .flatten()
            .any(|l| !l.is_finite())
    }
}

/// Human-readable line describing one finished episode.
#[derive(Debug, Clone)]
pub struct EpisodeLog<'a> {
    pub episode: usize,
    /// Critic estimates at episode start, cooperative agents only.
    pub estimated_returns: &'a [f64],
    pub true_team_return: f64,
    pub losses: &'a CycleLosses,
}

struct Floats<'a>(&'a [f64]);

impl fmt::Display for Floats<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v:.4}")?;
        }
        write!(f, "]")
    }
}

struct Losses<'a>(&'a [Option<f64>]);

impl fmt::Display for Losses<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match v {
                Some(v) => write!(f, "{v:.4}")?,
                None => write!(f, "-")?,
            }
        }
        write!(f, "]")
    }
}

impl fmt::Display for EpisodeLog<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "| Episode: {} | Est. returns: {} | Returns: {:.4} | Critic loss: {} | TR loss: {} | Actor loss: {}",
            self.episode,
            Floats(self.estimated_returns),
            self.true_team_return,
            Losses(&self.losses.critic),
            Losses(&self.losses.tr),
            Losses(&self.losses.actor),
        )
    }
}

/// Files written for a finished run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunArtifacts {
    /// `None` for in-memory recorders.
    pub run_dir: Option<PathBuf>,
    pub summaries: Vec<EpisodeSummary>,
}

/// Collects episode summaries and writes the run's log and table.
///
/// Created once before training starts; [`RunRecorder::create`] makes a
/// `run_<timestamp>/` directory holding `log_<timestamp>.txt`, and
/// [`RunRecorder::finish`] adds `summaries.json`.
#[derive(Debug)]
pub struct RunRecorder {
    run_dir: Option<PathBuf>,
    log: Option<BufWriter<File>>,
    summaries: Vec<EpisodeSummary>,
}

impl RunRecorder {
    /// Creates a timestamped run directory under `root`.
    pub fn create(root: impl AsRef<Path>) -> io::Result<Self> {
        let stamp = chrono::Local::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let run_dir = root.as_ref().join(format!("run_{stamp}"));
        fs::create_dir_all(&run_dir)?;
        let log = File::create(run_dir.join(format!("log_{stamp}.txt")))?;
        tracing::info!(dir = %run_dir.display(), "recording run");
        Ok(Self {
            run_dir: Some(run_dir),
            log: Some(BufWriter::new(log)),
            summaries: Vec::new(),
        })
    }

    /// Recorder that keeps summaries in memory and writes no files.
    pub fn in_memory() -> Self {
        Self {
            run_dir: None,
            log: None,
            summaries: Vec::new(),
        }
    }

    pub fn run_dir(&self) -> Option<&Path> {
        self.run_dir.as_deref()
    }

    pub fn summaries(&self) -> &[EpisodeSummary] {
        &self.summaries
    }

    /// Logs `line` and appends `summary` to the table.
    pub fn record(&mut self, line: &EpisodeLog<'_>, summary: EpisodeSummary) -> io::Result<()> {
        tracing::info!("{line}");
        if let Some(log) = self.log.as_mut() {
            writeln!(log, "{line}")?;
        }
        self.summaries.push(summary);
        Ok(())
    }

    /// Flushes the log and persists the summary table.
    pub fn finish(mut self) -> Result<RunArtifacts, TrainingError> {
        if let Some(log) = self.log.as_mut() {
            log.flush()?;
        }
        if let Some(dir) = &self.run_dir {
            let file = File::create(dir.join("summaries.json"))?;
            serde_json::to_writer_pretty(BufWriter::new(file), &self.summaries)?;
        }
        Ok(RunArtifacts {
            run_dir: self.run_dir,
            summaries: self.summaries,
        })
    }
}
