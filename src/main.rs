//! resilient-ac - trains resilient consensus actor-critic agents on a grid
//! navigation task and writes the run's log, summary table and parameters.

use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info};

use resilient_ac::algorithms::rl::{GridWorld, RunRecorder, Trainer, TrainingConfig};
use resilient_ac::error::{ConfigError, TrainingError};
use resilient_ac::telemetry;

/// Command line arguments for a training run
#[derive(Parser, Debug)]
#[command(name = "resilient-ac")]
#[command(about = "Byzantine-resilient consensus actor-critic training")]
struct Args {
    /// TOML configuration file (built-in defaults when omitted)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the number of training episodes
    #[arg(long)]
    episodes: Option<usize>,

    /// Override the random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Directory under which the run directory is created
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,

    /// Grid height
    #[arg(long, default_value_t = 5)]
    rows: usize,

    /// Grid width
    #[arg(long, default_value_t = 5)]
    cols: usize,
}

fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = telemetry::init_tracing() {
        eprintln!("{e}");
    }
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<(), TrainingError> {
    let mut config = match &args.config {
        Some(path) => TrainingConfig::load(path)?,
        None => TrainingConfig::default(),
    };
    if let Some(episodes) = args.episodes {
        config.n_episodes = episodes;
    }
    if let Some(seed) = args.seed {
        config.seed = seed;
    }

    let env = GridWorld::new(args.rows, args.cols, config.n_agents(), config.seed);
    let mut trainer = build_trainer(env, config)?;
    let recorder = RunRecorder::create(&args.out_dir)?;
    let outcome = trainer.train(recorder)?;

    if let Some(dir) = &outcome.run_dir {
        let file = File::create(dir.join("parameters.json"))?;
        serde_json::to_writer(BufWriter::new(file), &outcome.parameters)?;
        info!(dir = %dir.display(), "run artifacts written");
    }
    if let Some(last) = outcome.summaries.last() {
        info!(
            episodes = outcome.summaries.len(),
            team_return = last.true_team_return,
            adversary_return = last.true_adversary_return,
            "training finished"
        );
    }
    Ok(())
}

/// Trainer on libtorch networks (GPU when available) with `rl-nn`.
#[cfg(feature = "rl-nn")]
fn build_trainer(env: GridWorld, config: TrainingConfig) -> Result<Trainer<GridWorld>, ConfigError> {
    use resilient_ac::algorithms::rl::network::TchFactory;

    let device = tch::Device::cuda_if_available();
    info!(?device, "using libtorch networks");
    let mut factory = TchFactory::new(
        config.network.hidden_layers.clone(),
        config.batch_size,
        config.seed,
        device,
    );
    Trainer::with_factory(env, config, &mut factory)
}

#[cfg(not(feature = "rl-nn"))]
fn build_trainer(env: GridWorld, config: TrainingConfig) -> Result<Trainer<GridWorld>, ConfigError> {
    Trainer::new(env, config)
}
