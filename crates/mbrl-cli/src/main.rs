//! mbrl CLI
//!
//! Command-line interface for model-based training and snapshot evaluation.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use mbrl::algos::{PpoConfig, TrpoConfig};
use mbrl::baselines::LinearFeatureBaseline;
use mbrl::checkpoint::{Checkpointable, SnapshotManager, SnapshotMode};
use mbrl::env::MbEnv;
use mbrl::log::{CompositeLogger, ConsoleLogger, CsvLogger};
use mbrl::policy::{GaussianMlpPolicy, Policy, PolicyRecord, RecurrentGaussianPolicy};
use mbrl::samplers::{return_stats, Sampler, SamplerConfig, SamplingMode};
use mbrl::training::{AlgoConfig, ExecutionContext, Trainer, TrainerConfig, TrainingMode};
use mbrl_envs::{EnvFactory, ENV_NAMES};

#[derive(Parser)]
#[command(name = "mbrl")]
#[command(version, about = "mbrl - Model-ensemble policy optimization in Rust", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum AlgoArg {
    Ppo,
    Trpo,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    ModelBased,
    ModelFree,
}

#[derive(Clone, Copy, ValueEnum)]
enum SnapshotArg {
    Last,
    All,
    None,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a policy
    Train {
        /// Environment name
        #[arg(default_value = "pendulum")]
        env: String,

        /// JSON config file; flags below override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of iterations
        #[arg(long)]
        n_itr: Option<usize>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Policy optimizer (defaults to the config's)
        #[arg(long, value_enum)]
        algo: Option<AlgoArg>,

        /// Optimize on imagined or real rollouts
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Number of environments stepped in parallel
        #[arg(long)]
        n_parallel: Option<usize>,

        /// Directory for progress.csv and snapshots
        #[arg(long)]
        log_dir: Option<PathBuf>,

        /// Snapshot retention
        #[arg(long, value_enum)]
        snapshot_mode: Option<SnapshotArg>,

        /// Keep a snapshot every N iterations (overrides --snapshot-mode)
        #[arg(long)]
        snapshot_gap: Option<usize>,

        /// Resume from the latest snapshot in the log directory
        #[arg(long)]
        resume: bool,

        /// Show a progress bar
        #[arg(long)]
        progress: bool,
    },

    /// Evaluate a policy snapshot on the real environment
    Eval {
        /// Snapshot file (params.json or itr_NNNNNN.json)
        snapshot: PathBuf,

        /// Environment name (defaults to the one recorded in the snapshot)
        #[arg(long)]
        env: Option<String>,

        /// Number of episodes
        #[arg(long, default_value = "10")]
        episodes: usize,

        /// Maximum steps per episode
        #[arg(long, default_value = "200")]
        max_path_length: usize,

        /// Act with the policy mean instead of sampling
        #[arg(long)]
        deterministic: bool,
    },

    /// List available environments
    List,

    /// Print the default training config as JSON
    Config {
        /// Write to a file instead of stdout
        #[arg(long)]
        output: Option<PathBuf>,

        /// Policy optimizer
        #[arg(long, value_enum, default_value = "ppo")]
        algo: AlgoArg,
    },
}

fn main() -> Result<()> {
    // Logs go to stderr so stdout stays machine-readable
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            env,
            config,
            n_itr,
            seed,
            algo,
            mode,
            n_parallel,
            log_dir,
            snapshot_mode,
            snapshot_gap,
            resume,
            progress,
        } => {
            let mut config = match config {
                Some(path) => TrainerConfig::load(&path)
                    .with_context(|| format!("failed to read config {}", path.display()))?,
                None => TrainerConfig::default(),
            };
            if let Some(n) = n_itr {
                config.n_itr = n;
            }
            if let Some(s) = seed {
                config.seed = s;
            }
            if let Some(a) = algo {
                config.algo = algo_config(a);
            }
            if let Some(m) = mode {
                config.mode = match m {
                    ModeArg::ModelBased => TrainingMode::ModelBased,
                    ModeArg::ModelFree => TrainingMode::ModelFree,
                };
            }
            if let Some(n) = n_parallel {
                config.sampler.n_parallel = n;
            }
            if let Some(dir) = log_dir {
                config.snapshot.dir = Some(dir);
            }
            if let Some(m) = snapshot_mode {
                config.snapshot.mode = match m {
                    SnapshotArg::Last => SnapshotMode::Last,
                    SnapshotArg::All => SnapshotMode::All,
                    SnapshotArg::None => SnapshotMode::None,
                };
            }
            if let Some(gap) = snapshot_gap {
                config.snapshot.mode = SnapshotMode::Gap(gap);
            }
            config.show_progress |= progress;
            train(&env, config, resume)?;
        }
        Commands::Eval {
            snapshot,
            env,
            episodes,
            max_path_length,
            deterministic,
        } => {
            eval(&snapshot, env.as_deref(), episodes, max_path_length, deterministic)?;
        }
        Commands::List => {
            list_envs();
        }
        Commands::Config { output, algo } => {
            let config = TrainerConfig::default().with_algo(algo_config(algo));
            match output {
                Some(path) => {
                    config.save(&path)?;
                    println!("Wrote {}", path.display());
                }
                None => println!("{}", serde_json::to_string_pretty(&config)?),
            }
        }
    }

    Ok(())
}

fn algo_config(algo: AlgoArg) -> AlgoConfig {
    match algo {
        AlgoArg::Ppo => AlgoConfig::Ppo(PpoConfig::default()),
        AlgoArg::Trpo => AlgoConfig::Trpo(TrpoConfig::default()),
    }
}

fn env_factory(name: &str) -> Result<EnvFactory> {
    mbrl_envs::factory(name).ok_or_else(|| {
        anyhow!(
            "Unknown environment '{}' (available: {})",
            name,
            ENV_NAMES.join(", ")
        )
    })
}

fn train(env_name: &str, config: TrainerConfig, resume: bool) -> Result<()> {
    let factory = env_factory(env_name)?;
    config.validate()?;

    let env = factory();
    let obs_dim = env.observation_space().dim();
    let act_dim = env.action_space().dim();
    tracing::info!(
        env = env_name,
        obs_dim,
        act_dim,
        n_itr = config.n_itr,
        algo = config.algo.name(),
        mode = ?config.mode,
        "Starting training"
    );

    let p = &config.policy;
    match p.recurrent_hidden_dim {
        Some(hidden_dim) => {
            let policy = RecurrentGaussianPolicy::new(
                obs_dim,
                act_dim,
                hidden_dim,
                &p.hidden_sizes,
                p.init_std,
                config.seed,
            );
            run_training(factory, policy, config, resume)
        }
        None => {
            let policy =
                GaussianMlpPolicy::new(obs_dim, act_dim, &p.hidden_sizes, p.init_std, config.seed);
            run_training(factory, policy, config, resume)
        }
    }
}

fn run_training<P>(factory: EnvFactory, policy: P, config: TrainerConfig, resume: bool) -> Result<()>
where
    P: Policy + Checkpointable<Record = PolicyRecord>,
{
    tracing::info!(params = policy.num_params(), kind = policy.kind(), "Created policy");

    let mut logger = CompositeLogger::new(vec![Box::new(ConsoleLogger::new())]);
    if let Some(dir) = &config.snapshot.dir {
        let csv = CsvLogger::new(dir)?;
        tracing::info!(path = %csv.path().display(), "Logging progress");
        logger.add(Box::new(csv));
    }

    let latest = if resume {
        let manager = SnapshotManager::new(config.snapshot.clone())?;
        let latest = manager.load_latest()?;
        if latest.is_none() {
            tracing::warn!("No snapshot found, starting from scratch");
        }
        latest
    } else {
        None
    };

    let ctx = ExecutionContext::new(config.sampler.n_parallel, config.seed);
    let mut trainer = Trainer::new(
        config,
        ctx,
        factory,
        policy,
        LinearFeatureBaseline::default(),
    )?
    .with_logger(Box::new(logger));
    if let Some(snapshot) = latest {
        trainer.restore(&snapshot)?;
    }

    trainer.train()?;
    println!(
        "Training complete: {} iterations, {} timesteps",
        trainer.itr(),
        trainer.total_timesteps()
    );
    Ok(())
}

fn eval(
    path: &std::path::Path,
    env_name: Option<&str>,
    episodes: usize,
    max_path_length: usize,
    deterministic: bool,
) -> Result<()> {
    let snapshot = SnapshotManager::load(path)
        .with_context(|| format!("failed to load snapshot {}", path.display()))?;
    let env_name = env_name.unwrap_or(&snapshot.env.name);
    let factory = env_factory(env_name)?;
    println!("Starting evaluation: {} episodes on {} (itr {})", episodes, env_name, snapshot.itr);

    let config = SamplerConfig {
        num_rollouts: episodes,
        max_path_length,
        n_parallel: 1,
        ..Default::default()
    };
    let mode = if deterministic {
        SamplingMode::Deterministic
    } else {
        SamplingMode::Policy
    };

    let record = &snapshot.policy;
    let policy: Box<dyn Policy> = match record.kind.as_str() {
        "gaussian_mlp" => Box::new(GaussianMlpPolicy::from_record(record)?),
        "recurrent_gaussian" => Box::new(RecurrentGaussianPolicy::from_record(record)?),
        other => bail!("Unknown policy kind '{}' in snapshot", other),
    };

    let mut sampler = Sampler::new(factory, &config, 0)?;
    let mut ctx = ExecutionContext::new(1, 0);
    ctx.acquire()?;
    let paths = sampler.obtain_samples(policy.as_ref(), mode, &ctx, 0);
    ctx.release();
    let paths = paths?;

    let env: Box<dyn MbEnv> = factory();
    let mut stats: Vec<(String, f64)> = return_stats(&paths, 1.0, "").into_iter().collect();
    stats.extend(env.log_diagnostics(&paths, ""));
    for (name, value) in stats {
        println!("{:<24} {:.4}", name, value);
    }
    Ok(())
}

fn list_envs() {
    println!("Available environments:");
    println!();
    println!("  pendulum          Torque-limited pendulum swing-up");
    println!("                    obs: cos, sin, angular velocity; action: torque");
    println!();
    println!("  point_mass        Planar point pushed towards the origin");
    println!("                    obs: position, velocity; action: force");
    println!();
    println!("  constant_reward   Unit reward for five steps, then terminal");
    println!("                    Tests: return and advantage computation");
}
