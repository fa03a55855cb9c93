//! Model-based training loop.

use super::config::{TrainerConfig, TrainingMode};
use super::context::ExecutionContext;
use crate::algos::{Algorithm, OptimizationReport};
use crate::baselines::Baseline;
use crate::checkpoint::{Checkpointable, EnvRecord, Snapshot, SnapshotManager};
use crate::dynamics::{DynamicsEnsemble, FitReport};
use crate::env::MbEnv;
use crate::log::{MetricLogger, NoOpLogger};
use crate::policy::{Policy, PolicyRecord};
use crate::samplers::{
    return_stats, ModelSampler, Path, ProcessedBatch, SampleProcessor, Sampler, SamplingMode,
};
use crate::utils::{abbreviate, format_duration};
use crate::{MbrlError, Phase, Result};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::time::Instant;

/// Where the trainer is in its iteration cycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainerState {
    Uninitialized,
    /// Iteration 0 sampling with random or sinusoid actions
    Warmup,
    SampleReal,
    FitDynamics,
    SampleImagined,
    OptimizePolicy,
    /// Logging diagnostics and writing the snapshot
    Snapshot,
    Done,
    Failed,
}

fn at(itr: usize, phase: Phase) -> impl FnOnce(MbrlError) -> MbrlError {
    move |e| e.in_phase(itr, phase)
}

/// Action source for an iteration's real rollouts.
///
/// Only the first iteration of a model-based run warms up; random actions win
/// when both warmup flags are set.
fn real_sampling_mode(config: &TrainerConfig, itr: usize) -> SamplingMode {
    if itr != 0 || config.mode != TrainingMode::ModelBased {
        return SamplingMode::Policy;
    }
    if config.initial_random_samples {
        SamplingMode::Random
    } else if config.initial_sinusoid_samples {
        SamplingMode::Sinusoid {
            amplitude: config.sampler.sinusoid_amplitude,
            period: config.sampler.sinusoid_period,
        }
    } else {
        SamplingMode::Policy
    }
}

fn insert_report(metrics: &mut BTreeMap<String, f64>, report: &OptimizationReport) {
    metrics.insert("Policy-LossBefore".to_string(), report.loss_before);
    metrics.insert("Policy-LossAfter".to_string(), report.loss_after);
    metrics.insert("Policy-MeanKL".to_string(), report.mean_kl);
    metrics.insert("Policy-Epochs".to_string(), report.epochs as f64);
}

fn insert_fit(metrics: &mut BTreeMap<String, f64>, report: &FitReport) {
    metrics.insert("Dynamics-TrainLoss".to_string(), report.final_train_loss());
    metrics.insert("Dynamics-ValidLoss".to_string(), report.final_valid_loss());
    metrics.insert("Dynamics-Epochs".to_string(), report.epochs as f64);
    metrics.insert("Dynamics-OldMinibatches".to_string(), report.old_minibatches as f64);
    metrics.insert("Dynamics-NewMinibatches".to_string(), report.new_minibatches as f64);
    metrics.insert(
        "Dynamics-StoppedEarly".to_string(),
        if report.stopped_early { 1.0 } else { 0.0 },
    );
    metrics.insert("Dynamics-BufferSize".to_string(), report.buffer_len as f64);
}

/// Interleaves real sampling, dynamics fitting, imagined sampling and policy
/// optimization.
///
/// The trainer owns every component for the lifetime of the run. The
/// execution context is acquired when `train` starts and released when it
/// returns, whether or not an iteration failed.
///
/// # Example
///
/// ```ignore
/// let mut trainer = Trainer::new(config, ExecutionContext::new(4, 1), Pendulum::new, policy, baseline)?
///     .with_logger(Box::new(CsvLogger::new("./runs/pendulum")?));
/// if let Some(snapshot) = SnapshotManager::new(snapshot_config)?.load_latest()? {
///     trainer.restore(&snapshot)?;
/// }
/// trainer.train()?;
/// ```
pub struct Trainer<E, P, B>
where
    E: MbEnv,
    P: Policy + Checkpointable<Record = PolicyRecord>,
    B: Baseline + Clone,
{
    config: TrainerConfig,
    ctx: ExecutionContext,
    policy: P,
    sampler: Sampler<E>,
    /// Policy evaluation rollouts, kept apart so they never reach the buffer
    eval_sampler: Option<Sampler<E>>,
    /// Reward function, termination and start states for imagined rollouts
    model_env: E,
    model_sampler: ModelSampler,
    real_processor: SampleProcessor<B>,
    imagined_processor: SampleProcessor<B>,
    dynamics: DynamicsEnsemble,
    algo: Box<dyn Algorithm>,
    snapshots: SnapshotManager,
    logger: Box<dyn MetricLogger>,
    env_record: EnvRecord,
    state: TrainerState,
    /// Next iteration to run
    itr: usize,
    /// Timesteps sampled before a restored snapshot was taken
    restored_timesteps: u64,
}

impl<E, P, B> Trainer<E, P, B>
where
    E: MbEnv,
    P: Policy + Checkpointable<Record = PolicyRecord>,
    B: Baseline + Clone,
{
    /// Create a new trainer
    pub fn new<F>(
        config: TrainerConfig,
        ctx: ExecutionContext,
        make_env: F,
        policy: P,
        baseline: B,
    ) -> Result<Self>
    where
        F: Fn() -> E,
    {
        config.validate()?;
        let model_env = make_env();
        let obs_dim = model_env.observation_space().dim();
        let act_dim = model_env.action_space().dim();
        if policy.obs_dim() != obs_dim || policy.action_dim() != act_dim {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![obs_dim, act_dim],
                actual: vec![policy.obs_dim(), policy.action_dim()],
            });
        }

        let sampler = Sampler::new(&make_env, &config.sampler, config.seed)?;
        let eval_sampler = if config.log_real_performance {
            Some(Sampler::new(
                &make_env,
                &config.sampler,
                config.seed.wrapping_add(1),
            )?)
        } else {
            None
        };
        let env_record = EnvRecord {
            name: model_env.name().to_string(),
            obs_dim,
            action_dim: act_dim,
        };

        Ok(Self {
            model_sampler: ModelSampler::new(config.imagined.clone(), config.seed)?,
            real_processor: SampleProcessor::new(config.processor.clone(), baseline.clone())?,
            imagined_processor: SampleProcessor::new(config.processor.clone(), baseline)?,
            dynamics: DynamicsEnsemble::new(config.dynamics.clone(), obs_dim, act_dim, config.seed)?,
            algo: config.algo.build()?,
            snapshots: SnapshotManager::new(config.snapshot.clone())?,
            logger: Box::new(NoOpLogger),
            itr: config.start_itr,
            restored_timesteps: 0,
            state: TrainerState::Uninitialized,
            config,
            ctx,
            policy,
            sampler,
            eval_sampler,
            model_env,
            env_record,
        })
    }

    /// Set the metric logger
    pub fn with_logger(mut self, logger: Box<dyn MetricLogger>) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn state(&self) -> TrainerState {
        self.state
    }

    /// Next iteration `train` will run
    pub fn itr(&self) -> usize {
        self.itr
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn into_policy(self) -> P {
        self.policy
    }

    pub fn dynamics(&self) -> &DynamicsEnsemble {
        &self.dynamics
    }

    /// Real-environment timesteps used for training, including restored ones
    pub fn total_timesteps(&self) -> u64 {
        self.restored_timesteps + self.sampler.total_timesteps_sampled()
    }

    /// Load policy, dynamics and optimizer state and continue after the
    /// snapshot's iteration.
    pub fn restore(&mut self, snapshot: &Snapshot) -> Result<()> {
        if snapshot.env.obs_dim != self.env_record.obs_dim
            || snapshot.env.action_dim != self.env_record.action_dim
        {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![self.env_record.obs_dim, self.env_record.action_dim],
                actual: vec![snapshot.env.obs_dim, snapshot.env.action_dim],
            });
        }
        if snapshot.env.name != self.env_record.name {
            tracing::warn!(
                snapshot_env = %snapshot.env.name,
                env = %self.env_record.name,
                "Restoring a snapshot taken on a different environment"
            );
        }
        self.policy.load_record(&snapshot.policy)?;
        self.dynamics.load_record(&snapshot.dynamics)?;
        self.algo.load_record(&snapshot.algorithm)?;
        self.itr = snapshot.next_itr();
        self.restored_timesteps = snapshot.total_timesteps;
        tracing::info!(
            itr = snapshot.itr,
            total_timesteps = snapshot.total_timesteps,
            members = self.dynamics.num_members(),
            "Restored snapshot"
        );
        Ok(())
    }

    /// Run iterations from the current one up to `n_itr`.
    pub fn train(&mut self) -> Result<()> {
        self.ctx.acquire()?;
        let result = self.run();
        self.ctx.release();
        self.logger.close();
        self.state = match result {
            Ok(()) => TrainerState::Done,
            Err(_) => TrainerState::Failed,
        };
        result
    }

    fn run(&mut self) -> Result<()> {
        if self.config.mode == TrainingMode::ModelBased {
            let created = self.dynamics.initialize_missing();
            tracing::debug!(created, "Initialized dynamics members");
        }

        let n_itr = self.config.n_itr;
        let progress = if self.config.show_progress && self.itr < n_itr {
            let pb = ProgressBar::new((n_itr - self.itr) as u64);
            let style = ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .map(|s| s.progress_chars("#>-"))
                .unwrap_or_else(|_| ProgressStyle::default_bar());
            pb.set_style(style);
            Some(pb)
        } else {
            None
        };

        let start = Instant::now();
        tracing::info!(start_itr = self.itr, n_itr, mode = ?self.config.mode, algo = self.algo.name(), "Starting training");
        while self.itr < n_itr {
            let itr = self.itr;
            let mut metrics = self.iteration(itr)?;
            metrics.insert("Time".to_string(), start.elapsed().as_secs_f64());

            self.state = TrainerState::Snapshot;
            self.logger.log_metrics(&metrics, itr as u64);
            self.save_snapshot(itr).map_err(at(itr, Phase::Snapshot))?;

            if let Some(ref pb) = progress {
                pb.inc(1);
                let ret = metrics.get("Real-AverageReturn").copied().unwrap_or(f64::NAN);
                pb.set_message(format!(
                    "Return: {:.2} | Steps: {}",
                    ret,
                    abbreviate(self.total_timesteps())
                ));
            }
            self.itr = itr + 1;
        }
        if let Some(pb) = progress {
            pb.finish_with_message("done");
        }
        tracing::info!(
            total_timesteps = self.total_timesteps(),
            elapsed = %format_duration(start.elapsed().as_secs_f64()),
            "Training finished"
        );
        Ok(())
    }

    fn iteration(&mut self, itr: usize) -> Result<BTreeMap<String, f64>> {
        let itr_start = Instant::now();
        let mut metrics = BTreeMap::new();

        // Real rollouts
        let model_based = self.config.mode == TrainingMode::ModelBased;
        let mode = real_sampling_mode(&self.config, itr);
        self.state = if mode == SamplingMode::Policy {
            TrainerState::SampleReal
        } else {
            TrainerState::Warmup
        };
        let t = Instant::now();
        let paths = self
            .sampler
            .obtain_samples(&self.policy, mode, &self.ctx, itr)
            .map_err(at(itr, Phase::Sampling))?;
        metrics.insert("Time-EnvSampling".to_string(), t.elapsed().as_secs_f64());
        tracing::info!(itr, rollouts = paths.len(), ?mode, "Sampled real rollouts");

        let t = Instant::now();
        let real_batch = self
            .real_processor
            .process(&paths, "Real-")
            .map_err(at(itr, Phase::Processing))?;
        metrics.insert("Time-EnvSampleProc".to_string(), t.elapsed().as_secs_f64());
        metrics.extend(real_batch.stats.clone());
        metrics.extend(self.model_env.log_diagnostics(&paths, "Real-"));

        if model_based {
            self.model_based_update(itr, &real_batch, &mut metrics)?;
        } else {
            self.state = TrainerState::OptimizePolicy;
            let t = Instant::now();
            let report = self
                .algo
                .optimize(&mut self.policy, &real_batch)
                .map_err(at(itr, Phase::Optimizing))?;
            metrics.insert("Time-ModelFit".to_string(), 0.0);
            metrics.insert("Time-ModelSampling".to_string(), 0.0);
            metrics.insert("Time-Optimization".to_string(), t.elapsed().as_secs_f64());
            metrics.insert("Policy-Steps".to_string(), 1.0);
            insert_report(&mut metrics, &report);
        }

        if self.eval_sampler.is_some() {
            let eval_paths = self.evaluate(itr).map_err(at(itr, Phase::Sampling))?;
            metrics.extend(return_stats(
                &eval_paths,
                self.config.processor.discount,
                "RealTrajs-",
            ));
            metrics.extend(self.model_env.log_diagnostics(&eval_paths, "RealTrajs-"));
        }

        for (name, value) in self.policy.log_diagnostics() {
            metrics.insert(format!("Policy-{}", name), value);
        }
        metrics.insert("Itr".to_string(), itr as f64);
        metrics.insert("n_timesteps".to_string(), self.total_timesteps() as f64);
        metrics.insert("ItrTime".to_string(), itr_start.elapsed().as_secs_f64());

        tracing::info!(
            itr,
            n_timesteps = self.total_timesteps(),
            average_return = metrics.get("Real-AverageReturn").copied().unwrap_or(f64::NAN),
            itr_time = metrics["ItrTime"],
            "Iteration complete"
        );
        Ok(metrics)
    }

    /// Fit the ensemble on the real batch, then alternate imagined sampling
    /// and optimization for this iteration's number of steps.
    fn model_based_update(
        &mut self,
        itr: usize,
        real_batch: &ProcessedBatch,
        metrics: &mut BTreeMap<String, f64>,
    ) -> Result<()> {
        self.state = TrainerState::FitDynamics;
        let t = Instant::now();
        let fit = self
            .dynamics
            .fit(
                real_batch.observations.view(),
                real_batch.actions.view(),
                real_batch.next_observations.view(),
                real_batch.rewards.view(),
                self.config.dynamics.max_epochs,
            )
            .map_err(at(itr, Phase::Fitting))?;
        metrics.insert("Time-ModelFit".to_string(), t.elapsed().as_secs_f64());
        insert_fit(metrics, &fit);

        let steps = self.config.steps_for_itr(itr);
        let max_steps = self.config.steps_per_iter.0.max(self.config.steps_per_iter.1) as u64;
        let mut sampling_time = 0.0;
        let mut optimization_time = 0.0;
        let mut disagreement = 0.0;
        let mut last_report = OptimizationReport::default();
        let mut last_stats = BTreeMap::new();

        for step in 0..steps {
            self.state = TrainerState::SampleImagined;
            let t = Instant::now();
            let stream = itr as u64 * max_steps + step as u64;
            let imagined = self
                .model_sampler
                .obtain_samples(&self.policy, &self.dynamics, &mut self.model_env, stream)
                .map_err(at(itr, Phase::ImaginedSampling))?;
            disagreement += self.model_sampler.last_mean_disagreement();
            let batch = self
                .imagined_processor
                .process(&imagined, "Imagined-")
                .map_err(at(itr, Phase::Processing))?;
            sampling_time += t.elapsed().as_secs_f64();

            self.state = TrainerState::OptimizePolicy;
            let t = Instant::now();
            last_report = self
                .algo
                .optimize(&mut self.policy, &batch)
                .map_err(at(itr, Phase::Optimizing))?;
            optimization_time += t.elapsed().as_secs_f64();
            tracing::debug!(
                itr,
                step,
                loss_before = last_report.loss_before,
                loss_after = last_report.loss_after,
                "Policy step on imagined batch"
            );
            last_stats = batch.stats;
        }

        metrics.insert("Time-ModelSampling".to_string(), sampling_time);
        metrics.insert("Time-Optimization".to_string(), optimization_time);
        metrics.insert("Policy-Steps".to_string(), steps as f64);
        metrics.insert(
            "Dynamics-MeanDisagreement".to_string(),
            disagreement / steps.max(1) as f64,
        );
        insert_report(metrics, &last_report);
        metrics.extend(last_stats);
        Ok(())
    }

    /// Roll out the updated policy; the paths are only used for diagnostics.
    fn evaluate(&mut self, itr: usize) -> Result<Vec<Path>> {
        match self.eval_sampler.as_mut() {
            Some(sampler) => sampler.obtain_samples(&self.policy, SamplingMode::Policy, &self.ctx, itr),
            None => Ok(Vec::new()),
        }
    }

    fn save_snapshot(&self, itr: usize) -> Result<()> {
        if !self.snapshots.should_save(itr) {
            return Ok(());
        }
        let dynamics = if self.config.snapshot.save_buffer {
            self.dynamics.record_with_buffer()
        } else {
            self.dynamics.record()
        };
        let snapshot = Snapshot::new(
            itr,
            self.total_timesteps(),
            self.policy.record(),
            dynamics,
            self.algo.record(),
            self.env_record.clone(),
        );
        self.snapshots.save(&snapshot)?;
        Ok(())
    }
}
