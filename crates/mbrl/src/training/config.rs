//! Trainer configuration.

use crate::algos::{Algorithm, Ppo, PpoConfig, Trpo, TrpoConfig};
use crate::checkpoint::SnapshotConfig;
use crate::dynamics::DynamicsConfig;
use crate::samplers::{ImaginedSamplerConfig, ProcessorConfig, SamplerConfig};
use crate::{MbrlError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Which batch the policy is optimized on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingMode {
    /// Fit the dynamics ensemble and optimize on imagined rollouts
    ModelBased,
    /// Skip the ensemble and optimize on the real batch
    ModelFree,
}

/// Policy optimizer, tagged by name in config files
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "snake_case")]
pub enum AlgoConfig {
    Ppo(PpoConfig),
    Trpo(TrpoConfig),
}

impl Default for AlgoConfig {
    fn default() -> Self {
        AlgoConfig::Ppo(PpoConfig::default())
    }
}

impl AlgoConfig {
    pub fn name(&self) -> &'static str {
        match self {
            AlgoConfig::Ppo(_) => "ppo",
            AlgoConfig::Trpo(_) => "trpo",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            AlgoConfig::Ppo(c) => c.validate(),
            AlgoConfig::Trpo(c) => c.validate(),
        }
    }

    /// Construct the optimizer this config describes.
    pub fn build(&self) -> Result<Box<dyn Algorithm>> {
        Ok(match self {
            AlgoConfig::Ppo(c) => Box::new(Ppo::new(c.clone())?),
            AlgoConfig::Trpo(c) => Box::new(Trpo::new(c.clone())?),
        })
    }
}

/// Policy architecture, used by front ends that build the policy from config
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub hidden_sizes: Vec<usize>,
    pub init_std: f64,
    /// Build a recurrent policy with this state size
    pub recurrent_hidden_dim: Option<usize>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            hidden_sizes: vec![32, 32],
            init_std: 1.0,
            recurrent_hidden_dim: None,
        }
    }
}

/// Configuration for the model-based trainer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Random seed for every component
    pub seed: u64,
    /// Iteration to stop before
    pub n_itr: usize,
    /// Iteration to start at (non-zero when resuming)
    pub start_itr: usize,
    pub mode: TrainingMode,

    // Warmup (iteration 0 only)
    /// Uniform random actions at iteration 0; takes precedence over the sinusoid
    pub initial_random_samples: bool,
    /// Sinusoidal excitation at iteration 0 when random warmup is off
    pub initial_sinusoid_samples: bool,

    /// Imagined-sample/optimize steps per iteration, interpolated from the first
    /// to the last iteration
    pub steps_per_iter: (usize, usize),
    /// Evaluate the updated policy on the real environment each iteration
    pub log_real_performance: bool,
    pub show_progress: bool,

    pub policy: PolicyConfig,
    pub sampler: SamplerConfig,
    pub imagined: ImaginedSamplerConfig,
    pub processor: ProcessorConfig,
    pub dynamics: DynamicsConfig,
    pub algo: AlgoConfig,
    pub snapshot: SnapshotConfig,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            seed: 1,
            n_itr: 100,
            start_itr: 0,
            mode: TrainingMode::ModelBased,

            initial_random_samples: true,
            initial_sinusoid_samples: false,

            steps_per_iter: (50, 50),
            log_real_performance: true,
            show_progress: false,

            policy: PolicyConfig::default(),
            sampler: SamplerConfig::default(),
            imagined: ImaginedSamplerConfig::default(),
            processor: ProcessorConfig::default(),
            dynamics: DynamicsConfig::default(),
            algo: AlgoConfig::default(),
            snapshot: SnapshotConfig::default(),
        }
    }
}

impl TrainerConfig {
    /// Set number of iterations
    pub fn with_n_itr(mut self, n_itr: usize) -> Self {
        self.n_itr = n_itr;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_mode(mut self, mode: TrainingMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_steps_per_iter(mut self, first: usize, last: usize) -> Self {
        self.steps_per_iter = (first, last);
        self
    }

    pub fn with_algo(mut self, algo: AlgoConfig) -> Self {
        self.algo = algo;
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotConfig) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Reject inconsistent settings before anything is built
    pub fn validate(&self) -> Result<()> {
        if self.start_itr > self.n_itr {
            return Err(MbrlError::ConfigError(format!(
                "start_itr {} is past n_itr {}",
                self.start_itr, self.n_itr
            )));
        }
        if self.steps_per_iter.0 == 0 || self.steps_per_iter.1 == 0 {
            return Err(MbrlError::ConfigError(
                "steps_per_iter must be at least one step".to_string(),
            ));
        }
        if self.policy.hidden_sizes.iter().any(|&h| h == 0) || self.policy.init_std <= 0.0 {
            return Err(MbrlError::ConfigError(
                "policy needs non-zero hidden sizes and init_std > 0".to_string(),
            ));
        }
        if self.policy.recurrent_hidden_dim.is_some() && self.processor.backprop_steps.is_none() {
            return Err(MbrlError::ConfigError(
                "recurrent policies need processor.backprop_steps".to_string(),
            ));
        }
        if self.sampler.n_parallel == 0
            || self.sampler.num_rollouts == 0
            || self.sampler.max_path_length == 0
        {
            return Err(MbrlError::ConfigError(
                "sampler needs n_parallel, num_rollouts and max_path_length > 0".to_string(),
            ));
        }
        self.imagined.validate()?;
        self.processor.validate()?;
        self.dynamics.validate()?;
        self.algo.validate()?;
        self.snapshot.validate()
    }

    /// Imagined-sample/optimize steps for iteration `itr`.
    ///
    /// Linear in `itr` from `steps_per_iter.0` at iteration 0 to
    /// `steps_per_iter.1` at the last iteration, rounded to the nearest step.
    pub fn steps_for_itr(&self, itr: usize) -> usize {
        let (first, last) = self.steps_per_iter;
        if self.n_itr <= 1 {
            return first;
        }
        let frac = itr.min(self.n_itr - 1) as f64 / (self.n_itr - 1) as f64;
        let steps = first as f64 + frac * (last as f64 - first as f64);
        (steps.round() as usize).max(1)
    }

    /// Read a JSON config file; absent fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&data)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::SnapshotMode;
    use tempfile::tempdir;

    #[test]
    fn test_default_is_valid() {
        TrainerConfig::default().validate().unwrap();
    }

    #[test]
    fn test_steps_interpolation() {
        let config = TrainerConfig::default()
            .with_n_itr(5)
            .with_steps_per_iter(10, 50);
        let steps: Vec<usize> = (0..5).map(|i| config.steps_for_itr(i)).collect();
        assert_eq!(steps, vec![10, 20, 30, 40, 50]);

        let single = TrainerConfig::default()
            .with_n_itr(1)
            .with_steps_per_iter(7, 1);
        assert_eq!(single.steps_for_itr(0), 7);
    }

    #[test]
    fn test_json_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        let config = TrainerConfig::default()
            .with_n_itr(3)
            .with_algo(AlgoConfig::Trpo(TrpoConfig::default()))
            .with_snapshot(SnapshotConfig::new(dir.path()).mode(SnapshotMode::Gap(2)));
        config.save(&path).unwrap();
        assert_eq!(TrainerConfig::load(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: TrainerConfig =
            serde_json::from_str(r#"{"n_itr": 4, "algo": {"name": "trpo", "step_size": 0.05}}"#)
                .unwrap();
        assert_eq!(config.n_itr, 4);
        assert_eq!(config.seed, 1);
        match config.algo {
            AlgoConfig::Trpo(c) => {
                assert_eq!(c.step_size, 0.05);
                assert_eq!(c.cg_iters, 10);
            }
            other => panic!("unexpected algo {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_inconsistent_values() {
        let mut config = TrainerConfig::default().with_n_itr(2);
        config.start_itr = 3;
        assert!(config.validate().is_err());

        let mut config = TrainerConfig::default();
        config.policy.recurrent_hidden_dim = Some(8);
        assert!(config.validate().is_err());

        let mut config = TrainerConfig::default();
        config.dynamics.rolling_average_persistency = 1.5;
        assert!(config.validate().is_err());
    }
}
