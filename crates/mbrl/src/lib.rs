//! # mbrl
//!
//! Model-ensemble policy optimization in Rust.
//!
//! ## Overview
//!
//! mbrl provides:
//! - An environment abstraction with the `MbEnv` trait
//! - Gaussian policies (feed-forward and recurrent) over a small dense network
//! - Real-environment and imagined (model-based) trajectory samplers
//! - GAE sample processing with pluggable baselines
//! - A bootstrapped dynamics ensemble with a rolling-persistency replay buffer
//! - PPO and TRPO policy optimizers behind a single `Algorithm` trait
//! - A `Trainer` that interleaves all of the above, with snapshots and metric logging
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use mbrl::prelude::*;
//! use mbrl_envs::Pendulum;
//!
//! let config = TrainerConfig::default().with_n_itr(10);
//! let policy = GaussianMlpPolicy::new(3, 1, &[32, 32], 1.0, config.seed);
//! let mut trainer = Trainer::new(
//!     config,
//!     ExecutionContext::new(4, 1),
//!     Pendulum::new,
//!     policy,
//!     LinearFeatureBaseline::default(),
//! )?;
//! trainer.train()?;
//! ```

pub mod algos;
pub mod baselines;
pub mod checkpoint;
pub mod dynamics;
pub mod env;
pub mod log;
pub mod nn;
pub mod optim;
pub mod policy;
pub mod samplers;
pub mod spaces;
pub mod training;
pub mod utils;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::algos::{Algorithm, OptimizationReport, Ppo, PpoConfig, Trpo, TrpoConfig};
    pub use crate::baselines::{Baseline, LinearFeatureBaseline, ZeroBaseline};
    pub use crate::checkpoint::{Checkpointable, Snapshot, SnapshotConfig, SnapshotManager, SnapshotMode};
    pub use crate::dynamics::{DynamicsConfig, DynamicsEnsemble, FitReport, MemberSelector};
    pub use crate::env::{EnvInfo, MbEnv, NormalizedEnv, StepResult};
    pub use crate::log::{CompositeLogger, ConsoleLogger, CsvLogger, MetricLogger, NoOpLogger};
    pub use crate::policy::{DiagonalGaussian, DistInfo, GaussianMlpPolicy, Policy, RecurrentGaussianPolicy};
    pub use crate::samplers::{
        MemberSelection, ModelSampler, Path, ProcessedBatch, SampleProcessor, Sampler, SamplingMode,
        Transition,
    };
    pub use crate::spaces::{Box as BoxSpace, Space};
    pub use crate::training::{
        AlgoConfig, ExecutionContext, Trainer, TrainerConfig, TrainerState, TrainingMode,
    };
    pub use crate::{MbrlError, Phase};
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Training phase in which an iteration failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Sampling,
    Processing,
    Fitting,
    ImaginedSampling,
    Optimizing,
    Snapshot,
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            Phase::Sampling => "sampling",
            Phase::Processing => "processing",
            Phase::Fitting => "fitting",
            Phase::ImaginedSampling => "imagined sampling",
            Phase::Optimizing => "optimizing",
            Phase::Snapshot => "snapshot",
        };
        f.write_str(name)
    }
}

/// Error types for the library
#[derive(Debug, thiserror::Error)]
pub enum MbrlError {
    #[error("Environment error: {0}")]
    EnvError(String),

    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Inconsistent agent info keys: expected {expected:?}, got {actual:?}")]
    InconsistentAgentInfo {
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Missing distribution info: {0}")]
    MissingDistInfo(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Numerical error: {0}")]
    NumericalError(String),

    #[error("Execution context error: {0}")]
    ContextError(String),

    #[error("Iteration {itr} failed during {phase}: {source}")]
    IterationFailed {
        itr: usize,
        phase: Phase,
        #[source]
        source: Box<MbrlError>,
    },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),
}

impl MbrlError {
    /// Wrap an error with the iteration and phase it occurred in.
    pub fn in_phase(self, itr: usize, phase: Phase) -> Self {
        MbrlError::IterationFailed {
            itr,
            phase,
            source: Box::new(self),
        }
    }
}

pub type Result<T> = core::result::Result<T, MbrlError>;
