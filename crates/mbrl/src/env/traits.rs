//! Core environment trait definitions.

use crate::samplers::Path;
use crate::spaces::Box as BoxSpace;
use crate::Result;
use ndarray::{Array1, ArrayView1};

/// Information returned from environment steps
#[derive(Clone, Debug, Default)]
pub struct EnvInfo {
    /// Custom metrics (kept minimal for performance)
    pub extra: smallvec::SmallVec<[(&'static str, f64); 4]>,
}

impl EnvInfo {
    /// Create empty info
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a custom metric
    pub fn with_extra(mut self, key: &'static str, value: f64) -> Self {
        self.extra.push((key, value));
        self
    }

    /// Get a value by key
    pub fn get(&self, key: &str) -> Option<f64> {
        self.extra.iter().find(|(k, _)| *k == key).map(|(_, v)| *v)
    }
}

/// Result from a single environment step
#[derive(Clone, Debug)]
pub struct StepResult {
    /// Observation after the step
    pub observation: Array1<f64>,
    /// Reward received
    pub reward: f64,
    /// Whether episode terminated (goal reached, failure, etc.)
    pub terminated: bool,
    /// Whether episode truncated (time limit, etc.)
    pub truncated: bool,
    /// Additional info
    pub info: EnvInfo,
}

impl StepResult {
    /// Check if episode is done (terminated or truncated)
    pub fn done(&self) -> bool {
        self.terminated || self.truncated
    }
}

/// Core trait for environments driven by the samplers.
///
/// Stepping is fallible: an error aborts the rollout collection it happened in.
/// The optional `reward` and `is_terminal` hooks let imagined rollouts use the
/// true reward and termination functions instead of learned ones.
///
/// # Example
///
/// ```rust,ignore
/// use mbrl::env::{MbEnv, StepResult, EnvInfo};
/// use mbrl::spaces::Box as BoxSpace;
///
/// struct Drift { x: f64 }
///
/// impl MbEnv for Drift {
///     fn observation_space(&self) -> BoxSpace { BoxSpace::unbounded(1) }
///     fn action_space(&self) -> BoxSpace { BoxSpace::symmetric(1) }
///     fn reset(&mut self, _seed: Option<u64>) -> Result<Array1<f64>> {
///         self.x = 0.0;
///         Ok(array![self.x])
///     }
///     fn step(&mut self, action: ArrayView1<f64>) -> Result<StepResult> {
///         // ... implement step logic
///     }
/// }
/// ```
pub trait MbEnv: Send {
    /// Get the observation space
    fn observation_space(&self) -> BoxSpace;

    /// Get the action space
    fn action_space(&self) -> BoxSpace;

    /// Reset the environment to an initial state
    fn reset(&mut self, seed: Option<u64>) -> Result<Array1<f64>>;

    /// Take a single step in the environment
    fn step(&mut self, action: ArrayView1<f64>) -> Result<StepResult>;

    /// Optional: closed-form reward for a transition
    fn reward(
        &self,
        _observation: ArrayView1<f64>,
        _action: ArrayView1<f64>,
        _next_observation: ArrayView1<f64>,
    ) -> Option<f64> {
        None
    }

    /// Optional: whether an observation is terminal
    fn is_terminal(&self, _observation: ArrayView1<f64>) -> bool {
        false
    }

    /// Optional: environment-specific statistics over a set of paths
    fn log_diagnostics(&self, _paths: &[Path], _prefix: &str) -> Vec<(String, f64)> {
        Vec::new()
    }

    /// Name used to reference the environment in snapshots
    fn name(&self) -> &str {
        "env"
    }
}

impl<E: MbEnv + ?Sized> MbEnv for std::boxed::Box<E> {
    fn observation_space(&self) -> BoxSpace {
        (**self).observation_space()
    }

    fn action_space(&self) -> BoxSpace {
        (**self).action_space()
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<Array1<f64>> {
        (**self).reset(seed)
    }

    fn step(&mut self, action: ArrayView1<f64>) -> Result<StepResult> {
        (**self).step(action)
    }

    fn reward(
        &self,
        observation: ArrayView1<f64>,
        action: ArrayView1<f64>,
        next_observation: ArrayView1<f64>,
    ) -> Option<f64> {
        (**self).reward(observation, action, next_observation)
    }

    fn is_terminal(&self, observation: ArrayView1<f64>) -> bool {
        (**self).is_terminal(observation)
    }

    fn log_diagnostics(&self, paths: &[Path], prefix: &str) -> Vec<(String, f64)> {
        (**self).log_diagnostics(paths, prefix)
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}
