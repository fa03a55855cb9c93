//! Stochastic policies.
//!
//! Provides:
//! - `Policy` - the trait samplers and optimizers drive
//! - `GaussianMlpPolicy` - feed-forward Gaussian policy
//! - `RecurrentGaussianPolicy` - Gaussian policy over observations and a carried state
//! - `DiagonalGaussian` - the action distribution both policies emit
//! - `GaussianHead` - the trainable burn module behind both policies

mod distribution;
mod head;
mod mlp;
mod recurrent;

pub use distribution::{DiagonalGaussian, DistInfo, HIDDEN_KEY, LOG_STD_KEY, MEAN_KEY};
pub use head::GaussianHead;
pub use mlp::GaussianMlpPolicy;
pub use recurrent::RecurrentGaussianPolicy;

use crate::nn::TrainingBackend;
use crate::Result;
use burn::module::AutodiffModule;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Output of a single policy query
#[derive(Clone, Debug)]
pub struct PolicyStep {
    pub action: Array1<f64>,
    /// Distribution parameters (and hidden state) recorded with the action
    pub agent_info: BTreeMap<String, Array1<f64>>,
    /// State to feed into the next step, for recurrent policies
    pub next_hidden: Option<Array1<f64>>,
}

/// Serializable policy parameters
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyRecord {
    pub kind: String,
    pub obs_dim: usize,
    pub action_dim: usize,
    pub hidden_sizes: Vec<usize>,
    /// Trainable parameters in flat order
    pub params: Vec<f64>,
    /// Fixed, non-trainable tensors keyed by name
    #[serde(default)]
    pub buffers: BTreeMap<String, Vec<f64>>,
}

/// Trait for stochastic Gaussian policies.
///
/// The trainable part of every policy is a `GaussianHead` over feature rows;
/// `features` turns observations (and carried states) into those rows.
/// Optimizers take the head out, step it, and put it back with `set_head`.
/// Trainable parameters can also be exchanged as one flat vector.
pub trait Policy: Send {
    fn obs_dim(&self) -> usize;

    fn action_dim(&self) -> usize;

    /// Action distribution family
    fn distribution(&self) -> DiagonalGaussian {
        DiagonalGaussian::new(self.action_dim())
    }

    fn is_recurrent(&self) -> bool {
        false
    }

    /// State at the beginning of a rollout
    fn initial_hidden(&self) -> Option<Array1<f64>> {
        None
    }

    /// Hidden states for each row of a contiguous observation sequence, starting at `h0`.
    ///
    /// Row `t` of the result is the state used alongside observation `t`.
    fn unroll_hidden(
        &self,
        _h0: ArrayView1<f64>,
        observations: ArrayView2<f64>,
    ) -> Result<Array2<f64>> {
        Ok(Array2::zeros((observations.nrows(), 0)))
    }

    /// Input rows of the Gaussian head
    fn features(
        &self,
        observations: ArrayView2<f64>,
        hidden: Option<ArrayView2<f64>>,
    ) -> Result<Array2<f64>>;

    fn head(&self) -> &GaussianHead<TrainingBackend>;

    fn set_head(&mut self, head: GaussianHead<TrainingBackend>);

    /// Distribution parameters for a batch of observations
    fn distribution_info(
        &self,
        observations: ArrayView2<f64>,
        hidden: Option<ArrayView2<f64>>,
    ) -> Result<DistInfo> {
        let features = self.features(observations, hidden)?;
        self.head().valid().info(features.view())
    }

    /// Sample an action and record the distribution it came from
    fn get_action(
        &self,
        observation: ArrayView1<f64>,
        hidden: Option<ArrayView1<f64>>,
        rng: &mut dyn RngCore,
    ) -> Result<PolicyStep>;

    /// Mean action without sampling noise
    fn deterministic_action(
        &self,
        observation: ArrayView1<f64>,
        hidden: Option<ArrayView1<f64>>,
    ) -> Result<PolicyStep>;

    fn num_params(&self) -> usize {
        self.head().num_params()
    }

    fn param_values(&self) -> Array1<f64> {
        Array1::from(self.head().flat_params())
    }

    fn set_param_values(&mut self, params: ArrayView1<f64>) -> Result<()> {
        let head = self.head().clone().load_flat(&params.to_vec())?;
        self.set_head(head);
        Ok(())
    }

    /// Policy statistics for the iteration log
    fn log_diagnostics(&self) -> Vec<(String, f64)> {
        vec![("AveragePolicyStd".to_string(), self.head().average_std())]
    }

    fn kind(&self) -> &'static str;

    /// Independent copy, used to give each sampling worker its own policy
    fn boxed_clone(&self) -> Box<dyn Policy>;
}
