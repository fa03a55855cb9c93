//! Learned transition models.
//!
//! Provides:
//! - `DynamicsEnsemble` - bootstrapped ensemble of dense regressors
//! - `ReplayBuffer` - bounded FIFO store of real transitions
//! - `plan_minibatches` - how a fit call mixes resident and new data

mod buffer;
mod ensemble;

pub use buffer::{BufferRecord, ReplayBuffer, TransitionArrays};
pub use ensemble::{
    plan_minibatches, DynamicsEnsemble, EarlyStopping, EnsembleRecord, FitReport, MemberRecord, MemberSelector,
    MinibatchPlan, NormalizerRecord, Prediction,
};

use crate::nn::Activation;
use crate::{MbrlError, Result};
use serde::{Deserialize, Serialize};

/// Dynamics ensemble settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicsConfig {
    /// Number of ensemble members
    pub num_models: usize,
    pub hidden_sizes: Vec<usize>,
    pub hidden_activation: Activation,
    pub learning_rate: f64,
    pub batch_size: usize,
    /// Epochs per fit call
    pub max_epochs: usize,
    /// Capacity of the training buffer, in transitions
    pub buffer_size: usize,
    /// Share of each fit call's new data held out for validation
    pub valid_split_ratio: f64,
    /// Share of each epoch's minibatches drawn from resident (older) data
    pub rolling_average_persistency: f64,
    /// Smoothing factor of the validation-loss moving average used for early stopping
    pub valid_loss_persistency: f64,
    pub early_stopping: bool,
    /// Train each member on its own resample of the data
    pub bootstrap: bool,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            num_models: 5,
            hidden_sizes: vec![512, 512, 512],
            hidden_activation: Activation::Relu,
            learning_rate: 1e-3,
            batch_size: 256,
            max_epochs: 200,
            buffer_size: 25_000,
            valid_split_ratio: 0.2,
            rolling_average_persistency: 0.4,
            valid_loss_persistency: 0.95,
            early_stopping: false,
            bootstrap: true,
        }
    }
}

impl DynamicsConfig {
    /// Capacity of the validation buffer
    pub fn valid_buffer_size(&self) -> usize {
        ((self.buffer_size as f64 * self.valid_split_ratio).ceil() as usize).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(MbrlError::ConfigError(format!("dynamics: {}", msg)));
        if self.num_models == 0 {
            return fail("num_models must be > 0");
        }
        if self.batch_size == 0 {
            return fail("batch_size must be > 0");
        }
        if self.buffer_size < self.batch_size {
            return fail("buffer_size must hold at least one minibatch");
        }
        if !(0.0..1.0).contains(&self.valid_split_ratio) {
            return fail("valid_split_ratio must be in [0, 1)");
        }
        if !(0.0..=1.0).contains(&self.rolling_average_persistency) {
            return fail("rolling_average_persistency must be in [0, 1]");
        }
        if !(0.0..=1.0).contains(&self.valid_loss_persistency) {
            return fail("valid_loss_persistency must be in [0, 1]");
        }
        if self.learning_rate <= 0.0 {
            return fail("learning_rate must be > 0");
        }
        Ok(())
    }
}
