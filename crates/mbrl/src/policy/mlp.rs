//! Feed-forward Gaussian policy.

use super::{DistInfo, GaussianHead, Policy, PolicyRecord, PolicyStep};
use crate::checkpoint::Checkpointable;
use crate::nn::{device, TrainingBackend};
use crate::{MbrlError, Result};
use burn::module::AutodiffModule;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis};
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Gaussian policy with an MLP mean.
///
/// # Example
///
/// ```ignore
/// let policy = GaussianMlpPolicy::new(3, 1, &[32, 32], 1.0, 0);
/// let step = policy.get_action(obs.view(), None, &mut rng)?;
/// ```
#[derive(Clone, Debug)]
pub struct GaussianMlpPolicy {
    obs_dim: usize,
    action_dim: usize,
    hidden_sizes: Vec<usize>,
    head: GaussianHead<TrainingBackend>,
}

impl GaussianMlpPolicy {
    pub fn new(
        obs_dim: usize,
        action_dim: usize,
        hidden_sizes: &[usize],
        init_std: f64,
        seed: u64,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Self {
            obs_dim,
            action_dim,
            hidden_sizes: hidden_sizes.to_vec(),
            head: GaussianHead::new(
                obs_dim,
                action_dim,
                hidden_sizes,
                init_std,
                &mut rng,
                &device(),
            ),
        }
    }

    /// Rebuild a policy from a snapshot record
    pub fn from_record(record: &PolicyRecord) -> Result<Self> {
        let mut policy = Self::new(
            record.obs_dim,
            record.action_dim,
            &record.hidden_sizes,
            1.0,
            0,
        );
        policy.load_record(record)?;
        Ok(policy)
    }

    pub fn hidden_sizes(&self) -> &[usize] {
        &self.hidden_sizes
    }

    fn single(&self, observation: ArrayView1<f64>) -> Result<DistInfo> {
        self.head.valid().info(observation.insert_axis(Axis(0)))
    }
}

impl Policy for GaussianMlpPolicy {
    fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    fn action_dim(&self) -> usize {
        self.action_dim
    }

    fn features(
        &self,
        observations: ArrayView2<f64>,
        _hidden: Option<ArrayView2<f64>>,
    ) -> Result<Array2<f64>> {
        Ok(observations.to_owned())
    }

    fn head(&self) -> &GaussianHead<TrainingBackend> {
        &self.head
    }

    fn set_head(&mut self, head: GaussianHead<TrainingBackend>) {
        self.head = head;
    }

    fn get_action(
        &self,
        observation: ArrayView1<f64>,
        _hidden: Option<ArrayView1<f64>>,
        rng: &mut dyn RngCore,
    ) -> Result<PolicyStep> {
        let info = self.single(observation)?;
        let action = self
            .distribution()
            .sample(info.mean.row(0), info.log_std.row(0), rng);
        Ok(PolicyStep {
            action,
            agent_info: info.row_info(0),
            next_hidden: None,
        })
    }

    fn deterministic_action(
        &self,
        observation: ArrayView1<f64>,
        _hidden: Option<ArrayView1<f64>>,
    ) -> Result<PolicyStep> {
        let info = self.single(observation)?;
        Ok(PolicyStep {
            action: info.mean.row(0).to_owned(),
            agent_info: info.row_info(0),
            next_hidden: None,
        })
    }

    fn kind(&self) -> &'static str {
        "gaussian_mlp"
    }

    fn boxed_clone(&self) -> Box<dyn Policy> {
        Box::new(self.clone())
    }
}

impl Checkpointable for GaussianMlpPolicy {
    type Record = PolicyRecord;

    fn record(&self) -> PolicyRecord {
        PolicyRecord {
            kind: self.kind().to_string(),
            obs_dim: self.obs_dim,
            action_dim: self.action_dim,
            hidden_sizes: self.hidden_sizes.clone(),
            params: self.head.flat_params(),
            buffers: Default::default(),
        }
    }

    fn load_record(&mut self, record: &PolicyRecord) -> Result<()> {
        if record.kind != self.kind()
            || record.obs_dim != self.obs_dim
            || record.action_dim != self.action_dim
        {
            return Err(MbrlError::ConfigError(format!(
                "policy record '{}' ({} -> {}) does not match {} ({} -> {})",
                record.kind,
                record.obs_dim,
                record.action_dim,
                self.kind(),
                self.obs_dim,
                self.action_dim
            )));
        }
        self.head = self.head.clone().load_flat(&record.params)?;
        Ok(())
    }
}
