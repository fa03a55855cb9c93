//! Recurrent Gaussian policy.

use super::{DistInfo, GaussianHead, Policy, PolicyRecord, PolicyStep, HIDDEN_KEY};
use crate::checkpoint::Checkpointable;
use crate::nn::{device, tensor_values, InferenceBackend, TrainingBackend};
use crate::{MbrlError, Result};
use burn::module::AutodiffModule;
use burn::tensor::{Tensor, TensorData};
use ndarray::{concatenate, Array1, Array2, ArrayView1, ArrayView2, Axis};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

const INPUT_WEIGHT: &str = "input_weight";
const RECURRENT_WEIGHT: &str = "recurrent_weight";

fn matrix(values: Vec<f64>, rows: usize, cols: usize) -> Tensor<InferenceBackend, 2> {
    Tensor::from_data(TensorData::new(values, [rows, cols]), &device())
}

/// Gaussian policy conditioned on the observation and a carried state.
///
/// The state follows `h' = tanh(h W + s U)` with fixed random `W` and `U`; the
/// trainable part is a Gaussian head over `[s, h]`. Because the recurrence has
/// no trainable parameters, the state along a recorded sequence can be
/// recomputed exactly from the state at the start of that sequence.
#[derive(Clone, Debug)]
pub struct RecurrentGaussianPolicy {
    obs_dim: usize,
    action_dim: usize,
    hidden_dim: usize,
    hidden_sizes: Vec<usize>,
    input_weight: Tensor<InferenceBackend, 2>,
    recurrent_weight: Tensor<InferenceBackend, 2>,
    head: GaussianHead<TrainingBackend>,
}

impl RecurrentGaussianPolicy {
    pub fn new(
        obs_dim: usize,
        action_dim: usize,
        hidden_dim: usize,
        hidden_sizes: &[usize],
        init_std: f64,
        seed: u64,
    ) -> Self {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let in_scale = 1.0 / (obs_dim.max(1) as f64).sqrt();
        // keep the spectral radius below one so the state forgets
        let rec_scale = 0.9 / (hidden_dim.max(1) as f64).sqrt();
        let input_weight = (0..obs_dim * hidden_dim)
            .map(|_| rng.gen_range(-in_scale..=in_scale))
            .collect();
        let recurrent_weight = (0..hidden_dim * hidden_dim)
            .map(|_| rng.gen_range(-rec_scale..=rec_scale))
            .collect();
        let head = GaussianHead::new(
            obs_dim + hidden_dim,
            action_dim,
            hidden_sizes,
            init_std,
            &mut rng,
            &device(),
        );
        Self {
            obs_dim,
            action_dim,
            hidden_dim,
            hidden_sizes: hidden_sizes.to_vec(),
            input_weight: matrix(input_weight, obs_dim, hidden_dim),
            recurrent_weight: matrix(recurrent_weight, hidden_dim, hidden_dim),
            head,
        }
    }

    /// Rebuild a policy from a snapshot record
    pub fn from_record(record: &PolicyRecord) -> Result<Self> {
        let recurrent_len = record.buffers.get(RECURRENT_WEIGHT).map_or(0, Vec::len);
        let hidden_dim = (recurrent_len as f64).sqrt().round() as usize;
        let mut policy = Self::new(
            record.obs_dim,
            record.action_dim,
            hidden_dim,
            &record.hidden_sizes,
            1.0,
            0,
        );
        policy.load_record(record)?;
        Ok(policy)
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    /// Advance the carried state by one observation
    pub fn next_hidden(
        &self,
        hidden: ArrayView1<f64>,
        observation: ArrayView1<f64>,
    ) -> Result<Array1<f64>> {
        if hidden.len() != self.hidden_dim || observation.len() != self.obs_dim {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![self.hidden_dim, self.obs_dim],
                actual: vec![hidden.len(), observation.len()],
            });
        }
        let h = matrix(hidden.to_vec(), 1, self.hidden_dim);
        let s = matrix(observation.to_vec(), 1, self.obs_dim);
        let pre = h.matmul(self.recurrent_weight.clone()) + s.matmul(self.input_weight.clone());
        Ok(Array1::from(tensor_values(pre.tanh())))
    }

    fn step(
        &self,
        observation: ArrayView1<f64>,
        hidden: Option<ArrayView1<f64>>,
    ) -> Result<(DistInfo, Array1<f64>, Array1<f64>)> {
        let h = match hidden {
            Some(h) => h.to_owned(),
            None => Array1::zeros(self.hidden_dim),
        };
        let features = self.features(
            observation.insert_axis(Axis(0)),
            Some(h.view().insert_axis(Axis(0))),
        )?;
        let info = self.head.valid().info(features.view())?;
        let next = self.next_hidden(h.view(), observation)?;
        Ok((info, h, next))
    }
}

impl Policy for RecurrentGaussianPolicy {
    fn obs_dim(&self) -> usize {
        self.obs_dim
    }

    fn action_dim(&self) -> usize {
        self.action_dim
    }

    fn is_recurrent(&self) -> bool {
        true
    }

    fn initial_hidden(&self) -> Option<Array1<f64>> {
        Some(Array1::zeros(self.hidden_dim))
    }

    fn unroll_hidden(
        &self,
        h0: ArrayView1<f64>,
        observations: ArrayView2<f64>,
    ) -> Result<Array2<f64>> {
        let mut out = Array2::zeros((observations.nrows(), self.hidden_dim));
        let mut h = h0.to_owned();
        for (t, obs) in observations.outer_iter().enumerate() {
            out.row_mut(t).assign(&h);
            h = self.next_hidden(h.view(), obs)?;
        }
        Ok(out)
    }

    fn features(
        &self,
        observations: ArrayView2<f64>,
        hidden: Option<ArrayView2<f64>>,
    ) -> Result<Array2<f64>> {
        let hidden = hidden.ok_or_else(|| {
            MbrlError::ConfigError("recurrent policy queried without hidden state".to_string())
        })?;
        if hidden.nrows() != observations.nrows() || hidden.ncols() != self.hidden_dim {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![observations.nrows(), self.hidden_dim],
                actual: vec![hidden.nrows(), hidden.ncols()],
            });
        }
        concatenate(Axis(1), &[observations.view(), hidden.view()])
            .map_err(|e| MbrlError::NumericalError(e.to_string()))
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
        hidden: Option<ArrayView1<f64>>,
        rng: &mut dyn RngCore,
    ) -> Result<PolicyStep> {
        let (info, h, next) = self.step(observation, hidden)?;
        let action = self
            .distribution()
            .sample(info.mean.row(0), info.log_std.row(0), rng);
        let mut agent_info = info.row_info(0);
        agent_info.insert(HIDDEN_KEY.to_string(), h);
        Ok(PolicyStep {
            action,
            agent_info,
            next_hidden: Some(next),
        })
    }

    fn deterministic_action(
        &self,
        observation: ArrayView1<f64>,
        hidden: Option<ArrayView1<f64>>,
    ) -> Result<PolicyStep> {
        let (info, h, next) = self.step(observation, hidden)?;
        let mut agent_info = info.row_info(0);
        agent_info.insert(HIDDEN_KEY.to_string(), h);
        Ok(PolicyStep {
            action: info.mean.row(0).to_owned(),
            agent_info,
            next_hidden: Some(next),
        })
    }

    fn kind(&self) -> &'static str {
        "recurrent_gaussian"
    }

    fn boxed_clone(&self) -> Box<dyn Policy> {
        Box::new(self.clone())
    }
}

impl Checkpointable for RecurrentGaussianPolicy {
    type Record = PolicyRecord;

    fn record(&self) -> PolicyRecord {
        let mut record = PolicyRecord {
            kind: self.kind().to_string(),
            obs_dim: self.obs_dim,
            action_dim: self.action_dim,
            hidden_sizes: self.hidden_sizes.clone(),
            params: self.head.flat_params(),
            buffers: Default::default(),
        };
        record.buffers.insert(
            INPUT_WEIGHT.to_string(),
            tensor_values(self.input_weight.clone()),
        );
        record.buffers.insert(
            RECURRENT_WEIGHT.to_string(),
            tensor_values(self.recurrent_weight.clone()),
        );
        record
    }

    fn load_record(&mut self, record: &PolicyRecord) -> Result<()> {
        if record.kind != self.kind()
            || record.obs_dim != self.obs_dim
            || record.action_dim != self.action_dim
        {
            return Err(MbrlError::ConfigError(format!(
                "policy record '{}' does not match {}",
                record.kind,
                self.kind()
            )));
        }
        let load = |name: &str, rows: usize, cols: usize| -> Result<Tensor<InferenceBackend, 2>> {
            let values = record
                .buffers
                .get(name)
                .ok_or_else(|| MbrlError::ConfigError(format!("policy record lacks '{}'", name)))?;
            if values.len() != rows * cols {
                return Err(MbrlError::ShapeMismatch {
                    expected: vec![rows, cols],
                    actual: vec![values.len()],
                });
            }
            Ok(matrix(values.clone(), rows, cols))
        };
        let input_weight = load(INPUT_WEIGHT, self.obs_dim, self.hidden_dim)?;
        let recurrent_weight = load(RECURRENT_WEIGHT, self.hidden_dim, self.hidden_dim)?;
        self.head = self.head.clone().load_flat(&record.params)?;
        self.input_weight = input_weight;
        self.recurrent_weight = recurrent_weight;
        Ok(())
    }
}
