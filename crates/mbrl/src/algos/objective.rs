//! Importance-sampled surrogate objectives.

use crate::nn::{device, from_array2, from_slice, TrainingBackend};
use crate::policy::{DiagonalGaussian, DistInfo, GaussianHead, Policy, HIDDEN_KEY};
use crate::samplers::ProcessedBatch;
use crate::{MbrlError, Result};
use burn::module::AutodiffModule;
use burn::backend::ndarray::NdArrayDevice;
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Tensor};
use ndarray::{Array1, Array2, ArrayView1, Axis};
use std::ops::Range;

/// Gradients of one backward pass through the surrogate
pub type SurrogateGrads = <TrainingBackend as AutodiffBackend>::Gradients;

/// Relative step of the finite-difference Fisher-vector product
const FVP_STEP: f64 = 1e-5;

/// Shape of the per-sample surrogate term
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SurrogateKind {
    /// `min(r·A, clip(r, 1-ε, 1+ε)·A)`
    Clipped { clip_eps: f64 },
    /// `r·A`
    LikelihoodRatio,
}

/// Clipped surrogate term and its derivative with respect to the ratio.
///
/// The derivative is zero wherever the clipped branch is active, so the
/// objective gains nothing from pushing the ratio outside `[1-ε, 1+ε]`.
pub fn clipped_surrogate(ratio: f64, advantage: f64, clip_eps: f64) -> (f64, f64) {
    let clipped = ratio.clamp(1.0 - clip_eps, 1.0 + clip_eps);
    let unclipped_term = ratio * advantage;
    let clipped_term = clipped * advantage;
    if unclipped_term <= clipped_term {
        (unclipped_term, advantage)
    } else {
        (clipped_term, 0.0)
    }
}

/// Loss over a fixed batch, evaluated against the current policy parameters.
///
/// The distribution recorded at sampling time is captured once when the
/// objective is built, together with the head's input rows (for recurrent
/// policies these include the recomputed state). Optimization units are rows
/// for feed-forward policies and chunks for recurrent ones; a minibatch is a
/// set of whole units.
pub struct SurrogateObjective {
    kind: SurrogateKind,
    entropy_bonus: f64,
    distribution: DiagonalGaussian,
    features: Array2<f64>,
    actions: Array2<f64>,
    advantages: Array1<f64>,
    old: DistInfo,
    /// Log density of each action under the sampling distribution
    old_log_likelihood: Array1<f64>,
    units: Vec<Range<usize>>,
}

struct Slice {
    features: Array2<f64>,
    actions: Array2<f64>,
    advantages: Array1<f64>,
    old: DistInfo,
    old_log_likelihood: Array1<f64>,
}

impl SurrogateObjective {
    pub fn build(
        policy: &dyn Policy,
        batch: &ProcessedBatch,
        kind: SurrogateKind,
        entropy_bonus: f64,
    ) -> Result<Self> {
        if batch.is_empty() {
            return Err(MbrlError::ConfigError("cannot optimize on an empty batch".to_string()));
        }
        let old = DistInfo::from_agent_infos(&batch.agent_infos)?;
        if old.len() != batch.len() || old.mean.ncols() != policy.action_dim() {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![batch.len(), policy.action_dim()],
                actual: vec![old.len(), old.mean.ncols()],
            });
        }

        let (units, hidden) = if policy.is_recurrent() {
            let chunks = batch.chunks.clone().ok_or_else(|| {
                MbrlError::ConfigError(
                    "recurrent policy needs a chunked batch (set backprop_steps)".to_string(),
                )
            })?;
            let recorded = batch
                .agent_infos
                .get(HIDDEN_KEY)
                .ok_or_else(|| MbrlError::MissingDistInfo(HIDDEN_KEY.to_string()))?;
            // recompute the carried state along each chunk from its first recorded state
            let mut hidden = Array2::zeros((batch.len(), recorded.ncols()));
            for chunk in &chunks {
                let h0 = recorded.row(chunk.start);
                let obs = batch.observations.slice(ndarray::s![chunk.clone(), ..]);
                let unrolled = policy.unroll_hidden(h0, obs)?;
                hidden
                    .slice_mut(ndarray::s![chunk.clone(), ..])
                    .assign(&unrolled);
            }
            (chunks, Some(hidden))
        } else {
            ((0..batch.len()).map(|i| i..i + 1).collect(), None)
        };
        let features = policy.features(batch.observations.view(), hidden.as_ref().map(|h| h.view()))?;
        let distribution = policy.distribution();
        let old_log_likelihood = distribution.log_likelihood(batch.actions.view(), &old)?;

        Ok(Self {
            kind,
            entropy_bonus,
            distribution,
            features,
            actions: batch.actions.clone(),
            advantages: batch.advantages.clone(),
            old,
            old_log_likelihood,
            units,
        })
    }

    pub fn kind(&self) -> SurrogateKind {
        self.kind
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    pub fn num_rows(&self) -> usize {
        self.advantages.len()
    }

    /// Rows covered by the given units, in order
    pub fn rows_for(&self, units: &[usize]) -> Vec<usize> {
        units
            .iter()
            .flat_map(|&u| self.units[u].clone())
            .collect()
    }

    pub fn all_rows(&self) -> Vec<usize> {
        (0..self.num_rows()).collect()
    }

    fn slice(&self, rows: &[usize]) -> Slice {
        Slice {
            features: self.features.select(Axis(0), rows),
            actions: self.actions.select(Axis(0), rows),
            advantages: self.advantages.select(Axis(0), rows),
            old: self.old.select(rows),
            old_log_likelihood: self.old_log_likelihood.select(Axis(0), rows),
        }
    }

    /// Surrogate loss tensor of `head` on a slice
    fn loss_tensor<B>(&self, head: &GaussianHead<B>, slice: &Slice) -> Tensor<B, 1>
    where
        B: Backend<Device = NdArrayDevice>,
    {
        let device = device();
        let (mean, log_std) = head.forward(from_array2(slice.features.view(), &device));
        let actions = from_array2(slice.actions.view(), &device);
        let advantages = from_slice(&slice.advantages.to_vec(), &device);
        let old_ll = from_slice(&slice.old_log_likelihood.to_vec(), &device);

        let log_likelihood = self
            .distribution
            .log_likelihood_tensor(actions, mean, log_std.clone());
        let ratio = (log_likelihood - old_ll).exp();
        let terms = match self.kind {
            SurrogateKind::Clipped { clip_eps } => {
                let unclipped = ratio.clone() * advantages.clone();
                let clipped = ratio.clamp(1.0 - clip_eps, 1.0 + clip_eps) * advantages;
                unclipped.min_pair(clipped)
            }
            SurrogateKind::LikelihoodRatio => ratio * advantages,
        };
        let loss = terms.mean().neg();
        if self.entropy_bonus != 0.0 {
            let entropy = self.distribution.entropy_tensor(log_std).mean();
            loss - entropy.mul_scalar(self.entropy_bonus)
        } else {
            loss
        }
    }

    fn checked(loss: f64) -> Result<f64> {
        if loss.is_finite() {
            Ok(loss)
        } else {
            Err(MbrlError::NumericalError(format!("surrogate loss is {}", loss)))
        }
    }

    /// Loss of `head` over the given rows, without tracking gradients
    pub fn head_loss<B>(&self, head: &GaussianHead<B>, rows: &[usize]) -> Result<f64>
    where
        B: Backend<Device = NdArrayDevice>,
    {
        let slice = self.slice(rows);
        let loss: f64 = self.loss_tensor(head, &slice).into_scalar().elem();
        Self::checked(loss)
    }

    pub fn loss(&self, policy: &dyn Policy, rows: &[usize]) -> Result<f64> {
        self.head_loss(&policy.head().valid(), rows)
    }

    /// Loss over the given rows and the gradients of one backward pass
    pub fn backward(
        &self,
        head: &GaussianHead<TrainingBackend>,
        rows: &[usize],
    ) -> Result<(f64, SurrogateGrads)> {
        let slice = self.slice(rows);
        let loss = self.loss_tensor(head, &slice);
        let value = Self::checked(loss.clone().into_scalar().elem())?;
        Ok((value, loss.backward()))
    }

    /// Loss and its gradient with respect to the flat policy parameters.
    pub fn loss_and_grad(&self, policy: &dyn Policy, rows: &[usize]) -> Result<(f64, Array1<f64>)> {
        let (loss, grads) = self.backward(policy.head(), rows)?;
        Ok((loss, Array1::from(policy.head().flat_grads(&grads))))
    }

    /// Mean `KL(old || current)` over the given rows
    pub fn mean_kl(&self, policy: &dyn Policy, rows: &[usize]) -> Result<f64> {
        let slice = self.slice(rows);
        let new = policy.head().valid().info(slice.features.view())?;
        let kl = self.distribution.kl(&slice.old, &new);
        Ok(kl.mean().unwrap_or(0.0))
    }

    /// Gradient of the mean `KL(anchor || head)` over a slice
    fn kl_grad(
        &self,
        head: &GaussianHead<TrainingBackend>,
        slice: &Slice,
        anchor: &DistInfo,
    ) -> Array1<f64> {
        let device = device();
        let (mean, log_std) = head.forward(from_array2(slice.features.view(), &device));
        let kl = self
            .distribution
            .kl_tensor(
                from_array2(anchor.mean.view(), &device),
                from_array2(anchor.log_std.view(), &device),
                mean,
                log_std,
            )
            .mean();
        Array1::from(head.flat_grads(&kl.backward()))
    }

    /// Fisher-vector product `F v + reg·v` at the current parameters.
    ///
    /// `F` is the Hessian of the mean KL between the current distribution and
    /// a perturbed one, taken as a central difference of KL gradients along
    /// `v`.
    pub fn fisher_vector_product(
        &self,
        policy: &dyn Policy,
        rows: &[usize],
        v: ArrayView1<f64>,
        reg_coeff: f64,
    ) -> Result<Array1<f64>> {
        let norm = v.dot(&v).sqrt();
        if norm == 0.0 {
            return Ok(Array1::zeros(v.len()));
        }
        let slice = self.slice(rows);
        let anchor = policy.head().valid().info(slice.features.view())?;
        let base = policy.param_values();
        let r = FVP_STEP / norm;
        let grad_at = |shift: f64| -> Result<Array1<f64>> {
            let shifted = &base + &v.mapv(|x| x * shift);
            let head = policy.head().clone().load_flat(&shifted.to_vec())?;
            Ok(self.kl_grad(&head, &slice, &anchor))
        };
        let hv = (grad_at(r)? - grad_at(-r)?) / (2.0 * r);
        Ok(hv + &v.mapv(|x| reg_coeff * x))
    }
}

/// Batch with actions sampled from `policy` and advantages favouring larger
/// first action components.
#[cfg(test)]
pub(crate) fn synthetic_batch(policy: &dyn Policy, rows: usize, seed: u64) -> ProcessedBatch {
    use crate::policy::{LOG_STD_KEY, MEAN_KEY};
    use rand::SeedableRng;
    use std::collections::BTreeMap;

    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
    let obs_dim = policy.obs_dim();
    let act_dim = policy.action_dim();
    let observations =
        Array2::from_shape_fn((rows, obs_dim), |(i, j)| ((i * 7 + j * 3) as f64 * 0.13).sin());
    let mut actions = Array2::zeros((rows, act_dim));
    let mut means = Array2::zeros((rows, act_dim));
    let mut log_stds = Array2::zeros((rows, act_dim));
    for i in 0..rows {
        let step = policy
            .get_action(observations.row(i), None, &mut rng)
            .unwrap();
        actions.row_mut(i).assign(&step.action);
        means.row_mut(i).assign(&step.agent_info[MEAN_KEY]);
        log_stds.row_mut(i).assign(&step.agent_info[LOG_STD_KEY]);
    }
    let raw = actions.column(0).to_owned();
    let (mean, std) = crate::utils::mean_std(raw.view());
    let advantages = raw.mapv(|a| (a - mean) / (std + 1e-8));

    let mut agent_infos = BTreeMap::new();
    agent_infos.insert(MEAN_KEY.to_string(), means);
    agent_infos.insert(LOG_STD_KEY.to_string(), log_stds);
    ProcessedBatch {
        next_observations: observations.clone(),
        observations,
        actions,
        rewards: Array1::zeros(rows),
        dones: Array1::from_elem(rows, false),
        returns: Array1::zeros(rows),
        advantages,
        baselines: Array1::zeros(rows),
        agent_infos,
        path_lengths: vec![rows],
        chunks: None,
        stats: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{GaussianMlpPolicy, RecurrentGaussianPolicy, LOG_STD_KEY};

    #[test]
    fn test_clipped_surrogate_respects_clip_range() {
        let eps = 0.2;
        for ratio in [0.5, 1.0, 1.5, 10.0] {
            for adv in [1.0, -1.0, 2.5] {
                let (value, slope) = clipped_surrogate(ratio, adv, eps);
                let clipped = ratio.clamp(1.0 - eps, 1.0 + eps);
                assert!(value <= clipped * adv + 1e-12, "ratio {} adv {}", ratio, adv);
                assert!(value <= ratio * adv + 1e-12);
                if (adv > 0.0 && ratio > 1.0 + eps) || (adv < 0.0 && ratio < 1.0 - eps) {
                    assert_eq!(value, clipped * adv);
                    assert_eq!(slope, 0.0);
                }
            }
        }
        assert_eq!(clipped_surrogate(10.0, 1.0, eps), (1.2, 0.0));
        assert_eq!(clipped_surrogate(1.0, -3.0, eps), (-3.0, -3.0));
    }

    #[test]
    fn test_initial_ratio_is_one() {
        let policy = GaussianMlpPolicy::new(3, 2, &[8], 0.7, 0);
        let batch = synthetic_batch(&policy, 32, 1);
        let obj = SurrogateObjective::build(
            &policy,
            &batch,
            SurrogateKind::LikelihoodRatio,
            0.0,
        )
        .unwrap();
        let loss = obj.loss(&policy, &obj.all_rows()).unwrap();
        let expected = -batch.advantages.mean().unwrap();
        assert!((loss - expected).abs() < 1e-10);
        assert!(obj.mean_kl(&policy, &obj.all_rows()).unwrap().abs() < 1e-12);
    }

    #[test]
    fn test_gradient_matches_finite_differences() {
        let mut policy = GaussianMlpPolicy::new(2, 1, &[6], 0.8, 3);
        let batch = synthetic_batch(&policy, 16, 2);
        let obj = SurrogateObjective::build(
            &policy,
            &batch,
            SurrogateKind::Clipped { clip_eps: 0.2 },
            0.01,
        )
        .unwrap();
        // move away from the old parameters so some ratios differ from one
        let base = policy.param_values().mapv(|p| p * 1.05);
        policy.set_param_values(base.view()).unwrap();
        let rows = obj.all_rows();
        let (_, grad) = obj.loss_and_grad(&policy, &rows).unwrap();

        let eps = 1e-6;
        for k in [0, 3, base.len() - 1] {
            let mut plus = base.clone();
            plus[k] += eps;
            policy.set_param_values(plus.view()).unwrap();
            let f_plus = obj.loss(&policy, &rows).unwrap();
            let mut minus = base.clone();
            minus[k] -= eps;
            policy.set_param_values(minus.view()).unwrap();
            let f_minus = obj.loss(&policy, &rows).unwrap();
            let fd = (f_plus - f_minus) / (2.0 * eps);
            assert!((fd - grad[k]).abs() < 1e-5, "param {}: {} vs {}", k, fd, grad[k]);
        }
    }

    #[test]
    fn test_fisher_product_along_log_std() {
        let policy = GaussianMlpPolicy::new(3, 2, &[8], 0.6, 4);
        let batch = synthetic_batch(&policy, 16, 3);
        let obj = SurrogateObjective::build(&policy, &batch, SurrogateKind::LikelihoodRatio, 0.0)
            .unwrap();
        let n = policy.num_params();
        let mut v = Array1::zeros(n);
        v[n - 1] = 1.0;
        // the KL Hessian in each log standard deviation is 2, and 0 across parameters
        let hv = obj
            .fisher_vector_product(&policy, &obj.all_rows(), v.view(), 1e-3)
            .unwrap();
        assert!((hv[n - 1] - 2.001).abs() < 1e-5, "{}", hv[n - 1]);
        for k in 0..n - 1 {
            assert!(hv[k].abs() < 1e-5, "param {}: {}", k, hv[k]);
        }
        let zero = obj
            .fisher_vector_product(&policy, &obj.all_rows(), Array1::zeros(n).view(), 1e-3)
            .unwrap();
        assert!(zero.iter().all(|x| *x == 0.0));
    }

    #[test]
    fn test_missing_dist_info_fails_fast() {
        let policy = GaussianMlpPolicy::new(3, 2, &[8], 1.0, 0);
        let mut batch = synthetic_batch(&policy, 8, 0);
        batch.agent_infos.remove(LOG_STD_KEY);
        let result = SurrogateObjective::build(&policy, &batch, SurrogateKind::LikelihoodRatio, 0.0);
        assert!(matches!(result, Err(MbrlError::MissingDistInfo(k)) if k == LOG_STD_KEY));
    }

    #[test]
    fn test_recurrent_policy_requires_chunks() {
        let feed_forward = GaussianMlpPolicy::new(3, 2, &[8], 1.0, 0);
        let batch = synthetic_batch(&feed_forward, 8, 0);
        let recurrent = RecurrentGaussianPolicy::new(3, 2, 4, &[8], 1.0, 0);
        let result =
            SurrogateObjective::build(&recurrent, &batch, SurrogateKind::LikelihoodRatio, 0.0);
        assert!(matches!(result, Err(MbrlError::ConfigError(_))));

        let mut chunked = batch;
        chunked.chunks = Some(vec![0..4, 4..8]);
        let result =
            SurrogateObjective::build(&recurrent, &chunked, SurrogateKind::LikelihoodRatio, 0.0);
        assert!(matches!(result, Err(MbrlError::MissingDistInfo(k)) if k == HIDDEN_KEY));
    }
}
