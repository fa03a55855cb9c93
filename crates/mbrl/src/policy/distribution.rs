//! Diagonal Gaussian action distribution.

use crate::{MbrlError, Result};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, Zip};
use rand::{Rng, RngCore};
use rand_distr::StandardNormal;
use std::collections::BTreeMap;

/// Agent-info key holding the distribution mean
pub const MEAN_KEY: &str = "mean";
/// Agent-info key holding the distribution log standard deviation
pub const LOG_STD_KEY: &str = "log_std";
/// Agent-info key holding the recurrent state used for an action
pub const HIDDEN_KEY: &str = "hidden";

const LOG_2PI: f64 = 1.837_877_066_409_345_3;

/// Per-row parameters of a diagonal Gaussian
#[derive(Clone, Debug, PartialEq)]
pub struct DistInfo {
    pub mean: Array2<f64>,
    pub log_std: Array2<f64>,
}

impl DistInfo {
    pub fn new(mean: Array2<f64>, log_std: Array2<f64>) -> Result<Self> {
        if mean.dim() != log_std.dim() {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![mean.nrows(), mean.ncols()],
                actual: vec![log_std.nrows(), log_std.ncols()],
            });
        }
        Ok(Self { mean, log_std })
    }

    /// Extract the sampling-time distribution from stacked agent infos.
    pub fn from_agent_infos(infos: &BTreeMap<String, Array2<f64>>) -> Result<Self> {
        let mean = infos
            .get(MEAN_KEY)
            .ok_or_else(|| MbrlError::MissingDistInfo(MEAN_KEY.to_string()))?;
        let log_std = infos
            .get(LOG_STD_KEY)
            .ok_or_else(|| MbrlError::MissingDistInfo(LOG_STD_KEY.to_string()))?;
        Self::new(mean.clone(), log_std.clone())
    }

    pub fn len(&self) -> usize {
        self.mean.nrows()
    }

    pub fn is_empty(&self) -> bool {
        self.mean.nrows() == 0
    }

    /// Copy of the selected rows
    pub fn select(&self, rows: &[usize]) -> Self {
        Self {
            mean: self.mean.select(Axis(0), rows),
            log_std: self.log_std.select(Axis(0), rows),
        }
    }

    /// Row `i` as agent-info entries
    pub fn row_info(&self, i: usize) -> BTreeMap<String, Array1<f64>> {
        let mut info = BTreeMap::new();
        info.insert(MEAN_KEY.to_string(), self.mean.row(i).to_owned());
        info.insert(LOG_STD_KEY.to_string(), self.log_std.row(i).to_owned());
        info
    }
}

/// Diagonal Gaussian over `dim`-dimensional actions
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiagonalGaussian {
    dim: usize,
}

impl DiagonalGaussian {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn check(&self, x: &ArrayView2<f64>, info: &DistInfo) -> Result<()> {
        if x.dim() != info.mean.dim() || info.mean.ncols() != self.dim {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![info.mean.nrows(), self.dim],
                actual: vec![x.nrows(), x.ncols()],
            });
        }
        Ok(())
    }

    /// Draw one action from row parameters
    pub fn sample(
        &self,
        mean: ArrayView1<f64>,
        log_std: ArrayView1<f64>,
        rng: &mut dyn RngCore,
    ) -> Array1<f64> {
        let mut action = Array1::zeros(mean.len());
        Zip::from(&mut action)
            .and(&mean)
            .and(&log_std)
            .for_each(|a, &m, &ls| {
                let z: f64 = rng.sample(StandardNormal);
                *a = m + ls.exp() * z;
            });
        action
    }

    /// Per-row log density of `x`
    pub fn log_likelihood(&self, x: ArrayView2<f64>, info: &DistInfo) -> Result<Array1<f64>> {
        self.check(&x, info)?;
        let z = (&x - &info.mean) / info.log_std.mapv(f64::exp);
        let per_dim = z.mapv(|v| -0.5 * v * v) - &info.log_std - 0.5 * LOG_2PI;
        Ok(per_dim.sum_axis(Axis(1)))
    }

    /// Per-row `KL(old || new)`
    pub fn kl(&self, old: &DistInfo, new: &DistInfo) -> Array1<f64> {
        let old_var = old.log_std.mapv(|ls| (2.0 * ls).exp());
        let new_var = new.log_std.mapv(|ls| (2.0 * ls).exp());
        let diff = &old.mean - &new.mean;
        let numerator = diff.mapv(|d| d * d) + &old_var;
        let per_dim = numerator / (2.0 * &new_var) + &new.log_std - &old.log_std - 0.5;
        per_dim.sum_axis(Axis(1))
    }

    /// Per-row log density of `x` on tensors, differentiable in `mean` and `log_std`
    pub fn log_likelihood_tensor<B: Backend>(
        &self,
        x: Tensor<B, 2>,
        mean: Tensor<B, 2>,
        log_std: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let [rows, _] = x.dims();
        let z = (x - mean) / log_std.clone().exp();
        let per_dim = z.powf_scalar(2.0).mul_scalar(-0.5) - log_std;
        per_dim
            .sum_dim(1)
            .reshape([rows])
            .sub_scalar(0.5 * self.dim as f64 * LOG_2PI)
    }

    /// Per-row entropy on tensors
    pub fn entropy_tensor<B: Backend>(&self, log_std: Tensor<B, 2>) -> Tensor<B, 1> {
        let [rows, _] = log_std.dims();
        log_std
            .sum_dim(1)
            .reshape([rows])
            .add_scalar(0.5 * self.dim as f64 * (LOG_2PI + 1.0))
    }

    /// Per-row `KL(old || new)` on tensors
    pub fn kl_tensor<B: Backend>(
        &self,
        old_mean: Tensor<B, 2>,
        old_log_std: Tensor<B, 2>,
        new_mean: Tensor<B, 2>,
        new_log_std: Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let [rows, _] = old_mean.dims();
        let old_var = old_log_std.clone().mul_scalar(2.0).exp();
        let new_var = new_log_std.clone().mul_scalar(2.0).exp();
        let numerator = (old_mean - new_mean).powf_scalar(2.0) + old_var;
        let per_dim = numerator / new_var.mul_scalar(2.0) + new_log_std - old_log_std;
        per_dim.sum_dim(1).reshape([rows]).sub_scalar(0.5 * self.dim as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{device, from_array2, tensor_values, InferenceBackend};
    use ndarray::array;

    fn info(mean: Array2<f64>, log_std: Array2<f64>) -> DistInfo {
        DistInfo::new(mean, log_std).unwrap()
    }

    #[test]
    fn test_log_likelihood_standard_normal() {
        let d = DiagonalGaussian::new(1);
        let p = info(array![[0.0]], array![[0.0]]);
        let ll = d.log_likelihood(array![[0.0]].view(), &p).unwrap();
        assert!((ll[0] + 0.5 * LOG_2PI).abs() < 1e-12);
        assert!(d.log_likelihood(array![[0.0, 1.0]].view(), &p).is_err());
    }

    #[test]
    fn test_kl_zero_for_same_and_positive_otherwise() {
        let d = DiagonalGaussian::new(2);
        let a = info(array![[0.0, 1.0]], array![[0.0, -1.0]]);
        let b = info(array![[0.5, 1.0]], array![[0.3, -1.0]]);
        assert!(d.kl(&a, &a)[0].abs() < 1e-12);
        assert!(d.kl(&a, &b)[0] > 0.0);
    }

    #[test]
    fn test_tensor_forms_match_closed_form() {
        let d = DiagonalGaussian::new(2);
        let old = info(array![[0.2, -0.1], [0.0, 0.4]], array![[-0.3, 0.1], [0.2, 0.0]]);
        let new = info(array![[0.5, 0.3], [-0.2, 0.1]], array![[0.1, -0.2], [0.0, 0.3]]);
        let x = array![[0.4, 0.0], [1.0, -1.0]];
        let t = |a: &Array2<f64>| from_array2::<InferenceBackend>(a.view(), &device());

        let ll = tensor_values(d.log_likelihood_tensor(t(&x), t(&new.mean), t(&new.log_std)));
        let kl = tensor_values(d.kl_tensor(
            t(&old.mean),
            t(&old.log_std),
            t(&new.mean),
            t(&new.log_std),
        ));
        let entropy = tensor_values(d.entropy_tensor(t(&new.log_std)));
        for i in 0..2 {
            let mut expected_ll = 0.0;
            let mut expected_entropy = 0.0;
            for j in 0..2 {
                let ls = new.log_std[[i, j]];
                let z = (x[[i, j]] - new.mean[[i, j]]) / ls.exp();
                expected_ll += -0.5 * z * z - ls - 0.5 * LOG_2PI;
                expected_entropy += ls + 0.5 * (LOG_2PI + 1.0);
            }
            assert!((ll[i] - expected_ll).abs() < 1e-12);
            assert!((ll[i] - d.log_likelihood(x.view(), &new).unwrap()[i]).abs() < 1e-12);
            assert!((kl[i] - d.kl(&old, &new)[i]).abs() < 1e-12);
            assert!((entropy[i] - expected_entropy).abs() < 1e-12);
        }
    }

    #[test]
    fn test_missing_dist_info() {
        let mut infos = BTreeMap::new();
        infos.insert(MEAN_KEY.to_string(), Array2::zeros((2, 1)));
        let err = DistInfo::from_agent_infos(&infos).unwrap_err();
        assert!(matches!(err, MbrlError::MissingDistInfo(k) if k == LOG_STD_KEY));
    }
}
