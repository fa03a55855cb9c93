//! Trainable Gaussian head shared by the policies.

use super::DistInfo;
use crate::nn::{from_array2, tensor_values, to_array2, Activation, Mlp, MlpConfig};
use crate::{MbrlError, Result};
use burn::module::{Module, Param};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{Tensor, TensorData};
use ndarray::ArrayView2;
use rand::Rng;

/// Mean network plus a state-independent learnable log standard deviation.
///
/// Flat parameter layout: network parameters, then `log_std`.
#[derive(Module, Debug)]
pub struct GaussianHead<B: Backend> {
    mean: Mlp<B>,
    log_std: Param<Tensor<B, 1>>,
}

impl<B: Backend> GaussianHead<B> {
    pub fn new<R: Rng + ?Sized>(
        input_dim: usize,
        action_dim: usize,
        hidden_sizes: &[usize],
        init_std: f64,
        rng: &mut R,
        device: &B::Device,
    ) -> Self {
        // start close to a zero-mean policy
        let mean = MlpConfig::new(input_dim, hidden_sizes, action_dim)
            .with_output_gain(0.1)
            .init(rng, device);
        let log_std = vec![init_std.max(1e-6).ln(); action_dim];
        Self {
            mean,
            log_std: Param::from_tensor(Tensor::from_data(
                TensorData::new(log_std, [action_dim]),
                device,
            )),
        }
    }

    pub fn input_dim(&self) -> usize {
        self.mean.input_dim()
    }

    /// Row-wise `(mean, log_std)`; hidden layers use tanh.
    pub fn forward(&self, features: Tensor<B, 2>) -> (Tensor<B, 2>, Tensor<B, 2>) {
        let mean = self.mean.forward(features, Activation::Tanh);
        let log_std = mean.zeros_like() + self.log_std.val().unsqueeze_dim(0);
        (mean, log_std)
    }

    /// Distribution parameters for feature rows
    pub fn info(&self, features: ArrayView2<f64>) -> Result<DistInfo> {
        if features.ncols() != self.input_dim() {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![features.nrows(), self.input_dim()],
                actual: vec![features.nrows(), features.ncols()],
            });
        }
        let device = self.log_std.val().device();
        let (mean, log_std) = self.forward(from_array2(features, &device));
        DistInfo::new(to_array2(mean)?, to_array2(log_std)?)
    }

    pub fn num_params(&self) -> usize {
        self.mean.num_params() + self.log_std.val().dims()[0]
    }

    pub fn flat_params(&self) -> Vec<f64> {
        let mut flat = self.mean.flat_params();
        flat.extend(tensor_values(self.log_std.val()));
        flat
    }

    pub fn load_flat(self, flat: &[f64]) -> Result<Self> {
        if flat.len() != self.num_params() {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![self.num_params()],
                actual: vec![flat.len()],
            });
        }
        let n = self.mean.num_params();
        let device = self.log_std.val().device();
        let action_dim = flat.len() - n;
        Ok(Self {
            mean: self.mean.load_flat(&flat[..n])?,
            log_std: Param::from_tensor(Tensor::from_data(
                TensorData::new(flat[n..].to_vec(), [action_dim]),
                &device,
            )),
        })
    }

    pub fn average_std(&self) -> f64 {
        let stds: Vec<f64> = tensor_values(self.log_std.val().exp());
        stds.iter().sum::<f64>() / stds.len().max(1) as f64
    }
}

impl<B: AutodiffBackend> GaussianHead<B> {
    /// Gradient of the last backward pass in flat parameter order
    pub fn flat_grads(&self, grads: &B::Gradients) -> Vec<f64> {
        let mut flat = self.mean.flat_grads(grads);
        match self.log_std.val().grad(grads) {
            Some(g) => flat.extend(tensor_values(g)),
            None => flat.extend(std::iter::repeat(0.0).take(self.log_std.val().dims()[0])),
        }
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{device, TrainingBackend};
    use burn::module::AutodiffModule;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn head() -> GaussianHead<TrainingBackend> {
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        GaussianHead::new(3, 2, &[8], 0.5, &mut rng, &device())
    }

    #[test]
    fn test_log_std_is_shared_across_rows() {
        let info = head()
            .valid()
            .info(Array2::from_shape_fn((4, 3), |(i, j)| (i + j) as f64).view())
            .unwrap();
        assert_eq!(info.log_std.dim(), (4, 2));
        assert!(info.log_std.iter().all(|v| (v - 0.5f64.ln()).abs() < 1e-12));
        assert!((head().average_std() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_log_std_gradient_sums_over_rows() {
        let h = head();
        let x = Array2::from_shape_fn((5, 3), |(i, j)| (i as f64 - j as f64) * 0.1);
        let (_, log_std) = h.forward(from_array2(x.view(), &device()));
        let grads = log_std.sum().backward();
        let flat = h.flat_grads(&grads);
        let n = flat.len();
        assert_eq!(n, h.num_params());
        assert_eq!(&flat[n - 2..], &[5.0, 5.0]);
        assert!(flat[..n - 2].iter().all(|g| *g == 0.0));
    }

    #[test]
    fn test_load_flat_rejects_wrong_length() {
        let h = head();
        let flat = h.flat_params();
        assert!(h.clone().load_flat(&flat[1..]).is_err());
        assert_eq!(h.load_flat(&flat).unwrap().flat_params(), flat);
    }
}
