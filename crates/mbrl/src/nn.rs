//! Dense networks on burn tensors.
//!
//! Training runs on `Autodiff<NdArray<f64>>`; rollouts and predictions use the
//! inner backend through `AutodiffModule::valid`. Parameters can also be
//! exchanged as one flat vector (per layer: weight in row-major `(in, out)`
//! order, then bias), which is what snapshot records and the trust-region
//! step work with.

use crate::{MbrlError, Result};
use burn::backend::ndarray::NdArrayDevice;
use burn::backend::{Autodiff, NdArray};
use burn::module::{Module, Param};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{activation, Tensor, TensorData};
use ndarray::{Array2, ArrayView2};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Backend for rollouts, predictions and records
pub type InferenceBackend = NdArray<f64>;

/// Backend the optimizers step on
pub type TrainingBackend = Autodiff<InferenceBackend>;

/// Every tensor in the crate lives on the CPU
pub fn device() -> NdArrayDevice {
    NdArrayDevice::Cpu
}

/// Elementwise nonlinearity
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Tanh,
    Relu,
    Identity,
}

impl Activation {
    pub fn forward<B: Backend, const D: usize>(self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Tanh => x.tanh(),
            Activation::Relu => activation::relu(x),
            Activation::Identity => x,
        }
    }
}

/// Values of a tensor in row-major order
pub fn tensor_values<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Vec<f64> {
    tensor.into_data().iter::<f64>().collect()
}

pub fn to_array2<B: Backend>(tensor: Tensor<B, 2>) -> Result<Array2<f64>> {
    let [rows, cols] = tensor.dims();
    Array2::from_shape_vec((rows, cols), tensor_values(tensor))
        .map_err(|e| MbrlError::NumericalError(e.to_string()))
}

pub fn from_array2<B: Backend>(x: ArrayView2<f64>, device: &B::Device) -> Tensor<B, 2> {
    let (rows, cols) = x.dim();
    let values: Vec<f64> = x.iter().copied().collect();
    Tensor::from_data(TensorData::new(values, [rows, cols]), device)
}

pub fn from_slice<B: Backend>(x: &[f64], device: &B::Device) -> Tensor<B, 1> {
    Tensor::from_data(TensorData::new(x.to_vec(), [x.len()]), device)
}

/// Fully connected layer, `y = x W + b` with `W` stored as `[in, out]`
#[derive(Module, Debug)]
pub struct Dense<B: Backend> {
    weight: Param<Tensor<B, 2>>,
    bias: Param<Tensor<B, 1>>,
}

impl<B: Backend> Dense<B> {
    fn from_values(
        weight: Vec<f64>,
        bias: Vec<f64>,
        fan_in: usize,
        fan_out: usize,
        device: &B::Device,
    ) -> Self {
        Self {
            weight: Param::from_tensor(Tensor::from_data(
                TensorData::new(weight, [fan_in, fan_out]),
                device,
            )),
            bias: Param::from_tensor(Tensor::from_data(TensorData::new(bias, [fan_out]), device)),
        }
    }

    fn dims(&self) -> [usize; 2] {
        self.weight.val().dims()
    }

    fn num_params(&self) -> usize {
        let [fan_in, fan_out] = self.dims();
        fan_in * fan_out + fan_out
    }

    pub fn forward(&self, input: Tensor<B, 2>) -> Tensor<B, 2> {
        input.matmul(self.weight.val()) + self.bias.val().unsqueeze_dim(0)
    }
}

/// Layer sizes and initialization of an `Mlp`
#[derive(Clone, Debug, PartialEq)]
pub struct MlpConfig {
    pub input_dim: usize,
    pub hidden_sizes: Vec<usize>,
    pub output_dim: usize,
    /// Multiplier on the output layer's initial weights
    pub output_gain: f64,
}

impl MlpConfig {
    pub fn new(input_dim: usize, hidden_sizes: &[usize], output_dim: usize) -> Self {
        Self {
            input_dim,
            hidden_sizes: hidden_sizes.to_vec(),
            output_dim,
            output_gain: 1.0,
        }
    }

    pub fn with_output_gain(mut self, gain: f64) -> Self {
        self.output_gain = gain;
        self
    }

    /// Build the network with Glorot-uniform weights and zero biases.
    ///
    /// Weights are drawn from `rng`, so a seeded generator gives the same
    /// network on every run.
    pub fn init<B: Backend, R: Rng + ?Sized>(&self, rng: &mut R, device: &B::Device) -> Mlp<B> {
        let mut sizes = Vec::with_capacity(self.hidden_sizes.len() + 2);
        sizes.push(self.input_dim);
        sizes.extend_from_slice(&self.hidden_sizes);
        sizes.push(self.output_dim);

        let last = sizes.len() - 2;
        let layers = sizes
            .windows(2)
            .enumerate()
            .map(|(i, pair)| {
                let (fan_in, fan_out) = (pair[0], pair[1]);
                let limit = (6.0 / (fan_in + fan_out).max(1) as f64).sqrt();
                let gain = if i == last { self.output_gain } else { 1.0 };
                let weight = (0..fan_in * fan_out)
                    .map(|_| gain * rng.gen_range(-limit..=limit))
                    .collect();
                Dense::from_values(weight, vec![0.0; fan_out], fan_in, fan_out, device)
            })
            .collect();
        Mlp { layers }
    }
}

/// Multi-layer perceptron with a linear output layer
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    layers: Vec<Dense<B>>,
}

impl<B: Backend> Mlp<B> {
    pub fn input_dim(&self) -> usize {
        self.layers.first().map_or(0, |l| l.dims()[0])
    }

    pub fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, |l| l.dims()[1])
    }

    /// Apply the network, with `hidden` after every layer but the last.
    pub fn forward(&self, input: Tensor<B, 2>, hidden: Activation) -> Tensor<B, 2> {
        let last = self.layers.len().saturating_sub(1);
        let mut x = input;
        for (i, layer) in self.layers.iter().enumerate() {
            x = layer.forward(x);
            if i < last {
                x = hidden.forward(x);
            }
        }
        x
    }

    /// Forward pass on ndarray rows
    pub fn predict(&self, input: ArrayView2<f64>, hidden: Activation) -> Result<Array2<f64>> {
        if input.ncols() != self.input_dim() {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![input.nrows(), self.input_dim()],
                actual: vec![input.nrows(), input.ncols()],
            });
        }
        let device = match self.layers.first() {
            Some(layer) => layer.weight.val().device(),
            None => return Err(MbrlError::ConfigError("network has no layers".to_string())),
        };
        to_array2(self.forward(from_array2(input, &device), hidden))
    }

    pub fn num_params(&self) -> usize {
        self.layers.iter().map(Dense::num_params).sum()
    }

    pub fn flat_params(&self) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.num_params());
        for layer in &self.layers {
            flat.extend(tensor_values(layer.weight.val()));
            flat.extend(tensor_values(layer.bias.val()));
        }
        flat
    }

    /// Rebuild the network from a flat parameter vector.
    pub fn load_flat(self, flat: &[f64]) -> Result<Self> {
        if flat.len() != self.num_params() {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![self.num_params()],
                actual: vec![flat.len()],
            });
        }
        let mut offset = 0;
        let mut layers = Vec::with_capacity(self.layers.len());
        for layer in self.layers {
            let [fan_in, fan_out] = layer.dims();
            let device = layer.weight.val().device();
            let weight = flat[offset..offset + fan_in * fan_out].to_vec();
            offset += fan_in * fan_out;
            let bias = flat[offset..offset + fan_out].to_vec();
            offset += fan_out;
            layers.push(Dense::from_values(weight, bias, fan_in, fan_out, &device));
        }
        Ok(Self { layers })
    }
}

impl<B: AutodiffBackend> Mlp<B> {
    /// Gradient of the last backward pass in flat parameter order.
    ///
    /// Parameters the loss did not reach get zeros.
    pub fn flat_grads(&self, grads: &B::Gradients) -> Vec<f64> {
        let mut flat = Vec::with_capacity(self.num_params());
        for layer in &self.layers {
            let [fan_in, fan_out] = layer.dims();
            match layer.weight.val().grad(grads) {
                Some(g) => flat.extend(tensor_values(g)),
                None => flat.extend(std::iter::repeat(0.0).take(fan_in * fan_out)),
            }
            match layer.bias.val().grad(grads) {
                Some(g) => flat.extend(tensor_values(g)),
                None => flat.extend(std::iter::repeat(0.0).take(fan_out)),
            }
        }
        flat
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::module::AutodiffModule;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn net(seed: u64) -> Mlp<TrainingBackend> {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        MlpConfig::new(3, &[5, 4], 2).init(&mut rng, &device())
    }

    fn inputs() -> Array2<f64> {
        Array2::from_shape_fn((6, 3), |(i, j)| ((i * 3 + j) as f64 * 0.37).sin())
    }

    #[test]
    fn test_flat_params_roundtrip() {
        let a = net(0);
        let b = net(1);
        assert_ne!(a.flat_params(), b.flat_params());
        let restored = b.load_flat(&a.flat_params()).unwrap();
        assert_eq!(restored.flat_params(), a.flat_params());
        assert_eq!(a.num_params(), 3 * 5 + 5 + 5 * 4 + 4 + 4 * 2 + 2);
        assert!(net(2).load_flat(&[0.0; 3]).is_err());
    }

    #[test]
    fn test_same_seed_same_network() {
        assert_eq!(net(7).flat_params(), net(7).flat_params());
    }

    #[test]
    fn test_autodiff_gradient_matches_finite_differences() {
        let mlp = net(3);
        let x = inputs();
        let loss_of = |m: &Mlp<InferenceBackend>| -> f64 {
            let out = m.forward(from_array2(x.view(), &device()), Activation::Tanh);
            out.powf_scalar(2.0).sum().into_scalar()
        };

        let out = mlp.forward(from_array2(x.view(), &device()), Activation::Tanh);
        let grads = out.powf_scalar(2.0).sum().backward();
        let grad = mlp.flat_grads(&grads);

        let base = mlp.flat_params();
        let eps = 1e-6;
        for k in [0, 9, base.len() / 2, base.len() - 1] {
            let mut plus = base.clone();
            plus[k] += eps;
            let mut minus = base.clone();
            minus[k] -= eps;
            let f_plus = loss_of(&mlp.clone().load_flat(&plus).unwrap().valid());
            let f_minus = loss_of(&mlp.clone().load_flat(&minus).unwrap().valid());
            let fd = (f_plus - f_minus) / (2.0 * eps);
            assert!((fd - grad[k]).abs() < 1e-6, "param {}: {} vs {}", k, fd, grad[k]);
        }
    }

    #[test]
    fn test_predict_checks_input_width() {
        let mlp = net(0).valid();
        let out = mlp.predict(inputs().view(), Activation::Relu).unwrap();
        assert_eq!(out.dim(), (6, 2));
        assert!(matches!(
            mlp.predict(Array2::zeros((2, 4)).view(), Activation::Relu),
            Err(MbrlError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_output_gain_scales_last_layer() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let plain: Mlp<InferenceBackend> = MlpConfig::new(2, &[3], 1).init(&mut rng, &device());
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let scaled: Mlp<InferenceBackend> = MlpConfig::new(2, &[3], 1)
            .with_output_gain(0.1)
            .init(&mut rng, &device());
        let (p, s) = (plain.flat_params(), scaled.flat_params());
        // first layer: 2x3 weights and 3 biases
        assert_eq!(p[..9], s[..9]);
        for k in 9..12 {
            assert!((s[k] - 0.1 * p[k]).abs() < 1e-12);
        }
    }
}
