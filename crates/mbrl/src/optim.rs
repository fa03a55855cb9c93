//! Adam over burn modules.
//!
//! burn's `Optimizer` is generic over the module it steps; `ModuleOptimizer`
//! erases the concrete optimizer type so policies and ensemble members can
//! hold one behind a `Box`.

use crate::nn::TrainingBackend;
use burn::grad_clipping::GradientClippingConfig;
use burn::module::AutodiffModule;
use burn::optim::{AdamConfig, GradientsParams, Optimizer};

/// One optimizer step on a module owned by value
pub trait ModuleOptimizer<M>: Send {
    fn step(&mut self, learning_rate: f64, module: M, grads: GradientsParams) -> M;
}

impl<M, O> ModuleOptimizer<M> for O
where
    M: AutodiffModule<TrainingBackend>,
    O: Optimizer<M, TrainingBackend> + Send,
{
    fn step(&mut self, learning_rate: f64, module: M, grads: GradientsParams) -> M {
        Optimizer::step(self, learning_rate, module, grads)
    }
}

/// Adam with standard moments and an optional per-parameter gradient norm clip.
///
/// Moment estimates are keyed by parameter id, so a module whose parameters
/// were rebuilt from flat values starts from fresh moments.
pub fn adam<M>(max_grad_norm: Option<f64>) -> Box<dyn ModuleOptimizer<M>>
where
    M: AutodiffModule<TrainingBackend> + 'static,
{
    let config = AdamConfig::new()
        .with_epsilon(1e-8)
        .with_grad_clipping(max_grad_norm.map(|n| GradientClippingConfig::Norm(n as f32)));
    Box::new(config.init::<TrainingBackend, M>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::{device, from_array2, Activation, Mlp, MlpConfig};
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn loss(net: &Mlp<TrainingBackend>, x: &Array2<f64>) -> burn::tensor::Tensor<TrainingBackend, 1> {
        let target = from_array2::<TrainingBackend>(x.view(), &device()).mul_scalar(0.5);
        let out = net.forward(from_array2(x.view(), &device()), Activation::Tanh);
        (out - target).powf_scalar(2.0).mean()
    }

    #[test]
    fn test_adam_reduces_regression_loss() {
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let mut net: Mlp<TrainingBackend> = MlpConfig::new(2, &[8], 2).init(&mut rng, &device());
        let x = Array2::from_shape_fn((16, 2), |(i, j)| ((i + 2 * j) as f64 * 0.3).cos());
        let mut optimizer = adam::<Mlp<TrainingBackend>>(None);

        let first: f64 = loss(&net, &x).into_scalar();
        for _ in 0..50 {
            let l = loss(&net, &x);
            let grads = GradientsParams::from_grads(l.backward(), &net);
            net = optimizer.step(1e-2, net, grads);
        }
        let last: f64 = loss(&net, &x).into_scalar();
        assert!(last < first, "{} >= {}", last, first);
    }

    #[test]
    fn test_clipped_step_is_bounded() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let net: Mlp<TrainingBackend> = MlpConfig::new(2, &[4], 1).init(&mut rng, &device());
        let before = net.flat_params();
        let x = Array2::from_elem((4, 2), 100.0);
        let l = loss(&net, &x);
        let grads = GradientsParams::from_grads(l.backward(), &net);
        let mut optimizer = adam::<Mlp<TrainingBackend>>(Some(1e-3));
        let after = optimizer.step(1e-3, net, grads).flat_params();
        // Adam's first step moves each parameter by at most the learning rate
        for (a, b) in after.iter().zip(&before) {
            assert!((a - b).abs() <= 1e-3 + 1e-9);
        }
    }
}
