//! Environment wrappers.

use super::{MbEnv, StepResult};
use crate::samplers::Path;
use crate::spaces::Box as BoxSpace;
use crate::{MbrlError, Result};
use ndarray::{Array1, ArrayView1, Zip};

/// Exposes a `[-1, 1]` action box and rescales actions to the wrapped bounds.
///
/// Actions outside `[-1, 1]` are clipped before rescaling.
pub struct NormalizedEnv<E: MbEnv> {
    inner: E,
    low: Array1<f64>,
    high: Array1<f64>,
}

impl<E: MbEnv> NormalizedEnv<E> {
    /// Wrap an environment. Fails if the action space is unbounded.
    pub fn new(inner: E) -> Result<Self> {
        let space = inner.action_space();
        if !space.is_bounded() {
            return Err(MbrlError::ConfigError(format!(
                "cannot normalize unbounded action space of '{}'",
                inner.name()
            )));
        }
        Ok(Self {
            low: space.low.clone(),
            high: space.high.clone(),
            inner,
        })
    }

    /// Access the wrapped environment
    pub fn inner(&self) -> &E {
        &self.inner
    }

    /// Map a normalized action into the wrapped action bounds.
    pub fn scale_action(&self, action: ArrayView1<f64>) -> Array1<f64> {
        let mut scaled = Array1::zeros(action.len());
        Zip::from(&mut scaled)
            .and(&action)
            .and(&self.low)
            .and(&self.high)
            .for_each(|s, &a, &l, &h| {
                let a = a.clamp(-1.0, 1.0);
                *s = l + (a + 1.0) * 0.5 * (h - l);
            });
        scaled
    }

    fn check_action(&self, action: ArrayView1<f64>) -> Result<()> {
        if action.len() != self.low.len() {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![self.low.len()],
                actual: vec![action.len()],
            });
        }
        Ok(())
    }
}

impl<E: MbEnv> MbEnv for NormalizedEnv<E> {
    fn observation_space(&self) -> BoxSpace {
        self.inner.observation_space()
    }

    fn action_space(&self) -> BoxSpace {
        BoxSpace::symmetric(self.low.len())
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<Array1<f64>> {
        self.inner.reset(seed)
    }

    fn step(&mut self, action: ArrayView1<f64>) -> Result<StepResult> {
        self.check_action(action)?;
        let scaled = self.scale_action(action);
        self.inner.step(scaled.view())
    }

    fn reward(
        &self,
        observation: ArrayView1<f64>,
        action: ArrayView1<f64>,
        next_observation: ArrayView1<f64>,
    ) -> Option<f64> {
        if action.len() != self.low.len() {
            return None;
        }
        let scaled = self.scale_action(action);
        self.inner
            .reward(observation, scaled.view(), next_observation)
    }

    fn is_terminal(&self, observation: ArrayView1<f64>) -> bool {
        self.inner.is_terminal(observation)
    }

    fn log_diagnostics(&self, paths: &[Path], prefix: &str) -> Vec<(String, f64)> {
        self.inner.log_diagnostics(paths, prefix)
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::EnvInfo;
    use ndarray::array;

    struct Echo {
        last: Array1<f64>,
    }

    impl MbEnv for Echo {
        fn observation_space(&self) -> BoxSpace {
            BoxSpace::unbounded(2)
        }
        fn action_space(&self) -> BoxSpace {
            BoxSpace::new(array![0.0, -10.0], array![4.0, 10.0]).unwrap()
        }
        fn reset(&mut self, _seed: Option<u64>) -> Result<Array1<f64>> {
            Ok(Array1::zeros(2))
        }
        fn step(&mut self, action: ArrayView1<f64>) -> Result<StepResult> {
            self.last = action.to_owned();
            Ok(StepResult {
                observation: action.to_owned(),
                reward: 0.0,
                terminated: false,
                truncated: false,
                info: EnvInfo::new(),
            })
        }
    }

    #[test]
    fn test_action_rescaling() {
        let mut env = NormalizedEnv::new(Echo {
            last: Array1::zeros(2),
        })
        .unwrap();
        assert_eq!(env.action_space(), BoxSpace::symmetric(2));

        env.step(array![-1.0, 1.0].view()).unwrap();
        assert_eq!(env.inner().last, array![0.0, 10.0]);

        env.step(array![0.0, 5.0].view()).unwrap();
        assert_eq!(env.inner().last, array![2.0, 10.0]);
    }

    #[test]
    fn test_wrong_action_width() {
        let mut env = NormalizedEnv::new(Echo {
            last: Array1::zeros(2),
        })
        .unwrap();
        let err = env.step(array![0.0].view()).unwrap_err();
        assert!(matches!(err, MbrlError::ShapeMismatch { .. }));
    }
}
