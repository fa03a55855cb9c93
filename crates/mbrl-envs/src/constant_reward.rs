//! Environment with a known return, for checking return and advantage math.

use mbrl::env::{EnvInfo, MbEnv, StepResult};
use mbrl::spaces::Box as BoxSpace;
use mbrl::Result;
use ndarray::{array, Array1, ArrayView1};

/// Pays a reward of 1 per step and terminates after `horizon` steps.
///
/// Observation: [steps taken]
/// Action: ignored, one dimension in [-1, 1]
pub struct ConstantReward {
    horizon: usize,
    steps: usize,
}

impl ConstantReward {
    pub fn new(horizon: usize) -> Self {
        Self { horizon, steps: 0 }
    }
}

impl Default for ConstantReward {
    fn default() -> Self {
        Self::new(5)
    }
}

impl MbEnv for ConstantReward {
    fn observation_space(&self) -> BoxSpace {
        BoxSpace::uniform(1, 0.0, self.horizon as f64)
    }

    fn action_space(&self) -> BoxSpace {
        BoxSpace::symmetric(1)
    }

    fn reset(&mut self, _seed: Option<u64>) -> Result<Array1<f64>> {
        self.steps = 0;
        Ok(array![0.0])
    }

    fn step(&mut self, _action: ArrayView1<f64>) -> Result<StepResult> {
        self.steps += 1;
        Ok(StepResult {
            observation: array![self.steps as f64],
            reward: 1.0,
            terminated: self.steps >= self.horizon,
            truncated: false,
            info: EnvInfo::new(),
        })
    }

    fn reward(
        &self,
        _observation: ArrayView1<f64>,
        _action: ArrayView1<f64>,
        _next_observation: ArrayView1<f64>,
    ) -> Option<f64> {
        Some(1.0)
    }

    fn is_terminal(&self, observation: ArrayView1<f64>) -> bool {
        observation[0] >= self.horizon as f64
    }

    fn name(&self) -> &str {
        "constant_reward"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminates_after_horizon() {
        let mut env = ConstantReward::new(3);
        env.reset(None).unwrap();
        let a = array![0.0];
        assert!(!env.step(a.view()).unwrap().done());
        assert!(!env.step(a.view()).unwrap().done());
        let last = env.step(a.view()).unwrap();
        assert!(last.done());
        assert_eq!(last.reward, 1.0);
        assert!(env.is_terminal(last.observation.view()));
    }
}
