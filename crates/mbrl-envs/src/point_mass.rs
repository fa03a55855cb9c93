//! Planar point-mass environment.

use mbrl::env::{EnvInfo, MbEnv, StepResult};
use mbrl::samplers::Path;
use mbrl::spaces::Box as BoxSpace;
use mbrl::{MbrlError, Result};
use ndarray::{array, s, Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Point mass on a plane, pushed by a bounded force towards the origin.
///
/// Observation: [x, y, vx, vy]
/// Action: force in [-1, 1]^2
///
/// Reward is minus the distance to the origin minus a small control cost.
/// The episode terminates once the point leaves the arena.
pub struct PointMass {
    dt: f64,
    damping: f64,
    arena: f64,
    state: [f64; 4],
    rng: StdRng,
}

impl PointMass {
    pub fn new() -> Self {
        Self {
            dt: 0.1,
            damping: 0.1,
            arena: 5.0,
            state: [0.0; 4],
            rng: StdRng::seed_from_u64(0),
        }
    }

    fn cost(position: ArrayView1<f64>, action: ArrayView1<f64>) -> f64 {
        position.dot(&position).sqrt() + 0.01 * action.dot(&action)
    }
}

impl Default for PointMass {
    fn default() -> Self {
        Self::new()
    }
}

impl MbEnv for PointMass {
    fn observation_space(&self) -> BoxSpace {
        BoxSpace::unbounded(4)
    }

    fn action_space(&self) -> BoxSpace {
        BoxSpace::symmetric(2)
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<Array1<f64>> {
        if let Some(s) = seed {
            self.rng = StdRng::seed_from_u64(s);
        }
        self.state = [
            self.rng.gen_range(-2.0..2.0),
            self.rng.gen_range(-2.0..2.0),
            0.0,
            0.0,
        ];
        Ok(Array1::from(self.state.to_vec()))
    }

    fn step(&mut self, action: ArrayView1<f64>) -> Result<StepResult> {
        if action.len() != 2 {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![2],
                actual: vec![action.len()],
            });
        }
        let force = action.mapv(|a| a.clamp(-1.0, 1.0));
        let reward = -Self::cost(ArrayView1::from(&self.state[..2]), force.view());

        let [x, y, vx, vy] = self.state;
        let vx = (1.0 - self.damping) * vx + self.dt * force[0];
        let vy = (1.0 - self.damping) * vy + self.dt * force[1];
        self.state = [x + self.dt * vx, y + self.dt * vy, vx, vy];

        let observation = Array1::from(self.state.to_vec());
        let terminated = self.is_terminal(observation.view());
        Ok(StepResult {
            observation,
            reward,
            terminated,
            truncated: false,
            info: EnvInfo::new(),
        })
    }

    fn reward(
        &self,
        observation: ArrayView1<f64>,
        action: ArrayView1<f64>,
        _next_observation: ArrayView1<f64>,
    ) -> Option<f64> {
        let force = action.mapv(|a| a.clamp(-1.0, 1.0));
        Some(-Self::cost(observation.slice(s![..2]), force.view()))
    }

    fn is_terminal(&self, observation: ArrayView1<f64>) -> bool {
        observation[0].abs() > self.arena || observation[1].abs() > self.arena
    }

    fn log_diagnostics(&self, paths: &[Path], prefix: &str) -> Vec<(String, f64)> {
        if paths.is_empty() {
            return Vec::new();
        }
        let final_distance = paths
            .iter()
            .filter_map(|p| p.transitions().last())
            .map(|t| {
                let pos = t.next_observation.slice(s![..2]);
                pos.dot(&pos).sqrt()
            })
            .sum::<f64>()
            / paths.len() as f64;
        vec![(format!("{}AverageFinalDistance", prefix), final_distance)]
    }

    fn name(&self) -> &str {
        "point_mass"
    }
}
