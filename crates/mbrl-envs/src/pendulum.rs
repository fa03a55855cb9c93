//! Pendulum swing-up environment.

use mbrl::env::{EnvInfo, MbEnv, StepResult};
use mbrl::samplers::Path;
use mbrl::spaces::Box as BoxSpace;
use mbrl::{MbrlError, Result};
use ndarray::{array, Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;

/// Pendulum environment
///
/// A frictionless pendulum starts at a random angle and must be swung up and
/// held upright with a bounded torque.
///
/// Observation: [cos(theta), sin(theta), theta_dot]
/// Action: torque in [-2, 2]
pub struct Pendulum {
    max_speed: f64,
    max_torque: f64,
    dt: f64,
    gravity: f64,
    mass: f64,
    length: f64,

    theta: f64,
    theta_dot: f64,
    rng: StdRng,
}

fn angle_normalize(x: f64) -> f64 {
    (x + PI).rem_euclid(2.0 * PI) - PI
}

impl Pendulum {
    /// Create a new Pendulum environment
    pub fn new() -> Self {
        Self {
            max_speed: 8.0,
            max_torque: 2.0,
            dt: 0.05,
            gravity: 10.0,
            mass: 1.0,
            length: 1.0,
            theta: 0.0,
            theta_dot: 0.0,
            rng: StdRng::seed_from_u64(0),
        }
    }

    fn observation(&self) -> Array1<f64> {
        array![self.theta.cos(), self.theta.sin(), self.theta_dot]
    }

    fn cost(&self, theta: f64, theta_dot: f64, torque: f64) -> f64 {
        angle_normalize(theta).powi(2) + 0.1 * theta_dot.powi(2) + 0.001 * torque.powi(2)
    }
}

impl Default for Pendulum {
    fn default() -> Self {
        Self::new()
    }
}

impl MbEnv for Pendulum {
    fn observation_space(&self) -> BoxSpace {
        BoxSpace::new(
            array![-1.0, -1.0, -self.max_speed],
            array![1.0, 1.0, self.max_speed],
        )
        .unwrap_or_else(|| BoxSpace::unbounded(3))
    }

    fn action_space(&self) -> BoxSpace {
        BoxSpace::uniform(1, -self.max_torque, self.max_torque)
    }

    fn reset(&mut self, seed: Option<u64>) -> Result<Array1<f64>> {
        if let Some(s) = seed {
            self.rng = StdRng::seed_from_u64(s);
        }
        self.theta = self.rng.gen_range(-PI..PI);
        self.theta_dot = self.rng.gen_range(-1.0..1.0);
        Ok(self.observation())
    }

    fn step(&mut self, action: ArrayView1<f64>) -> Result<StepResult> {
        if action.len() != 1 {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![1],
                actual: vec![action.len()],
            });
        }
        let u = action[0].clamp(-self.max_torque, self.max_torque);
        let reward = -self.cost(self.theta, self.theta_dot, u);

        let g = self.gravity;
        let (m, l) = (self.mass, self.length);
        let acc = 3.0 * g / (2.0 * l) * self.theta.sin() + 3.0 / (m * l * l) * u;
        self.theta_dot = (self.theta_dot + acc * self.dt).clamp(-self.max_speed, self.max_speed);
        self.theta += self.theta_dot * self.dt;

        Ok(StepResult {
            observation: self.observation(),
            reward,
            terminated: false,
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
        let theta = observation[1].atan2(observation[0]);
        let u = action[0].clamp(-self.max_torque, self.max_torque);
        Some(-self.cost(theta, observation[2], u))
    }

    fn log_diagnostics(&self, paths: &[Path], prefix: &str) -> Vec<(String, f64)> {
        if paths.is_empty() {
            return Vec::new();
        }
        // final |theta| per path, 0 is upright
        let final_angle: f64 = paths
            .iter()
            .filter_map(|p| p.transitions().last())
            .map(|t| t.next_observation[1].atan2(t.next_observation[0]).abs())
            .sum::<f64>()
            / paths.len() as f64;
        vec![(format!("{}AverageFinalAngle", prefix), final_angle)]
    }

    fn name(&self) -> &str {
        "pendulum"
    }
}
