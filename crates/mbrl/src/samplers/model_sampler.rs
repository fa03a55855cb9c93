//! Imagined rollouts through the dynamics ensemble.

use super::{Path, Transition};
use crate::dynamics::{DynamicsEnsemble, MemberSelector};
use crate::env::MbEnv;
use crate::policy::Policy;
use crate::utils::stack_rows;
use crate::{MbrlError, Result};
use ndarray::{Array1, Array2};
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

/// How ensemble members are assigned to imagined steps
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberSelection {
    /// One member drawn per trajectory and kept for all of its steps
    PerTrajectory,
    /// A fresh member drawn for every step
    PerStep,
    /// Average prediction of all members
    Mean,
}

/// Imagined rollout settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImaginedSamplerConfig {
    pub num_rollouts: usize,
    pub max_path_length: usize,
    /// Start from observations in the replay buffer instead of `env.reset()`
    pub sample_from_buffer: bool,
    pub member_selection: MemberSelection,
    /// Use member predictions without residual noise
    pub deterministic: bool,
    /// Weight of ensemble disagreement subtracted from imagined rewards
    pub disagreement_penalty: f64,
}

impl Default for ImaginedSamplerConfig {
    fn default() -> Self {
        Self {
            num_rollouts: 50,
            max_path_length: 200,
            sample_from_buffer: true,
            member_selection: MemberSelection::PerTrajectory,
            deterministic: false,
            disagreement_penalty: 0.0,
        }
    }
}

impl ImaginedSamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_rollouts == 0 || self.max_path_length == 0 {
            return Err(MbrlError::ConfigError(
                "imagined sampler needs num_rollouts and max_path_length > 0".to_string(),
            ));
        }
        if !(self.disagreement_penalty >= 0.0) {
            return Err(MbrlError::ConfigError(
                "disagreement_penalty must be >= 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Rolls the policy out against the learned model.
///
/// All rollouts advance together: each step queries the policy per rollout and
/// the ensemble once for every rollout still running. The environment is only
/// consulted for start states, its reward function and its termination test.
pub struct ModelSampler {
    config: ImaginedSamplerConfig,
    seed: u64,
    total_timesteps_sampled: u64,
    last_mean_disagreement: f64,
}

impl ModelSampler {
    pub fn new(config: ImaginedSamplerConfig, seed: u64) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            seed,
            total_timesteps_sampled: 0,
            last_mean_disagreement: 0.0,
        })
    }

    pub fn config(&self) -> &ImaginedSamplerConfig {
        &self.config
    }

    pub fn total_timesteps_sampled(&self) -> u64 {
        self.total_timesteps_sampled
    }

    /// Mean ensemble disagreement over the steps of the last call
    pub fn last_mean_disagreement(&self) -> f64 {
        self.last_mean_disagreement
    }

    fn start_observations<E: MbEnv + ?Sized>(
        &self,
        dynamics: &DynamicsEnsemble,
        env: &mut E,
        rng: &mut ChaCha8Rng,
    ) -> Result<Vec<Array1<f64>>> {
        let n = self.config.num_rollouts;
        if self.config.sample_from_buffer {
            if let Some(obs) = dynamics.sample_observations(n, rng) {
                return Ok(obs.outer_iter().map(|row| row.to_owned()).collect());
            }
            tracing::debug!("Replay buffer empty, starting imagined rollouts from env.reset()");
        }
        (0..n).map(|_| env.reset(Some(rng.next_u64()))).collect()
    }

    /// Collect `num_rollouts` imagined paths.
    ///
    /// `stream` selects the random stream of the call; the same stream with the
    /// same policy and ensemble reproduces the same paths.
    pub fn obtain_samples<P, E>(
        &mut self,
        policy: &P,
        dynamics: &DynamicsEnsemble,
        env: &mut E,
        stream: u64,
    ) -> Result<Vec<Path>>
    where
        P: Policy + ?Sized,
        E: MbEnv + ?Sized,
    {
        if !dynamics.is_fitted() {
            return Err(MbrlError::ConfigError(
                "imagined sampling requires a fitted dynamics ensemble".to_string(),
            ));
        }
        let obs_dim = dynamics.obs_dim();
        let act_dim = dynamics.act_dim();
        let num_members = dynamics.num_members();

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        rng.set_stream(stream);

        let mut observations = self.start_observations(dynamics, env, &mut rng)?;
        let n = observations.len();
        let mut hidden: Vec<Option<Array1<f64>>> = (0..n).map(|_| policy.initial_hidden()).collect();
        let trajectory_members: Vec<usize> =
            (0..n).map(|_| rng.gen_range(0..num_members)).collect();
        let member_std: Vec<Array1<f64>> = (0..num_members)
            .map(|m| {
                dynamics
                    .residual_std(m)
                    .map(|s| s.to_owned())
                    .unwrap_or_else(|| Array1::zeros(obs_dim))
            })
            .collect();
        let mean_std = dynamics.mean_residual_std();

        let mut paths: Vec<Path> = (0..n).map(|_| Path::new()).collect();
        let mut active: Vec<usize> = (0..n).collect();
        let mut disagreement_sum = 0.0;
        let mut steps = 0usize;

        for _ in 0..self.config.max_path_length {
            if active.is_empty() {
                break;
            }

            let mut policy_steps = Vec::with_capacity(active.len());
            for &i in &active {
                policy_steps.push(policy.get_action(
                    observations[i].view(),
                    hidden[i].as_ref().map(|h| h.view()),
                    &mut rng,
                )?);
            }

            let obs_batch = stack_rows(active.iter().map(|&i| observations[i].view()), obs_dim)?;
            let act_batch = stack_rows(policy_steps.iter().map(|s| s.action.view()), act_dim)?;

            let members: Option<Vec<usize>> = match self.config.member_selection {
                MemberSelection::PerTrajectory => {
                    Some(active.iter().map(|&i| trajectory_members[i]).collect())
                }
                MemberSelection::PerStep => Some(
                    (0..active.len())
                        .map(|_| rng.gen_range(0..num_members))
                        .collect(),
                ),
                MemberSelection::Mean => None,
            };
            let selector = match &members {
                Some(m) => MemberSelector::PerRow(m.clone()),
                None => MemberSelector::Mean,
            };
            let prediction = dynamics.predict(obs_batch.view(), act_batch.view(), &selector)?;
            let mut next_batch: Array2<f64> = prediction.next_observations;
            if !self.config.deterministic {
                for (row, mut next) in next_batch.outer_iter_mut().enumerate() {
                    let sigma = match &members {
                        Some(m) => &member_std[m[row]],
                        None => &mean_std,
                    };
                    for (x, s) in next.iter_mut().zip(sigma.iter()) {
                        let z: f64 = rng.sample(StandardNormal);
                        *x += s * z;
                    }
                }
            }
            let disagreement = dynamics.disagreement(obs_batch.view(), act_batch.view())?;
            disagreement_sum += disagreement.sum();

            let mut still_active = Vec::with_capacity(active.len());
            for (row, (&i, step)) in active.iter().zip(policy_steps).enumerate() {
                let next_observation = next_batch.row(row).to_owned();
                let reward = env
                    .reward(
                        observations[i].view(),
                        step.action.view(),
                        next_observation.view(),
                    )
                    .unwrap_or(prediction.rewards[row])
                    - self.config.disagreement_penalty * disagreement[row];
                let terminal = env.is_terminal(next_observation.view());
                if !reward.is_finite() || next_observation.iter().any(|v| !v.is_finite()) {
                    return Err(MbrlError::NumericalError(format!(
                        "imagined rollout {} produced a non-finite transition",
                        i
                    )));
                }

                paths[i].push(Transition {
                    observation: std::mem::replace(&mut observations[i], next_observation.clone()),
                    action: step.action,
                    reward,
                    next_observation,
                    terminal,
                    agent_info: step.agent_info,
                })?;
                hidden[i] = step.next_hidden;
                if !terminal {
                    still_active.push(i);
                }
            }
            steps += active.len();
            active = still_active;
        }

        self.total_timesteps_sampled += steps as u64;
        self.last_mean_disagreement = if steps > 0 {
            disagreement_sum / steps as f64
        } else {
            0.0
        };
        tracing::debug!(
            stream,
            rollouts = paths.len(),
            steps,
            disagreement = self.last_mean_disagreement,
            "Collected imagined rollouts"
        );
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dynamics::DynamicsConfig;
    use crate::env::StepResult;
    use crate::policy::{GaussianMlpPolicy, MEAN_KEY};
    use crate::spaces::Box as BoxSpace;
    use ndarray::{array, ArrayView1};

    /// Known-reward toy system; terminal once |x| exceeds `bound`.
    struct Toy {
        known_reward: bool,
        bound: f64,
    }

    impl MbEnv for Toy {
        fn observation_space(&self) -> BoxSpace {
            BoxSpace::unbounded(2)
        }
        fn action_space(&self) -> BoxSpace {
            BoxSpace::symmetric(1)
        }
        fn reset(&mut self, _seed: Option<u64>) -> Result<Array1<f64>> {
            Ok(array![0.1, -0.1])
        }
        fn step(&mut self, _action: ArrayView1<f64>) -> Result<StepResult> {
            Err(MbrlError::EnvError("imagined rollouts never step the env".to_string()))
        }
        fn reward(
            &self,
            _obs: ArrayView1<f64>,
            _act: ArrayView1<f64>,
            _next: ArrayView1<f64>,
        ) -> Option<f64> {
            self.known_reward.then_some(1.0)
        }
        fn is_terminal(&self, obs: ArrayView1<f64>) -> bool {
            obs[0].abs() > self.bound
        }
    }

    fn fitted_ensemble() -> DynamicsEnsemble {
        let config = DynamicsConfig {
            num_models: 3,
            hidden_sizes: vec![8],
            batch_size: 8,
            buffer_size: 100,
            ..Default::default()
        };
        let mut ens = DynamicsEnsemble::new(config, 2, 1, 0).unwrap();
        let obs = Array2::from_shape_fn((40, 2), |(i, j)| ((i * 3 + j) as f64 * 0.21).sin() * 0.5);
        let act = Array2::from_shape_fn((40, 1), |(i, _)| ((i as f64) * 0.7).cos());
        let next = Array2::from_shape_fn((40, 2), |(i, j)| obs[[i, j]] + 0.05 * act[[i, 0]]);
        let rew = Array1::from_shape_fn(40, |i| -obs[[i, 0]].abs());
        ens.fit(obs.view(), act.view(), next.view(), rew.view(), 3)
            .unwrap();
        ens
    }

    fn config(selection: MemberSelection) -> ImaginedSamplerConfig {
        ImaginedSamplerConfig {
            num_rollouts: 6,
            max_path_length: 7,
            member_selection: selection,
            ..Default::default()
        }
    }

    #[test]
    fn test_collects_rollouts_from_model() {
        let ens = fitted_ensemble();
        let policy = GaussianMlpPolicy::new(2, 1, &[4], 1.0, 0);
        let mut env = Toy { known_reward: false, bound: 1e9 };
        for selection in [
            MemberSelection::PerTrajectory,
            MemberSelection::PerStep,
            MemberSelection::Mean,
        ] {
            let mut sampler = ModelSampler::new(config(selection), 1).unwrap();
            let paths = sampler.obtain_samples(&policy, &ens, &mut env, 0).unwrap();
            assert_eq!(paths.len(), 6);
            assert!(paths.iter().all(|p| p.len() == 7));
            assert!(paths[0].transitions()[0].agent_info.contains_key(MEAN_KEY));
            assert_eq!(sampler.total_timesteps_sampled(), 42);
            assert!(sampler.last_mean_disagreement() >= 0.0);
        }
    }

    #[test]
    fn test_known_reward_and_penalty() {
        let ens = fitted_ensemble();
        let policy = GaussianMlpPolicy::new(2, 1, &[4], 1.0, 0);
        let mut env = Toy { known_reward: true, bound: 1e9 };

        let mut plain = ModelSampler::new(config(MemberSelection::PerTrajectory), 1).unwrap();
        let paths = plain.obtain_samples(&policy, &ens, &mut env, 0).unwrap();
        assert!(paths.iter().all(|p| p.rewards().iter().all(|r| *r == 1.0)));

        let penalized_config = ImaginedSamplerConfig {
            disagreement_penalty: 100.0,
            ..config(MemberSelection::PerTrajectory)
        };
        let mut penalized = ModelSampler::new(penalized_config, 1).unwrap();
        let paths = penalized.obtain_samples(&policy, &ens, &mut env, 0).unwrap();
        assert!(paths.iter().all(|p| p.rewards().iter().all(|r| *r <= 1.0)));
    }

    #[test]
    fn test_terminal_states_end_rollouts() {
        let ens = fitted_ensemble();
        let policy = GaussianMlpPolicy::new(2, 1, &[4], 1.0, 0);
        let mut env = Toy { known_reward: false, bound: -1.0 };
        let mut sampler = ModelSampler::new(config(MemberSelection::PerStep), 1).unwrap();
        let paths = sampler.obtain_samples(&policy, &ens, &mut env, 0).unwrap();
        assert!(paths.iter().all(|p| p.len() == 1 && p.is_terminated()));
    }

    #[test]
    fn test_same_seed_and_iteration_reproduce() {
        let ens = fitted_ensemble();
        let policy = GaussianMlpPolicy::new(2, 1, &[4], 1.0, 0);
        let mut env = Toy { known_reward: false, bound: 1e9 };
        let a = ModelSampler::new(config(MemberSelection::PerTrajectory), 4)
            .unwrap()
            .obtain_samples(&policy, &ens, &mut env, 2)
            .unwrap();
        let b = ModelSampler::new(config(MemberSelection::PerTrajectory), 4)
            .unwrap()
            .obtain_samples(&policy, &ens, &mut env, 2)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_unfitted_ensemble_is_rejected() {
        let ens = DynamicsEnsemble::new(DynamicsConfig::default(), 2, 1, 0).unwrap();
        let policy = GaussianMlpPolicy::new(2, 1, &[4], 1.0, 0);
        let mut env = Toy { known_reward: false, bound: 1e9 };
        let mut sampler = ModelSampler::new(config(MemberSelection::Mean), 0).unwrap();
        assert!(matches!(
            sampler.obtain_samples(&policy, &ens, &mut env, 0),
            Err(MbrlError::ConfigError(_))
        ));
    }
}
