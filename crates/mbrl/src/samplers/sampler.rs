//! Real-environment sampler.

use super::{Path, Transition};
use crate::env::MbEnv;
use crate::policy::Policy;
use crate::spaces::Space;
use crate::training::ExecutionContext;
use crate::{MbrlError, Result};
use ndarray::Array1;
use rand::{Rng, RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f64::consts::PI;

/// Real-environment rollout settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Rollouts collected per call
    pub num_rollouts: usize,
    /// Maximum steps per rollout
    pub max_path_length: usize,
    /// Number of environment instances stepped in parallel
    pub n_parallel: usize,
    /// Amplitude of the sinusoid warmup signal
    pub sinusoid_amplitude: f64,
    /// Period, in steps, of the sinusoid warmup signal
    pub sinusoid_period: f64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_rollouts: 10,
            max_path_length: 200,
            n_parallel: 5,
            sinusoid_amplitude: 1.0,
            sinusoid_period: 40.0,
        }
    }
}

/// How actions are chosen during a rollout
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum SamplingMode {
    /// Sample from the policy distribution
    Policy,
    /// Take the policy mean
    Deterministic,
    /// Uniform over the action box
    Random,
    /// Fixed sinusoidal excitation with a random phase per action dimension
    Sinusoid { amplitude: f64, period: f64 },
}

impl SamplingMode {
    fn uses_policy(&self) -> bool {
        matches!(self, SamplingMode::Policy | SamplingMode::Deterministic)
    }
}

/// Collects rollouts from `n_parallel` environment instances.
///
/// Rollouts are assigned round-robin to the instances and run on the
/// execution context's pool. Each rollout resets its environment with a seed
/// derived from `(seed, iteration, rollout index)`, so results do not depend
/// on the number of workers.
pub struct Sampler<E: MbEnv> {
    envs: Vec<E>,
    num_rollouts: usize,
    max_path_length: usize,
    seed: u64,
    total_timesteps_sampled: u64,
}

impl<E: MbEnv> Sampler<E> {
    pub fn new<F>(make_env: F, config: &SamplerConfig, seed: u64) -> Result<Self>
    where
        F: Fn() -> E,
    {
        if config.n_parallel == 0 || config.num_rollouts == 0 || config.max_path_length == 0 {
            return Err(MbrlError::ConfigError(
                "sampler needs n_parallel, num_rollouts and max_path_length > 0".to_string(),
            ));
        }
        let envs = (0..config.n_parallel.min(config.num_rollouts))
            .map(|_| make_env())
            .collect();
        Ok(Self {
            envs,
            num_rollouts: config.num_rollouts,
            max_path_length: config.max_path_length,
            seed,
            total_timesteps_sampled: 0,
        })
    }

    pub fn num_rollouts(&self) -> usize {
        self.num_rollouts
    }

    pub fn num_envs(&self) -> usize {
        self.envs.len()
    }

    pub fn total_timesteps_sampled(&self) -> u64 {
        self.total_timesteps_sampled
    }

    /// Collect `num_rollouts` paths.
    ///
    /// An error from any rollout aborts the whole collection; nothing collected
    /// by the call is returned or counted.
    pub fn obtain_samples<P: Policy + ?Sized>(
        &mut self,
        policy: &P,
        mode: SamplingMode,
        ctx: &ExecutionContext,
        itr: usize,
    ) -> Result<Vec<Path>> {
        let n_workers = self.envs.len();
        let num_rollouts = self.num_rollouts;
        let max_path_length = self.max_path_length;
        let seed = self.seed;
        let envs = &mut self.envs;
        // policies are not shareable across threads; each worker steps its own copy
        let workers: Vec<Box<dyn Policy>> = (0..n_workers).map(|_| policy.boxed_clone()).collect();

        let per_worker: Vec<Result<Vec<(usize, Path)>>> = ctx.install(|| {
            envs.par_iter_mut()
                .zip(workers)
                .enumerate()
                .map(|(worker, (env, policy))| {
                    (worker..num_rollouts)
                        .step_by(n_workers)
                        .map(|i| {
                            let mut rng = rollout_rng(seed, itr, i);
                            rollout(env, policy.as_ref(), mode, max_path_length, &mut rng)
                                .map(|p| (i, p))
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Vec<_>>()
        })?;

        let mut indexed = Vec::with_capacity(num_rollouts);
        for worker in per_worker {
            indexed.extend(worker?);
        }
        indexed.sort_by_key(|(i, _)| *i);
        let paths: Vec<Path> = indexed.into_iter().map(|(_, p)| p).collect();

        let steps: usize = paths.iter().map(Path::len).sum();
        self.total_timesteps_sampled += steps as u64;
        tracing::debug!(itr, rollouts = paths.len(), steps, ?mode, "Collected real rollouts");
        Ok(paths)
    }
}

fn rollout_rng(seed: u64, itr: usize, index: usize) -> ChaCha8Rng {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    rng.set_stream(((itr as u64) << 32) | index as u64);
    rng
}

fn rollout<E: MbEnv, P: Policy + ?Sized>(
    env: &mut E,
    policy: &P,
    mode: SamplingMode,
    max_path_length: usize,
    rng: &mut ChaCha8Rng,
) -> Result<Path> {
    let action_space = env.action_space();
    let mut observation = env.reset(Some(rng.next_u64()))?;
    let mut hidden = if mode.uses_policy() {
        policy.initial_hidden()
    } else {
        None
    };
    let phases: Array1<f64> = (0..action_space.dim())
        .map(|_| rng.gen_range(0.0..2.0 * PI))
        .collect();

    let mut path = Path::new();
    for t in 0..max_path_length {
        let (action, agent_info, next_hidden) = match mode {
            SamplingMode::Policy => {
                let step = policy.get_action(
                    observation.view(),
                    hidden.as_ref().map(|h| h.view()),
                    &mut *rng,
                )?;
                (step.action, step.agent_info, step.next_hidden)
            }
            SamplingMode::Deterministic => {
                let step =
                    policy.deterministic_action(observation.view(), hidden.as_ref().map(|h| h.view()))?;
                (step.action, step.agent_info, step.next_hidden)
            }
            SamplingMode::Random => (action_space.sample(&mut *rng), BTreeMap::new(), None),
            SamplingMode::Sinusoid { amplitude, period } => {
                let signal = phases.mapv(|phi| amplitude * (2.0 * PI * t as f64 / period + phi).sin());
                (action_space.clip(signal.view()), BTreeMap::new(), None)
            }
        };

        let result = env.step(action.view())?;
        let done = result.done();
        path.push(Transition {
            observation,
            action,
            reward: result.reward,
            next_observation: result.observation.clone(),
            terminal: result.terminated,
            agent_info,
        })?;
        observation = result.observation;
        hidden = next_hidden;
        if done {
            break;
        }
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{EnvInfo, StepResult};
    use crate::policy::{GaussianMlpPolicy, MEAN_KEY};
    use crate::spaces::Box as BoxSpace;
    use ndarray::{array, ArrayView1};

    /// Counts up to `horizon`, optionally failing at a given step.
    struct Counter {
        t: usize,
        horizon: usize,
        fail_at: Option<usize>,
    }

    impl MbEnv for Counter {
        fn observation_space(&self) -> BoxSpace {
            BoxSpace::unbounded(1)
        }
        fn action_space(&self) -> BoxSpace {
            BoxSpace::symmetric(1)
        }
        fn reset(&mut self, _seed: Option<u64>) -> Result<Array1<f64>> {
            self.t = 0;
            Ok(array![0.0])
        }
        fn step(&mut self, action: ArrayView1<f64>) -> Result<StepResult> {
            if Some(self.t) == self.fail_at {
                return Err(MbrlError::EnvError("simulator diverged".to_string()));
            }
            self.t += 1;
            Ok(StepResult {
                observation: array![self.t as f64],
                reward: action[0],
                terminated: self.t >= self.horizon,
                truncated: false,
                info: EnvInfo::new(),
            })
        }
    }

    fn config(n_parallel: usize, num_rollouts: usize) -> SamplerConfig {
        SamplerConfig {
            num_rollouts,
            max_path_length: 10,
            n_parallel,
            ..Default::default()
        }
    }

    fn acquired() -> ExecutionContext {
        let mut ctx = ExecutionContext::new(2, 0);
        ctx.acquire().unwrap();
        ctx
    }

    #[test]
    fn test_collects_requested_rollouts() {
        let ctx = acquired();
        let make = || Counter { t: 0, horizon: 4, fail_at: None };
        let mut sampler = Sampler::new(make, &config(3, 7), 1).unwrap();
        let policy = GaussianMlpPolicy::new(1, 1, &[4], 1.0, 0);

        let paths = sampler
            .obtain_samples(&policy, SamplingMode::Policy, &ctx, 0)
            .unwrap();
        assert_eq!(paths.len(), 7);
        assert!(paths.iter().all(|p| p.len() == 4 && p.is_terminated()));
        assert!(paths[0].transitions()[0].agent_info.contains_key(MEAN_KEY));
        assert_eq!(sampler.total_timesteps_sampled(), 28);
    }

    #[test]
    fn test_results_independent_of_worker_count() {
        let ctx = acquired();
        let make = || Counter { t: 0, horizon: 5, fail_at: None };
        let policy = GaussianMlpPolicy::new(1, 1, &[4], 1.0, 0);
        let a = Sampler::new(make, &config(1, 4), 9)
            .unwrap()
            .obtain_samples(&policy, SamplingMode::Policy, &ctx, 3)
            .unwrap();
        let b = Sampler::new(make, &config(4, 4), 9)
            .unwrap()
            .obtain_samples(&policy, SamplingMode::Policy, &ctx, 3)
            .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_warmup_modes_record_no_agent_info() {
        let ctx = acquired();
        let make = || Counter { t: 0, horizon: 20, fail_at: None };
        let mut sampler = Sampler::new(make, &config(2, 2), 0).unwrap();
        let policy = GaussianMlpPolicy::new(1, 1, &[4], 1.0, 0);

        for mode in [
            SamplingMode::Random,
            SamplingMode::Sinusoid { amplitude: 2.0, period: 8.0 },
        ] {
            let paths = sampler.obtain_samples(&policy, mode, &ctx, 0).unwrap();
            for path in &paths {
                assert_eq!(path.len(), 10);
                for t in path.transitions() {
                    assert!(t.agent_info.is_empty());
                    assert!(t.action[0].abs() <= 1.0);
                }
            }
        }
    }

    #[test]
    fn test_env_error_aborts_collection() {
        let ctx = acquired();
        let make = || Counter { t: 0, horizon: 5, fail_at: Some(2) };
        let mut sampler = Sampler::new(make, &config(2, 4), 0).unwrap();
        let policy = GaussianMlpPolicy::new(1, 1, &[4], 1.0, 0);
        let err = sampler
            .obtain_samples(&policy, SamplingMode::Policy, &ctx, 0)
            .unwrap_err();
        assert!(matches!(err, MbrlError::EnvError(_)));
        assert_eq!(sampler.total_timesteps_sampled(), 0);
    }

    #[test]
    fn test_requires_acquired_context() {
        let ctx = ExecutionContext::new(1, 0);
        let make = || Counter { t: 0, horizon: 5, fail_at: None };
        let mut sampler = Sampler::new(make, &config(1, 1), 0).unwrap();
        let policy = GaussianMlpPolicy::new(1, 1, &[4], 1.0, 0);
        assert!(matches!(
            sampler.obtain_samples(&policy, SamplingMode::Policy, &ctx, 0),
            Err(MbrlError::ContextError(_))
        ));
    }
}
