//! Sampling, processing and dynamics fitting against the reference environments.

use mbrl::baselines::ZeroBaseline;
use mbrl::checkpoint::Checkpointable;
use mbrl::dynamics::{DynamicsConfig, DynamicsEnsemble, MemberSelector};
use mbrl::policy::GaussianMlpPolicy;
use mbrl::samplers::{ProcessorConfig, SampleProcessor, Sampler, SamplerConfig, SamplingMode};
use mbrl::training::ExecutionContext;
use mbrl_envs::{ConstantReward, Pendulum};
use ndarray::{s, Array1};

fn acquired(n: usize) -> ExecutionContext {
    let mut ctx = ExecutionContext::new(n, 0);
    ctx.acquire().unwrap();
    ctx
}

#[test]
fn test_constant_reward_advantages() {
    let ctx = acquired(2);
    let config = SamplerConfig {
        num_rollouts: 3,
        max_path_length: 50,
        n_parallel: 2,
        ..Default::default()
    };
    let mut sampler = Sampler::new(ConstantReward::default, &config, 0).unwrap();
    let policy = GaussianMlpPolicy::new(1, 1, &[4], 1.0, 0);
    let paths = sampler
        .obtain_samples(&policy, SamplingMode::Policy, &ctx, 0)
        .unwrap();
    assert!(paths.iter().all(|p| p.len() == 5 && p.is_terminated()));

    let mut processor = SampleProcessor::new(
        ProcessorConfig {
            discount: 1.0,
            gae_lambda: 1.0,
            normalize_adv: false,
            positive_adv: false,
            backprop_steps: None,
        },
        ZeroBaseline,
    )
    .unwrap();
    let batch = processor.process(&paths, "").unwrap();

    let expected = Array1::from(vec![5.0, 4.0, 3.0, 2.0, 1.0]);
    for k in 0..3 {
        let rows = s![k * 5..(k + 1) * 5];
        assert_eq!(batch.advantages.slice(rows), expected);
        assert_eq!(batch.returns.slice(rows), expected);
    }
    assert_eq!(batch.stats["AverageReturn"], 5.0);
    assert_eq!(batch.stats["AverageDiscountedReturn"], 5.0);
}

fn pendulum_data() -> (mbrl::samplers::ProcessedBatch, usize) {
    let ctx = acquired(2);
    let config = SamplerConfig {
        num_rollouts: 4,
        max_path_length: 30,
        n_parallel: 2,
        ..Default::default()
    };
    let mut sampler = Sampler::new(Pendulum::new, &config, 3).unwrap();
    let policy = GaussianMlpPolicy::new(3, 1, &[8], 1.0, 0);
    let paths = sampler
        .obtain_samples(&policy, SamplingMode::Random, &ctx, 0)
        .unwrap();
    let mut processor = SampleProcessor::new(ProcessorConfig::default(), ZeroBaseline).unwrap();
    let batch = processor.process(&paths, "Real-").unwrap();
    let n = batch.len();
    (batch, n)
}

fn small_dynamics(bootstrap: bool) -> DynamicsConfig {
    DynamicsConfig {
        num_models: 3,
        hidden_sizes: vec![16],
        batch_size: 16,
        max_epochs: 5,
        buffer_size: 1000,
        bootstrap,
        ..Default::default()
    }
}

#[test]
fn test_members_identical_without_bootstrap() {
    let (batch, n) = pendulum_data();
    assert_eq!(n, 120);
    let mut ensemble = DynamicsEnsemble::new(small_dynamics(false), 3, 1, 9).unwrap();
    ensemble
        .fit(
            batch.observations.view(),
            batch.actions.view(),
            batch.next_observations.view(),
            batch.rewards.view(),
            5,
        )
        .unwrap();

    let first = ensemble.member_params(0).unwrap();
    for m in 1..3 {
        assert_eq!(ensemble.member_params(m).unwrap(), first);
    }
    let spread = ensemble
        .disagreement(batch.observations.view(), batch.actions.view())
        .unwrap();
    assert!(spread.iter().all(|&d| d.abs() < 1e-12));
}

#[test]
fn test_bootstrap_members_diverge() {
    let (batch, _) = pendulum_data();
    let mut ensemble = DynamicsEnsemble::new(small_dynamics(true), 3, 1, 9).unwrap();
    ensemble
        .fit(
            batch.observations.view(),
            batch.actions.view(),
            batch.next_observations.view(),
            batch.rewards.view(),
            5,
        )
        .unwrap();
    assert_ne!(ensemble.member_params(0), ensemble.member_params(1));

    let prediction = ensemble
        .predict(
            batch.observations.view(),
            batch.actions.view(),
            &MemberSelector::Mean,
        )
        .unwrap();
    assert_eq!(prediction.next_observations.dim(), (batch.len(), 3));
    assert!(prediction.rewards.iter().all(|r| r.is_finite()));
}

#[test]
fn test_ensemble_record_restores_predictions() {
    let (batch, _) = pendulum_data();
    let mut ensemble = DynamicsEnsemble::new(small_dynamics(true), 3, 1, 9).unwrap();
    ensemble
        .fit(
            batch.observations.view(),
            batch.actions.view(),
            batch.next_observations.view(),
            batch.rewards.view(),
            3,
        )
        .unwrap();

    let json = serde_json::to_string(&ensemble.record_with_buffer()).unwrap();
    let record = serde_json::from_str(&json).unwrap();
    let mut restored = DynamicsEnsemble::new(small_dynamics(true), 3, 1, 0).unwrap();
    restored.load_record(&record).unwrap();
    assert_eq!(restored.initialize_missing(), 0);
    assert_eq!(restored.buffer_len(), ensemble.buffer_len());

    let selector = MemberSelector::Member(1);
    let a = ensemble
        .predict(batch.observations.view(), batch.actions.view(), &selector)
        .unwrap();
    let b = restored
        .predict(batch.observations.view(), batch.actions.view(), &selector)
        .unwrap();
    assert_eq!(a.next_observations, b.next_observations);
}
