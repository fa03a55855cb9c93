//! Proximal Policy Optimization.

use super::{Algorithm, AlgorithmRecord, OptimizationReport, SurrogateKind, SurrogateObjective};
use crate::nn::TrainingBackend;
use crate::optim::{adam, ModuleOptimizer};
use crate::policy::{GaussianHead, Policy};
use crate::samplers::ProcessedBatch;
use crate::{MbrlError, Result};
use burn::optim::GradientsParams;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

/// PPO settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PpoConfig {
    pub clip_eps: f64,
    pub learning_rate: f64,
    pub max_epochs: usize,
    pub num_minibatches: usize,
    pub entropy_bonus: f64,
    /// Clip on each parameter tensor's gradient norm
    pub max_grad_norm: Option<f64>,
    /// Stop early once an epoch improves the loss by less than this
    pub convergence_tol: Option<f64>,
    pub seed: u64,
}

impl Default for PpoConfig {
    fn default() -> Self {
        Self {
            clip_eps: 0.2,
            learning_rate: 1e-3,
            max_epochs: 5,
            num_minibatches: 1,
            entropy_bonus: 0.0,
            max_grad_norm: None,
            convergence_tol: None,
            seed: 0,
        }
    }
}

impl PpoConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.clip_eps > 0.0 && self.clip_eps < 1.0) {
            return Err(MbrlError::ConfigError("clip_eps must be in (0, 1)".to_string()));
        }
        if self.learning_rate <= 0.0 || self.max_epochs == 0 || self.num_minibatches == 0 {
            return Err(MbrlError::ConfigError(
                "ppo needs learning_rate, max_epochs and num_minibatches > 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Clipped-surrogate optimizer.
///
/// The Adam state persists across `optimize` calls as long as the policy's
/// parameters are only changed through this optimizer.
pub struct Ppo {
    config: PpoConfig,
    optimizer: Box<dyn ModuleOptimizer<GaussianHead<TrainingBackend>>>,
    updates: u64,
}

impl Ppo {
    pub fn new(config: PpoConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            optimizer: adam(config.max_grad_norm),
            config,
            updates: 0,
        })
    }

    pub fn config(&self) -> &PpoConfig {
        &self.config
    }
}

impl Algorithm for Ppo {
    fn name(&self) -> &'static str {
        "ppo"
    }

    fn build_objective(
        &self,
        policy: &dyn Policy,
        batch: &ProcessedBatch,
    ) -> Result<SurrogateObjective> {
        SurrogateObjective::build(
            policy,
            batch,
            SurrogateKind::Clipped {
                clip_eps: self.config.clip_eps,
            },
            self.config.entropy_bonus,
        )
    }

    fn optimize(
        &mut self,
        policy: &mut dyn Policy,
        batch: &ProcessedBatch,
    ) -> Result<OptimizationReport> {
        let objective = self.build_objective(&*policy, batch)?;
        let all_rows = objective.all_rows();
        let lr = self.config.learning_rate;

        let mut rng = ChaCha8Rng::seed_from_u64(self.config.seed);
        rng.set_stream(self.updates);

        let loss_before = objective.loss(&*policy, &all_rows)?;
        let mut head = policy.head().clone();
        let mut units: Vec<usize> = (0..objective.num_units()).collect();
        let num_minibatches = self.config.num_minibatches.min(units.len()).max(1);
        let mut previous = loss_before;
        let mut epochs = 0;

        for epoch in 0..self.config.max_epochs {
            units.shuffle(&mut rng);
            let per_batch = (units.len() + num_minibatches - 1) / num_minibatches;
            let mut epoch_loss = 0.0;
            for minibatch in units.chunks(per_batch) {
                let rows = objective.rows_for(minibatch);
                let (loss, grads) = match objective.backward(&head, &rows) {
                    Ok(step) => step,
                    Err(e) => {
                        policy.set_head(head);
                        return Err(e);
                    }
                };
                let grads = GradientsParams::from_grads(grads, &head);
                head = self.optimizer.step(lr, head, grads);
                epoch_loss += loss * rows.len() as f64;
            }
            epoch_loss /= all_rows.len() as f64;
            epochs = epoch + 1;
            tracing::debug!(epoch, loss = epoch_loss, "PPO epoch");

            if let Some(tol) = self.config.convergence_tol {
                if (previous - epoch_loss).abs() < tol {
                    break;
                }
            }
            previous = epoch_loss;
        }
        policy.set_head(head);

        let loss_after = objective.loss(&*policy, &all_rows)?;
        let mean_kl = objective.mean_kl(&*policy, &all_rows)?;
        self.updates += 1;
        tracing::debug!(loss_before, loss_after, mean_kl, epochs, "PPO update");
        Ok(OptimizationReport {
            loss_before,
            loss_after,
            mean_kl,
            epochs,
        })
    }

    fn record(&self) -> AlgorithmRecord {
        AlgorithmRecord {
            name: self.name().to_string(),
            updates: self.updates,
        }
    }

    fn load_record(&mut self, record: &AlgorithmRecord) -> Result<()> {
        if record.name != self.name() {
            return Err(MbrlError::ConfigError(format!(
                "cannot restore {} state into ppo",
                record.name
            )));
        }
        self.optimizer = adam(self.config.max_grad_norm);
        self.updates = record.updates;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algos::objective::synthetic_batch;
    use crate::policy::GaussianMlpPolicy;

    #[test]
    fn test_loss_decreases_on_fixed_batch() {
        let mut policy = GaussianMlpPolicy::new(3, 1, &[16], 1.0, 0);
        let batch = synthetic_batch(&policy, 64, 5);
        let mut ppo = Ppo::new(PpoConfig {
            learning_rate: 1e-2,
            max_epochs: 10,
            num_minibatches: 4,
            ..Default::default()
        })
        .unwrap();
        let report = ppo.optimize(&mut policy, &batch).unwrap();
        assert_eq!(report.epochs, 10);
        assert!(report.loss_after < report.loss_before);
        assert!(report.mean_kl > 0.0);
        assert!((ppo.loss(&policy, &batch).unwrap() - report.loss_after).abs() < 1e-12);
    }

    #[test]
    fn test_convergence_tol_stops_early() {
        let mut policy = GaussianMlpPolicy::new(3, 1, &[8], 1.0, 0);
        let batch = synthetic_batch(&policy, 32, 1);
        let mut ppo = Ppo::new(PpoConfig {
            max_epochs: 50,
            convergence_tol: Some(1e9),
            ..Default::default()
        })
        .unwrap();
        let report = ppo.optimize(&mut policy, &batch).unwrap();
        assert_eq!(report.epochs, 1);
    }

    #[test]
    fn test_record_restores_update_count() {
        let mut policy = GaussianMlpPolicy::new(3, 1, &[8], 1.0, 0);
        let batch = synthetic_batch(&policy, 32, 1);
        let mut ppo = Ppo::new(PpoConfig::default()).unwrap();
        ppo.optimize(&mut policy, &batch).unwrap();
        let record = ppo.record();
        assert_eq!(record.updates, 1);

        let mut restored = Ppo::new(PpoConfig::default()).unwrap();
        restored.load_record(&record).unwrap();
        assert_eq!(restored.record(), record);

        let mut wrong = record.clone();
        wrong.name = "trpo".to_string();
        assert!(restored.load_record(&wrong).is_err());
    }

    #[test]
    fn test_same_seed_and_update_count_reproduce_step() {
        let batch = synthetic_batch(&GaussianMlpPolicy::new(3, 1, &[8], 1.0, 0), 32, 2);
        let config = PpoConfig {
            num_minibatches: 4,
            max_grad_norm: Some(0.5),
            ..Default::default()
        };
        let mut a = GaussianMlpPolicy::new(3, 1, &[8], 1.0, 0);
        let mut b = a.clone();
        Ppo::new(config.clone()).unwrap().optimize(&mut a, &batch).unwrap();
        Ppo::new(config).unwrap().optimize(&mut b, &batch).unwrap();
        assert_eq!(a.param_values(), b.param_values());
    }
}
