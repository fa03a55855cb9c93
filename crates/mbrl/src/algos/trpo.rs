//! Trust Region Policy Optimization.

use super::{Algorithm, AlgorithmRecord, OptimizationReport, SurrogateKind, SurrogateObjective};
use crate::policy::Policy;
use crate::samplers::ProcessedBatch;
use crate::{MbrlError, Result};
use ndarray::{Array1, ArrayView1};
use serde::{Deserialize, Serialize};

/// TRPO settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrpoConfig {
    /// Bound on mean `KL(old || new)` per update
    pub step_size: f64,
    pub cg_iters: usize,
    /// Damping added to the Fisher-vector product
    pub reg_coeff: f64,
    pub backtrack_ratio: f64,
    pub max_backtracks: usize,
}

impl Default for TrpoConfig {
    fn default() -> Self {
        Self {
            step_size: 0.01,
            cg_iters: 10,
            reg_coeff: 1e-5,
            backtrack_ratio: 0.8,
            max_backtracks: 15,
        }
    }
}

impl TrpoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.step_size <= 0.0 || self.cg_iters == 0 {
            return Err(MbrlError::ConfigError(
                "trpo needs step_size and cg_iters > 0".to_string(),
            ));
        }
        if !(self.backtrack_ratio > 0.0 && self.backtrack_ratio < 1.0) {
            return Err(MbrlError::ConfigError(
                "backtrack_ratio must be in (0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Solve `A x = b` for symmetric positive definite `A` given as a product.
fn conjugate_gradient<F>(mut apply: F, b: ArrayView1<f64>, iters: usize) -> Result<Array1<f64>>
where
    F: FnMut(ArrayView1<f64>) -> Result<Array1<f64>>,
{
    let mut x = Array1::zeros(b.len());
    let mut r = b.to_owned();
    let mut p = b.to_owned();
    let mut rr = r.dot(&r);
    for _ in 0..iters {
        if rr < 1e-10 {
            break;
        }
        let ap = apply(p.view())?;
        let alpha = rr / p.dot(&ap);
        x.scaled_add(alpha, &p);
        r.scaled_add(-alpha, &ap);
        let rr_next = r.dot(&r);
        p = &r + &(p * (rr_next / rr));
        rr = rr_next;
    }
    Ok(x)
}

/// KL-constrained natural gradient step with backtracking line search
pub struct Trpo {
    config: TrpoConfig,
    updates: u64,
}

impl Trpo {
    pub fn new(config: TrpoConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, updates: 0 })
    }

    pub fn config(&self) -> &TrpoConfig {
        &self.config
    }
}

impl Algorithm for Trpo {
    fn name(&self) -> &'static str {
        "trpo"
    }

    fn build_objective(
        &self,
        policy: &dyn Policy,
        batch: &ProcessedBatch,
    ) -> Result<SurrogateObjective> {
        SurrogateObjective::build(policy, batch, SurrogateKind::LikelihoodRatio, 0.0)
    }

    fn optimize(
        &mut self,
        policy: &mut dyn Policy,
        batch: &ProcessedBatch,
    ) -> Result<OptimizationReport> {
        let objective = self.build_objective(&*policy, batch)?;
        let rows = objective.all_rows();
        let (loss_before, grad) = objective.loss_and_grad(&*policy, &rows)?;
        let old_params = policy.param_values();
        self.updates += 1;

        if grad.dot(&grad) < 1e-20 {
            return Ok(OptimizationReport {
                loss_before,
                loss_after: loss_before,
                mean_kl: 0.0,
                epochs: 1,
            });
        }

        let reg = self.config.reg_coeff;
        let direction = conjugate_gradient(
            |v| objective.fisher_vector_product(&*policy, &rows, v, reg),
            grad.view(),
            self.config.cg_iters,
        )?;
        let curvature = direction.dot(&objective.fisher_vector_product(
            &*policy,
            &rows,
            direction.view(),
            reg,
        )?);
        let scale = (2.0 * self.config.step_size / (curvature + 1e-8)).sqrt();
        let full_step = direction * scale;

        let mut accepted = None;
        for k in 0..self.config.max_backtracks {
            let ratio = self.config.backtrack_ratio.powi(k as i32);
            let candidate = &old_params - &(&full_step * ratio);
            policy.set_param_values(candidate.view())?;
            let loss = match objective.loss(&*policy, &rows) {
                Ok(loss) => loss,
                Err(MbrlError::NumericalError(_)) => continue,
                Err(e) => return Err(e),
            };
            let kl = objective.mean_kl(&*policy, &rows)?;
            if loss < loss_before && kl <= self.config.step_size {
                accepted = Some((loss, kl, k));
                break;
            }
        }

        let (loss_after, mean_kl) = match accepted {
            Some((loss, kl, backtracks)) => {
                tracing::debug!(loss_before, loss_after = loss, kl, backtracks, "TRPO step accepted");
                (loss, kl)
            }
            None => {
                tracing::warn!(
                    loss_before,
                    "TRPO line search found no improving step within the KL bound, keeping old parameters"
                );
                policy.set_param_values(old_params.view())?;
                (loss_before, 0.0)
            }
        };

        Ok(OptimizationReport {
            loss_before,
            loss_after,
            mean_kl,
            epochs: 1,
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
                "cannot restore {} state into trpo",
                record.name
            )));
        }
        self.updates = record.updates;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algos::objective::synthetic_batch;
    use crate::policy::GaussianMlpPolicy;
    use ndarray::array;

    #[test]
    fn test_conjugate_gradient_solves_spd_system() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![1.0, 2.0];
        let x = conjugate_gradient(|v| Ok(a.dot(&v)), b.view(), 10).unwrap();
        let residual = a.dot(&x) - &b;
        assert!(residual.dot(&residual).sqrt() < 1e-8);
    }

    #[test]
    fn test_step_respects_kl_bound() {
        let mut policy = GaussianMlpPolicy::new(3, 1, &[16], 1.0, 0);
        let batch = synthetic_batch(&policy, 64, 7);
        let mut trpo = Trpo::new(TrpoConfig::default()).unwrap();
        let report = trpo.optimize(&mut policy, &batch).unwrap();
        assert!(report.mean_kl <= 0.01 + 1e-12);
        assert!(report.loss_after <= report.loss_before);
        assert!(report.mean_kl > 0.0);
    }

    #[test]
    fn test_rejected_step_restores_parameters() {
        let mut policy = GaussianMlpPolicy::new(3, 1, &[16], 1.0, 0);
        let batch = synthetic_batch(&policy, 64, 7);
        let before = policy.param_values();
        // no line-search candidates means no step can be accepted
        let mut trpo = Trpo::new(TrpoConfig {
            max_backtracks: 0,
            ..Default::default()
        })
        .unwrap();
        let report = trpo.optimize(&mut policy, &batch).unwrap();
        assert_eq!(policy.param_values(), before);
        assert_eq!(report.loss_after, report.loss_before);
    }
}
