//! Policy optimization algorithms.
//!
//! Provides:
//! - `Algorithm` - the contract the trainer drives
//! - `Ppo` - clipped surrogate with minibatch Adam
//! - `Trpo` - natural gradient step under a KL bound
//! - `SurrogateObjective` - the shared importance-sampled loss

mod objective;
mod ppo;
mod trpo;

pub use objective::{clipped_surrogate, SurrogateGrads, SurrogateKind, SurrogateObjective};
pub use ppo::{Ppo, PpoConfig};
pub use trpo::{Trpo, TrpoConfig};

use crate::policy::Policy;
use crate::samplers::ProcessedBatch;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Diagnostics of one `optimize` call
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OptimizationReport {
    pub loss_before: f64,
    pub loss_after: f64,
    /// Mean `KL(old || new)` over the batch after the update
    pub mean_kl: f64,
    /// Passes over the batch actually made
    pub epochs: usize,
}

/// Serializable optimizer state.
///
/// Adam moments are not part of it; a restored PPO starts from fresh moments.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AlgorithmRecord {
    pub name: String,
    /// Number of completed `optimize` calls
    #[serde(default)]
    pub updates: u64,
}

/// Trait for policy optimizers.
///
/// Implementations differ only in how they keep a single update from moving
/// the policy too far from the one that collected the batch.
pub trait Algorithm: Send {
    fn name(&self) -> &'static str;

    /// Surrogate loss over `batch`, anchored at the distributions recorded in it
    fn build_objective(
        &self,
        policy: &dyn Policy,
        batch: &ProcessedBatch,
    ) -> Result<SurrogateObjective>;

    /// Current surrogate loss over the whole batch
    fn loss(&self, policy: &dyn Policy, batch: &ProcessedBatch) -> Result<f64> {
        let objective = self.build_objective(policy, batch)?;
        objective.loss(policy, &objective.all_rows())
    }

    /// Update `policy` in place on `batch`
    fn optimize(
        &mut self,
        policy: &mut dyn Policy,
        batch: &ProcessedBatch,
    ) -> Result<OptimizationReport>;

    fn record(&self) -> AlgorithmRecord;

    fn load_record(&mut self, record: &AlgorithmRecord) -> Result<()>;
}
