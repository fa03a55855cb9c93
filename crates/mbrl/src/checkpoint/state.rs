//! Snapshot state and the record/restore contract.

use crate::algos::AlgorithmRecord;
use crate::dynamics::EnsembleRecord;
use crate::policy::PolicyRecord;
use crate::Result;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Trait for components that can be snapshotted.
///
/// A component hands out a plain structured record of everything needed to
/// rebuild its state, and restores itself from one.
///
/// # Example
///
/// ```ignore
/// impl Checkpointable for MyComponent {
///     type Record = MyRecord;
///
///     fn record(&self) -> MyRecord {
///         MyRecord { weights: self.weights.to_vec() }
///     }
///
///     fn load_record(&mut self, record: &MyRecord) -> Result<()> {
///         self.weights = Array1::from(record.weights.clone());
///         Ok(())
///     }
/// }
/// ```
pub trait Checkpointable {
    type Record: Serialize + DeserializeOwned;

    /// Capture the component's state.
    fn record(&self) -> Self::Record;

    /// Restore the component's state.
    fn load_record(&mut self, record: &Self::Record) -> Result<()>;
}

/// Reference to the environment a run was trained on
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct EnvRecord {
    pub name: String,
    pub obs_dim: usize,
    pub action_dim: usize,
}

/// Complete training state after one iteration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Snapshot {
    /// Iteration that produced this snapshot
    pub itr: usize,
    /// Real environment steps sampled so far
    pub total_timesteps: u64,
    pub policy: PolicyRecord,
    pub dynamics: EnsembleRecord,
    pub algorithm: AlgorithmRecord,
    pub env: EnvRecord,
    /// Seconds since the Unix epoch
    pub timestamp: String,
    /// mbrl version
    pub version: String,
}

impl Snapshot {
    pub fn new(
        itr: usize,
        total_timesteps: u64,
        policy: PolicyRecord,
        dynamics: EnsembleRecord,
        algorithm: AlgorithmRecord,
        env: EnvRecord,
    ) -> Self {
        Self {
            itr,
            total_timesteps,
            policy,
            dynamics,
            algorithm,
            env,
            timestamp: unix_timestamp(),
            version: crate::VERSION.to_string(),
        }
    }

    /// Iteration a resumed run should start at
    pub fn next_itr(&self) -> usize {
        self.itr + 1
    }
}

fn unix_timestamp() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}", duration.as_secs())
}
