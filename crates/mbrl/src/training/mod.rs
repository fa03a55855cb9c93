//! Training orchestration.
//!
//! Provides:
//! - `Trainer` - the model-based iteration loop
//! - `TrainerConfig` - run configuration with nested component settings
//! - `ExecutionContext` - the worker pool used for real rollouts

mod config;
mod context;
mod trainer;

pub use config::{AlgoConfig, PolicyConfig, TrainerConfig, TrainingMode};
pub use context::ExecutionContext;
pub use trainer::{Trainer, TrainerState};
