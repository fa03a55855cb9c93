//! Environment abstractions.
//!
//! Provides:
//! - `MbEnv` - the environment trait consumed by samplers and the trainer
//! - `NormalizedEnv` - action rescaling wrapper

mod traits;
mod wrappers;

pub use traits::{EnvInfo, MbEnv, StepResult};
pub use wrappers::NormalizedEnv;
