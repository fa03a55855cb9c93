//! Trajectory collection and sample processing.
//!
//! Provides:
//! - `Sampler` - parallel rollouts against real environments
//! - `ModelSampler` - imagined rollouts through the dynamics ensemble
//! - `SampleProcessor` - trajectories to a `ProcessedBatch` with GAE advantages

mod model_sampler;
mod path;
mod processor;
mod sampler;

pub use model_sampler::{ImaginedSamplerConfig, MemberSelection, ModelSampler};
pub use path::{Path, Transition};
pub use processor::{return_stats, ProcessedBatch, ProcessorConfig, SampleProcessor};
pub use sampler::{Sampler, SamplerConfig, SamplingMode};
