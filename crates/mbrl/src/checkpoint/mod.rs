//! Snapshotting for resumable training.
//!
//! Provides:
//! - `Checkpointable` trait for components with an explicit record/restore contract
//! - `Snapshot` for the complete per-iteration training state
//! - `SnapshotManager` for writing, retaining and loading snapshots

mod manager;
mod state;

pub use manager::{SnapshotConfig, SnapshotManager, SnapshotMode};
pub use state::{Checkpointable, EnvRecord, Snapshot};
