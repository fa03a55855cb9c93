//! Snapshot manager with retention modes.

use super::state::Snapshot;
use crate::{MbrlError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const LAST_FILE: &str = "params.json";
const ITR_PREFIX: &str = "itr_";

/// Which iterations keep a snapshot on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotMode {
    /// Overwrite a single `params.json` every iteration
    Last,
    /// Keep `itr_NNNNNN.json` for every iteration
    All,
    /// Keep `itr_NNNNNN.json` for every n-th iteration
    Gap(usize),
    /// Never write
    None,
}

/// Configuration for snapshot management.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Directory to write snapshots to; nothing is written without one
    pub dir: Option<PathBuf>,
    pub mode: SnapshotMode,
    /// Include the dynamics replay buffers (can be large)
    pub save_buffer: bool,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: None,
            mode: SnapshotMode::Last,
            save_buffer: false,
        }
    }
}

impl SnapshotConfig {
    /// Create a new config with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            ..Default::default()
        }
    }

    /// Set the retention mode.
    pub fn mode(mut self, mode: SnapshotMode) -> Self {
        self.mode = mode;
        self
    }

    /// Enable/disable replay buffer saving.
    pub fn save_buffer(mut self, enabled: bool) -> Self {
        self.save_buffer = enabled;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.mode == SnapshotMode::Gap(0) {
            return Err(MbrlError::ConfigError("snapshot gap must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Writes and loads per-iteration snapshots.
///
/// # Example
///
/// ```ignore
/// let config = SnapshotConfig::new("./runs/pendulum").mode(SnapshotMode::Gap(10));
/// let manager = SnapshotManager::new(config)?;
///
/// // In training loop:
/// if let Some(path) = manager.save(&snapshot)? {
///     tracing::info!(path = %path.display(), "Saved snapshot");
/// }
///
/// // To resume:
/// if let Some(snapshot) = manager.load_latest()? {
///     trainer.restore(&snapshot)?;
/// }
/// ```
pub struct SnapshotManager {
    config: SnapshotConfig,
}

impl SnapshotManager {
    pub fn new(config: SnapshotConfig) -> Result<Self> {
        config.validate()?;
        if let Some(dir) = &config.dir {
            if config.mode != SnapshotMode::None {
                fs::create_dir_all(dir)?;
            }
        }
        Ok(Self { config })
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    pub fn dir(&self) -> Option<&Path> {
        self.config.dir.as_deref()
    }

    /// Whether iteration `itr` produces a file
    pub fn should_save(&self, itr: usize) -> bool {
        if self.config.dir.is_none() {
            return false;
        }
        match self.config.mode {
            SnapshotMode::Last | SnapshotMode::All => true,
            SnapshotMode::Gap(n) => n > 0 && itr % n == 0,
            SnapshotMode::None => false,
        }
    }

    fn path_for(&self, dir: &Path, itr: usize) -> PathBuf {
        match self.config.mode {
            SnapshotMode::Last => dir.join(LAST_FILE),
            _ => dir.join(format!("{}{:06}.json", ITR_PREFIX, itr)),
        }
    }

    /// Write `snapshot` if the retention mode asks for it.
    ///
    /// Returns the path written, or None if nothing was saved.
    pub fn save(&self, snapshot: &Snapshot) -> Result<Option<PathBuf>> {
        let dir = match &self.config.dir {
            Some(dir) if self.should_save(snapshot.itr) => dir,
            _ => return Ok(None),
        };
        let path = self.path_for(dir, snapshot.itr);

        // write then rename, so a crash never leaves a truncated snapshot behind
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(snapshot)?)?;
        fs::rename(&tmp, &path)?;
        tracing::info!(path = %path.display(), itr = snapshot.itr, "Saved snapshot");
        Ok(Some(path))
    }

    /// Load a specific snapshot file.
    pub fn load(path: impl AsRef<Path>) -> Result<Snapshot> {
        let data = fs::read(path.as_ref())?;
        let snapshot: Snapshot = serde_json::from_slice(&data)?;
        tracing::info!(path = %path.as_ref().display(), itr = snapshot.itr, "Loaded snapshot");
        Ok(snapshot)
    }

    /// All per-iteration snapshot files, oldest first.
    pub fn list_snapshots(&self) -> Result<Vec<PathBuf>> {
        let dir = match &self.config.dir {
            Some(dir) => dir,
            None => return Ok(Vec::new()),
        };
        let entries = match fs::read_dir(dir) {
            Ok(e) => e,
            Err(_) => return Ok(Vec::new()),
        };

        let mut snapshots: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(ITR_PREFIX) && n.ends_with(".json"))
                    .unwrap_or(false)
            })
            .collect();

        snapshots.sort();
        Ok(snapshots)
    }

    /// Load the snapshot with the highest iteration in the directory.
    ///
    /// Returns None if the directory holds no snapshot.
    pub fn load_latest(&self) -> Result<Option<Snapshot>> {
        let mut candidates = Vec::new();
        if let Some(last) = self.list_snapshots()?.pop() {
            candidates.push(last);
        }
        if let Some(dir) = &self.config.dir {
            let params = dir.join(LAST_FILE);
            if params.exists() {
                candidates.push(params);
            }
        }

        let mut latest: Option<Snapshot> = None;
        for path in candidates {
            let snapshot = Self::load(&path)?;
            if latest.as_ref().map_or(true, |l| snapshot.itr > l.itr) {
                latest = Some(snapshot);
            }
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algos::AlgorithmRecord;
    use crate::checkpoint::EnvRecord;
    use crate::dynamics::EnsembleRecord;
    use crate::policy::PolicyRecord;
    use tempfile::tempdir;

    fn snapshot(itr: usize) -> Snapshot {
        Snapshot::new(
            itr,
            itr as u64 * 100,
            PolicyRecord::default(),
            EnsembleRecord::default(),
            AlgorithmRecord::default(),
            EnvRecord::default(),
        )
    }

    fn run(mode: SnapshotMode, dir: &Path) -> SnapshotManager {
        let manager = SnapshotManager::new(SnapshotConfig::new(dir).mode(mode)).unwrap();
        for itr in 0..5 {
            manager.save(&snapshot(itr)).unwrap();
        }
        manager
    }

    #[test]
    fn test_last_mode_keeps_single_file() {
        let dir = tempdir().unwrap();
        let manager = run(SnapshotMode::Last, dir.path());
        assert!(manager.list_snapshots().unwrap().is_empty());
        let latest = manager.load_latest().unwrap().unwrap();
        assert_eq!(latest.itr, 4);
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_all_mode_keeps_every_iteration() {
        let dir = tempdir().unwrap();
        let manager = run(SnapshotMode::All, dir.path());
        let files = manager.list_snapshots().unwrap();
        assert_eq!(files.len(), 5);
        assert!(files[0].to_string_lossy().contains("itr_000000"));
        assert_eq!(manager.load_latest().unwrap().unwrap().itr, 4);
    }

    #[test]
    fn test_gap_mode() {
        let dir = tempdir().unwrap();
        let manager = run(SnapshotMode::Gap(2), dir.path());
        let files = manager.list_snapshots().unwrap();
        assert_eq!(files.len(), 3);
        assert!(files[2].to_string_lossy().contains("itr_000004"));
    }

    #[test]
    fn test_none_mode_writes_nothing() {
        let dir = tempdir().unwrap();
        let manager = run(SnapshotMode::None, dir.path());
        assert!(manager.load_latest().unwrap().is_none());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_gap_zero_is_rejected() {
        let dir = tempdir().unwrap();
        let config = SnapshotConfig::new(dir.path()).mode(SnapshotMode::Gap(0));
        assert!(SnapshotManager::new(config).is_err());
    }

    #[test]
    fn test_mode_serialization() {
        let json = serde_json::to_string(&SnapshotMode::Gap(3)).unwrap();
        assert_eq!(json, r#"{"gap":3}"#);
        let mode: SnapshotMode = serde_json::from_str(r#""last""#).unwrap();
        assert_eq!(mode, SnapshotMode::Last);
    }
}
