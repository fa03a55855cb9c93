//! CSV logging backend.

use super::MetricLogger;
use crate::Result;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

struct CsvState {
    writer: csv::Writer<File>,
    columns: Option<Vec<String>>,
    warned: bool,
}

/// Appends one row per iteration to a CSV file.
///
/// The column set is fixed by the first row written; later keys that were not
/// present then are dropped (with a single warning), missing ones are left blank.
pub struct CsvLogger {
    path: PathBuf,
    state: Mutex<CsvState>,
}

impl CsvLogger {
    /// Create (or truncate) `progress.csv` in `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(dir.as_ref())?;
        Self::with_path(dir.as_ref().join("progress.csv"))
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let writer = csv::Writer::from_path(&path)?;
        Ok(Self {
            path,
            state: Mutex::new(CsvState {
                writer,
                columns: None,
                warned: false,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write_row(state: &mut CsvState, metrics: &BTreeMap<String, f64>) -> csv::Result<()> {
        if state.columns.is_none() {
            let columns: Vec<String> = metrics.keys().cloned().collect();
            state.writer.write_record(&columns)?;
            state.columns = Some(columns);
        }
        let columns = state.columns.as_deref().unwrap_or(&[]);
        if !state.warned && metrics.keys().any(|k| !columns.contains(k)) {
            tracing::warn!("dropping metrics not present in the first progress row");
            state.warned = true;
        }
        let row = columns
            .iter()
            .map(|c| metrics.get(c).map(|v| v.to_string()).unwrap_or_default());
        state.writer.write_record(row)?;
        state.writer.flush()?;
        Ok(())
    }
}

impl MetricLogger for CsvLogger {
    fn log_scalar(&self, name: &str, value: f64, step: u64) {
        let mut metrics = BTreeMap::new();
        metrics.insert("Itr".to_string(), step as f64);
        metrics.insert(name.to_string(), value);
        self.log_metrics(&metrics, step);
    }

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, _step: u64) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = Self::write_row(&mut state, metrics) {
            tracing::warn!(path = %self.path.display(), "Failed to write progress row: {}", e);
        }
    }

    fn close(&self) {
        if let Ok(mut state) = self.state.lock() {
            let _ = state.writer.flush();
        }
    }
}
