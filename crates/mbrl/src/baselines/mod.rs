//! Value baselines for advantage estimation.
//!
//! Provides:
//! - `Baseline` trait fitted once per processed batch
//! - `ZeroBaseline` - predicts zero everywhere
//! - `LinearFeatureBaseline` - ridge regression on time and observation features

mod linear;

pub use linear::LinearFeatureBaseline;

use crate::samplers::Path;
use crate::Result;
use ndarray::Array1;

/// Trait for state-value estimators used by the sample processor.
pub trait Baseline: Send {
    /// Refit on paths and their discounted returns (one array per path).
    fn fit(&mut self, paths: &[Path], returns: &[Array1<f64>]) -> Result<()>;

    /// Value estimates for every step of `path`.
    fn predict(&self, path: &Path) -> Result<Array1<f64>>;

    fn name(&self) -> &'static str;
}

/// Baseline that always predicts zero
#[derive(Clone, Copy, Debug, Default)]
pub struct ZeroBaseline;

impl Baseline for ZeroBaseline {
    fn fit(&mut self, _paths: &[Path], _returns: &[Array1<f64>]) -> Result<()> {
        Ok(())
    }

    fn predict(&self, path: &Path) -> Result<Array1<f64>> {
        Ok(Array1::zeros(path.len()))
    }

    fn name(&self) -> &'static str {
        "zero"
    }
}
