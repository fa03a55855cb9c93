//! Box (continuous) observation/action space

use super::Space;
use ndarray::{Array1, ArrayView1, Zip};
use rand::Rng;

/// Box space for continuous values with bounds
#[derive(Clone, Debug, PartialEq)]
pub struct Box {
    /// Lower bound for each element
    pub low: Array1<f64>,
    /// Upper bound for each element
    pub high: Array1<f64>,
    shape: [usize; 1],
}

impl Box {
    /// Create a new box space with given bounds.
    ///
    /// Returns `None` when the bounds differ in length or `low > high` anywhere.
    pub fn new(low: Array1<f64>, high: Array1<f64>) -> Option<Self> {
        if low.len() != high.len() || low.iter().zip(high.iter()).any(|(l, h)| l > h) {
            return None;
        }
        let shape = [low.len()];
        Some(Self { low, high, shape })
    }

    /// Create a box space with uniform bounds
    pub fn uniform(dim: usize, low: f64, high: f64) -> Self {
        let (low, high) = if low <= high { (low, high) } else { (high, low) };
        Self {
            low: Array1::from_elem(dim, low),
            high: Array1::from_elem(dim, high),
            shape: [dim],
        }
    }

    /// Create a box space from -inf to +inf (unbounded)
    pub fn unbounded(dim: usize) -> Self {
        Self::uniform(dim, f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Create a symmetric box [-1, 1] for all elements
    pub fn symmetric(dim: usize) -> Self {
        Self::uniform(dim, -1.0, 1.0)
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.shape[0]
    }

    /// Whether every dimension has finite bounds.
    pub fn is_bounded(&self) -> bool {
        self.low.iter().chain(self.high.iter()).all(|v| v.is_finite())
    }

    /// Clip a value into the box.
    pub fn clip(&self, value: ArrayView1<f64>) -> Array1<f64> {
        let mut out = value.to_owned();
        Zip::from(&mut out)
            .and(&self.low)
            .and(&self.high)
            .for_each(|v, &l, &h| *v = v.clamp(l, h));
        out
    }
}

impl Space for Box {
    type Sample = Array1<f64>;

    /// Unbounded dimensions are sampled from [-1, 1].
    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Self::Sample {
        let mut result = Array1::zeros(self.dim());
        Zip::from(&mut result)
            .and(&self.low)
            .and(&self.high)
            .for_each(|r, &l, &h| {
                let (l, h) = if l.is_finite() && h.is_finite() {
                    (l, h)
                } else {
                    (-1.0, 1.0)
                };
                *r = if h > l { rng.gen_range(l..h) } else { l };
            });
        result
    }

    fn contains(&self, value: &Self::Sample) -> bool {
        if value.len() != self.dim() {
            return false;
        }
        value
            .iter()
            .zip(self.low.iter())
            .zip(self.high.iter())
            .all(|((&v, &l), &h)| v >= l && v <= h)
    }

    fn shape(&self) -> &[usize] {
        &self.shape
    }
}
