//! Linear feature baseline.

use super::Baseline;
use crate::samplers::Path;
use crate::utils::solve_spd;
use crate::{MbrlError, Result};
use ndarray::{s, Array1, Array2};

/// Ridge regression of returns on observation and time features.
///
/// Features per step: clipped observation, its square, `t/100` with its
/// powers up to three, and a constant. The regularizer is raised tenfold on
/// failure, up to five times.
#[derive(Clone, Debug)]
pub struct LinearFeatureBaseline {
    pub reg_coeff: f64,
    coeffs: Option<Array1<f64>>,
}

impl Default for LinearFeatureBaseline {
    fn default() -> Self {
        Self::new(1e-5)
    }
}

impl LinearFeatureBaseline {
    pub fn new(reg_coeff: f64) -> Self {
        Self {
            reg_coeff,
            coeffs: None,
        }
    }

    pub fn coefficients(&self) -> Option<&Array1<f64>> {
        self.coeffs.as_ref()
    }

    fn features(path: &Path) -> Array2<f64> {
        let obs = path.observations().mapv(|v| v.clamp(-10.0, 10.0));
        let (n, d) = obs.dim();
        let mut feats = Array2::zeros((n, 2 * d + 4));
        feats.slice_mut(s![.., ..d]).assign(&obs);
        feats.slice_mut(s![.., d..2 * d]).assign(&obs.mapv(|v| v * v));
        for t in 0..n {
            let al = t as f64 / 100.0;
            feats[[t, 2 * d]] = al;
            feats[[t, 2 * d + 1]] = al * al;
            feats[[t, 2 * d + 2]] = al * al * al;
            feats[[t, 2 * d + 3]] = 1.0;
        }
        feats
    }
}

impl Baseline for LinearFeatureBaseline {
    fn fit(&mut self, paths: &[Path], returns: &[Array1<f64>]) -> Result<()> {
        if paths.len() != returns.len() {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![paths.len()],
                actual: vec![returns.len()],
            });
        }
        let Some(first) = paths.iter().find(|p| !p.is_empty()) else {
            return Ok(());
        };
        let n_feats = 2 * first.obs_dim() + 4;

        let mut gram = Array2::<f64>::zeros((n_feats, n_feats));
        let mut rhs = Array1::<f64>::zeros(n_feats);
        for (path, ret) in paths.iter().zip(returns) {
            let feats = Self::features(path);
            if feats.ncols() != n_feats || ret.len() != path.len() {
                return Err(MbrlError::ShapeMismatch {
                    expected: vec![path.len(), n_feats],
                    actual: vec![ret.len(), feats.ncols()],
                });
            }
            gram = gram + feats.t().dot(&feats);
            rhs = rhs + feats.t().dot(ret);
        }

        let mut reg = self.reg_coeff;
        for _ in 0..5 {
            let mut a = gram.clone();
            for i in 0..n_feats {
                a[[i, i]] += reg;
            }
            match solve_spd(a.view(), rhs.view()) {
                Ok(c) if c.iter().all(|v| v.is_finite()) => {
                    self.coeffs = Some(c);
                    return Ok(());
                }
                _ => reg *= 10.0,
            }
        }
        Err(MbrlError::NumericalError(
            "linear baseline regression did not converge".to_string(),
        ))
    }

    fn predict(&self, path: &Path) -> Result<Array1<f64>> {
        match &self.coeffs {
            None => Ok(Array1::zeros(path.len())),
            Some(c) => {
                let feats = Self::features(path);
                if feats.ncols() != c.len() {
                    return Err(MbrlError::ShapeMismatch {
                        expected: vec![c.len()],
                        actual: vec![feats.ncols()],
                    });
                }
                Ok(feats.dot(c))
            }
        }
    }

    fn name(&self) -> &'static str {
        "linear_feature"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::samplers::Transition;
    use crate::utils::discount_cumsum;
    use ndarray::array;
    use std::collections::BTreeMap;

    fn path(len: usize) -> Path {
        (0..len)
            .map(|t| Transition {
                observation: array![t as f64 * 0.1],
                action: array![0.0],
                reward: 1.0,
                next_observation: array![(t + 1) as f64 * 0.1],
                terminal: false,
                agent_info: BTreeMap::new(),
            })
            .collect()
    }

    #[test]
    fn test_unfitted_predicts_zero() {
        let b = LinearFeatureBaseline::default();
        assert_eq!(b.predict(&path(3)).unwrap(), Array1::<f64>::zeros(3));
    }

    #[test]
    fn test_fits_time_to_go() {
        let paths = vec![path(20), path(20)];
        let returns: Vec<_> = paths
            .iter()
            .map(|p| discount_cumsum(p.rewards().view(), 1.0))
            .collect();
        let mut b = LinearFeatureBaseline::default();
        b.fit(&paths, &returns).unwrap();
        let pred = b.predict(&paths[0]).unwrap();
        for (p, r) in pred.iter().zip(returns[0].iter()) {
            assert!((p - r).abs() < 1e-2, "{} vs {}", p, r);
        }
    }
}
