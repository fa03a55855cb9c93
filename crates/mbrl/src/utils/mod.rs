//! Utility functions.

use crate::{MbrlError, Result};
use nalgebra::{DMatrix, DVector};
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};

/// Abbreviate large numbers for display
pub fn abbreviate(num: u64) -> String {
    if num < 1_000 {
        format!("{}", num)
    } else if num < 1_000_000 {
        format!("{:.1}K", num as f64 / 1_000.0)
    } else if num < 1_000_000_000 {
        format!("{:.1}M", num as f64 / 1_000_000.0)
    } else {
        format!("{:.1}B", num as f64 / 1_000_000_000.0)
    }
}

/// Format duration in human-readable form
pub fn format_duration(seconds: f64) -> String {
    if seconds < 0.0 {
        return "0s".to_string();
    }

    let secs = seconds as u64;
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;

    if h > 0 {
        format!("{}h {}m {}s", h, m, s)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Reverse discounted cumulative sum: `y[t] = x[t] + discount * y[t + 1]`.
pub fn discount_cumsum(x: ArrayView1<f64>, discount: f64) -> Array1<f64> {
    let mut out = Array1::zeros(x.len());
    let mut running = 0.0;
    for t in (0..x.len()).rev() {
        running = x[t] + discount * running;
        out[t] = running;
    }
    out
}

/// Fraction of the variance of `y` explained by `y_pred`.
///
/// Returns NaN when `y` has zero variance.
pub fn explained_variance(y_pred: ArrayView1<f64>, y: ArrayView1<f64>) -> f64 {
    let (_, std_y) = mean_std(y);
    let var_y = std_y * std_y;
    if var_y < 1e-12 {
        return f64::NAN;
    }
    let residual = &y - &y_pred;
    let (_, std_res) = mean_std(residual.view());
    1.0 - std_res * std_res / var_y
}

/// Mean and population standard deviation. Empty input yields `(0, 0)`.
pub fn mean_std(x: ArrayView1<f64>) -> (f64, f64) {
    if x.is_empty() {
        return (0.0, 0.0);
    }
    let mean = x.sum() / x.len() as f64;
    let var = x.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / x.len() as f64;
    (mean, var.sqrt())
}

/// Stack equally sized rows into a matrix.
///
/// `width` is used when `rows` is empty so the result keeps its column count.
pub fn stack_rows<'a, I>(rows: I, width: usize) -> Result<Array2<f64>>
where
    I: IntoIterator<Item = ArrayView1<'a, f64>>,
{
    let mut data = Vec::new();
    let mut n = 0;
    for row in rows {
        if row.len() != width {
            return Err(MbrlError::ShapeMismatch {
                expected: vec![width],
                actual: vec![row.len()],
            });
        }
        data.extend(row.iter().copied());
        n += 1;
    }
    Array2::from_shape_vec((n, width), data).map_err(|e| MbrlError::NumericalError(e.to_string()))
}

/// Solve `a x = b` for a symmetric positive definite `a` via Cholesky.
pub fn solve_spd(a: ArrayView2<f64>, b: ArrayView1<f64>) -> Result<Array1<f64>> {
    let n = a.nrows();
    if a.ncols() != n || b.len() != n {
        return Err(MbrlError::ShapeMismatch {
            expected: vec![n, n],
            actual: vec![a.ncols(), b.len()],
        });
    }
    let matrix = DMatrix::from_row_iterator(n, n, a.iter().copied());
    let rhs = DVector::from_iterator(n, b.iter().copied());
    let cholesky = matrix.cholesky().ok_or_else(|| {
        MbrlError::NumericalError("matrix is not positive definite".to_string())
    })?;
    let x = cholesky.solve(&rhs);
    if x.iter().any(|v| !v.is_finite()) {
        return Err(MbrlError::NumericalError(
            "non-finite solution of linear system".to_string(),
        ));
    }
    Ok(x.iter().copied().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn test_abbreviate() {
        assert_eq!(abbreviate(500), "500");
        assert_eq!(abbreviate(1500), "1.5K");
        assert_eq!(abbreviate(1_500_000), "1.5M");
        assert_eq!(abbreviate(1_500_000_000), "1.5B");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m 1s");
    }

    #[test]
    fn test_discount_cumsum() {
        let x = array![1.0, 1.0, 1.0];
        assert_eq!(discount_cumsum(x.view(), 1.0), array![3.0, 2.0, 1.0]);
        let y = discount_cumsum(x.view(), 0.5);
        assert!((y[0] - 1.75).abs() < 1e-12);
        assert!((y[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_explained_variance() {
        let y = array![1.0, 2.0, 3.0];
        assert!((explained_variance(y.view(), y.view()) - 1.0).abs() < 1e-12);
        let zeros = Array1::zeros(3);
        assert!(explained_variance(zeros.view(), y.view()) < 1e-12);
        assert!(explained_variance(y.view(), array![1.0, 1.0, 1.0].view()).is_nan());
    }

    #[test]
    fn test_solve_spd() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![1.0, 2.0];
        let x = solve_spd(a.view(), b.view()).unwrap();
        let residual = a.dot(&x) - &b;
        assert!(residual.iter().all(|r| r.abs() < 1e-10));

        let not_pd = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(solve_spd(not_pd.view(), b.view()).is_err());
        assert!(matches!(
            solve_spd(a.view(), array![1.0].view()),
            Err(MbrlError::ShapeMismatch { .. })
        ));

        // transposed storage still reads in logical order
        let t = array![[4.0, 1.0], [1.0, 3.0]].reversed_axes();
        let xt = solve_spd(t.view(), b.view()).unwrap();
        assert!((&xt - &x).iter().all(|d| d.abs() < 1e-12));
    }

    #[test]
    fn test_stack_rows_checks_width() {
        let a = array![1.0, 2.0];
        let b = array![3.0];
        assert!(stack_rows([a.view(), b.view()], 2).is_err());
        let m = stack_rows([a.view(), a.view()], 2).unwrap();
        assert_eq!(m.dim(), (2, 2));
        let empty = stack_rows(std::iter::empty(), 3).unwrap();
        assert_eq!(empty.dim(), (0, 3));
    }
}
