//! Calibration Math
//!
//! Pure numerical helpers that reduce raw sample series to calibration verdicts:
//!
//! - [`fit`]: ordinary least squares line with R² and residual statistics
//! - [`gain_error_percent`]: deviation of a fitted slope from an expected slope
//! - [`adjustment_factor`]: multiplicative correction that maps the actual gain onto the
//!   expected one
//! - [`within_tolerance`]: inclusive tolerance comparison shared by every procedure
//!
//! Nothing here touches hardware or holds state. A [`CalibrationFit`] is a value: when the input
//! series changes, a new fit is computed.

use crate::error::{EolError, EolResult};
use serde::{Deserialize, Serialize};

/// Denominators smaller than this are treated as zero.
///
/// For the fit this is relative: the spread of `x` must exceed `EPSILON` times its scale.
pub const EPSILON: f64 = 1e-12;

/// Result of a least squares fit `y = slope * x + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationFit {
    /// Fitted slope (the measured gain)
    pub slope: f64,
    /// Fitted intercept (the measured offset)
    pub intercept: f64,
    /// Coefficient of determination; 1.0 for a perfect or constant fit
    pub r_squared: f64,
    /// Mean absolute residual
    pub mean_error: f64,
    /// Largest absolute residual
    pub max_error: f64,
    /// Mean squared residual
    pub mse: f64,
    /// Number of (x, y) pairs used
    pub sample_count: usize,
}

impl CalibrationFit {
    /// Evaluate the fitted line at `x`.
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Fit a straight line through `(xs[i], ys[i])` by ordinary least squares.
///
/// # Errors
///
/// - `InvalidInput` if the series differ in length or contain non-finite values
/// - `DegenerateData` if the series are empty or all `x` values coincide
///   (`Σ(x − x̄)² <= EPSILON · Σx²`)
pub fn fit(xs: &[f64], ys: &[f64]) -> EolResult<CalibrationFit> {
    if xs.len() != ys.len() {
        return Err(EolError::InvalidInput(format!(
            "x/y series length mismatch: {} vs {}",
            xs.len(),
            ys.len()
        )));
    }
    if xs.is_empty() {
        return Err(EolError::DegenerateData("no samples to fit".into()));
    }
    if xs.iter().chain(ys.iter()).any(|v| !v.is_finite()) {
        return Err(EolError::InvalidInput(
            "calibration series contain non-finite values".into(),
        ));
    }

    let n = xs.len() as f64;
    let mean_x = xs.iter().sum::<f64>() / n;
    let mean_y = ys.iter().sum::<f64>() / n;
    let sum_xx: f64 = xs.iter().map(|x| x * x).sum();
    let sxx: f64 = xs.iter().map(|x| (x - mean_x) * (x - mean_x)).sum();
    let sxy: f64 = xs
        .iter()
        .zip(ys)
        .map(|(x, y)| (x - mean_x) * (y - mean_y))
        .sum();

    // Centred: nΣx² − (Σx)² leaves rounding residue when x repeats a non-integer value.
    if sxx <= EPSILON * sum_xx {
        return Err(EolError::DegenerateData(format!(
            "{} sample(s) with no spread in x; slope is undefined",
            xs.len()
        )));
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let mut ss_res = 0.0;
    let mut ss_tot = 0.0;
    let mut abs_sum = 0.0;
    let mut max_error: f64 = 0.0;
    for (x, y) in xs.iter().zip(ys) {
        let residual = y - (slope * x + intercept);
        ss_res += residual * residual;
        ss_tot += (y - mean_y) * (y - mean_y);
        abs_sum += residual.abs();
        max_error = max_error.max(residual.abs());
    }

    let r_squared = if ss_tot.abs() < EPSILON {
        1.0
    } else {
        1.0 - ss_res / ss_tot
    };

    Ok(CalibrationFit {
        slope,
        intercept,
        r_squared,
        mean_error: abs_sum / n,
        max_error,
        mse: ss_res / n,
        sample_count: xs.len(),
    })
}

/// Gain error in percent: `(actual − expected) / expected × 100`.
///
/// Returns `None` (unavailable, not zero) when `expected` is near zero.
pub fn gain_error_percent(actual_gain: f64, expected_gain: f64) -> Option<f64> {
    if expected_gain.abs() < EPSILON || !actual_gain.is_finite() {
        return None;
    }
    Some((actual_gain - expected_gain) / expected_gain * 100.0)
}

/// Multiplicative adjustment `expected / actual` that corrects `actual` onto `expected`.
///
/// Returns `None` when `actual` is near zero.
pub fn adjustment_factor(expected_gain: f64, actual_gain: f64) -> Option<f64> {
    if actual_gain.abs() < EPSILON || !expected_gain.is_finite() {
        return None;
    }
    Some(expected_gain / actual_gain)
}

/// Inclusive tolerance check: `|deviation| <= tolerance`.
pub fn within_tolerance(deviation: f64, tolerance: f64) -> bool {
    deviation.is_finite() && deviation.abs() <= tolerance
}

/// Mean of the finite values in `values`; `None` if there are none.
///
/// NaN and infinite readings are excluded rather than counted as zero.
pub fn finite_mean(values: &[f64]) -> Option<f64> {
    let (sum, count) = values
        .iter()
        .filter(|v| v.is_finite())
        .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    (count > 0).then(|| sum / count as f64)
}
