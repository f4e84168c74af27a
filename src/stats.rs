//! Statistical helpers for sky residual analysis and QA metrics

use scilib::math::basic::erf;
use std::f64::consts::SQRT_2;

/// Cumulative distribution function for the standard normal distribution
#[must_use]
pub fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / SQRT_2))
}

/// Upper tail probability of a chi-square variate with `dof` degrees of
/// freedom, via the Wilson-Hilferty cube-root normal approximation.
///
/// Accurate to a few 1e-3 for dof >= 3, which is ample for thresholding
/// sky-fiber fit quality at p < 0.05.
#[must_use]
pub fn chi2_sf(chi2: f64, dof: usize) -> f64 {
    if dof == 0 {
        return f64::NAN;
    }
    if chi2 <= 0.0 {
        return 1.0;
    }
    let k = dof as f64;
    let z = ((chi2 / k).cbrt() - (1.0 - 2.0 / (9.0 * k))) / (2.0 / (9.0 * k)).sqrt();
    1.0 - normal_cdf(z)
}

/// Median of a slice, ignoring NaN values.
///
/// Returns None if no finite-or-infinite value remains.
#[must_use]
pub fn median(values: &[f64]) -> Option<f64> {
    let mut valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = valid.len() / 2;
    Some(if valid.len() % 2 == 0 {
        (valid[mid - 1] + valid[mid]) / 2.0
    } else {
        valid[mid]
    })
}

/// Percentile (0..=100) by linear interpolation between order statistics.
#[must_use]
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    let mut valid: Vec<f64> = values.iter().filter(|v| !v.is_nan()).copied().collect();
    if valid.is_empty() {
        return None;
    }
    valid.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = (pct / 100.0).clamp(0.0, 1.0) * (valid.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    if lo == hi {
        return Some(valid[lo]);
    }
    let frac = rank - lo as f64;
    Some(valid[lo] * (1.0 - frac) + valid[hi] * frac)
}

/// Mean and standard deviation (population) of a slice.
#[must_use]
pub fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

/// Inverse-variance weighted mean. Weights <= 0 are skipped.
///
/// Returns the mean and the summed weight (zero when nothing contributed).
#[must_use]
pub fn weighted_mean(values: &[f64], weights: &[f64]) -> (f64, f64) {
    let mut num = 0.0;
    let mut den = 0.0;
    for (&v, &w) in values.iter().zip(weights) {
        if w > 0.0 {
            num += w * v;
            den += w;
        }
    }
    if den > 0.0 {
        (num / den, den)
    } else {
        (0.0, 0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normal_cdf_known_points() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((normal_cdf(1.0) - 0.841_344_746_1).abs() < 1e-6);
        assert!((normal_cdf(-1.96) - 0.025).abs() < 1e-3);
    }

    #[test]
    fn test_chi2_sf_matches_tables() {
        // chi2 = dof sits near the distribution bulk
        let p = chi2_sf(10.0, 10);
        assert!(p > 0.35 && p < 0.55, "p = {p}");
        // 95th percentile of chi2(10) is 18.31
        let p = chi2_sf(18.31, 10);
        assert!((p - 0.05).abs() < 0.005, "p = {p}");
        // far tail
        assert!(chi2_sf(100.0, 10) < 1e-6);
    }

    #[test]
    fn test_chi2_sf_edge_cases() {
        assert!(chi2_sf(5.0, 0).is_nan());
        assert!((chi2_sf(0.0, 5) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_median_odd_even() {
        assert_eq!(median(&[1.0, 3.0, 2.0, 5.0, 4.0]), Some(3.0));
        assert_eq!(median(&[1.0, 2.0, 3.0, 4.0]), Some(2.5));
    }

    #[test]
    fn test_median_nan_filtering() {
        assert_eq!(median(&[1.0, f64::NAN, 3.0, 2.0]), Some(2.0));
        assert_eq!(median(&[f64::NAN, f64::NAN]), None);
        assert_eq!(median(&[]), None);
    }

    #[test]
    fn test_percentile_interpolation() {
        let v = [0.0, 1.0, 2.0, 3.0, 4.0];
        assert_eq!(percentile(&v, 0.0), Some(0.0));
        assert_eq!(percentile(&v, 100.0), Some(4.0));
        assert_eq!(percentile(&v, 50.0), Some(2.0));
        assert_eq!(percentile(&v, 62.5), Some(2.5));
    }

    #[test]
    fn test_weighted_mean_skips_nonpositive_weights() {
        let (m, w) = weighted_mean(&[1.0, 100.0, 3.0], &[1.0, 0.0, 1.0]);
        assert!((m - 2.0).abs() < f64::EPSILON);
        assert!((w - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_weighted_mean_all_zero() {
        let (m, w) = weighted_mean(&[1.0, 2.0], &[0.0, -1.0]);
        assert_eq!(m, 0.0);
        assert_eq!(w, 0.0);
    }

    #[test]
    fn test_mean_std() {
        let (m, s) = mean_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]);
        assert!((m - 5.0).abs() < 1e-12);
        assert!((s - 2.0).abs() < 1e-12);
    }
}
