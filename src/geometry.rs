// src/geometry.rs
//
// Numeric primitives for lane geometry inference.
//
// Coordinate convention:
//   - Sensor frame, meters. `y` runs along the road, `x` across it.
//   - Lane boundary curves use y as the independent variable:
//       x(y) = c2·y² + c1·y + c0
//     and are stored as [c2, c1, c0].
//
// Quartile feature points are fitted instead of raw trajectories: vehicles
// bunch up near the sensor, and five evenly ranked points keep that density
// imbalance from dominating the fit.

use crate::error::FitError;

pub type Point = (f64, f64);

/// Quadratic coefficients [c2, c1, c0] of x(y).
pub type Quadratic = [f64; 3];

/// Two along-lane values closer than this count as the same sample row.
const DISTINCT_EPS: f64 = 1e-9;

/// Pivot magnitude below which the normal equations are singular.
const SINGULAR_EPS: f64 = 1e-12;

// ============================================================================
// POINT-SET STATISTICS
// ============================================================================

/// Root-mean-square distance of the points to their centroid.
///
/// Only meaningful for ranking two point sets against each other.
pub fn dispersion(points: &[Point]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let n = points.len() as f64;
    let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
    let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
    let ss: f64 = points
        .iter()
        .map(|&(x, y)| (x - cx).powi(2) + (y - cy).powi(2))
        .sum();
    (ss / n).sqrt()
}

/// Min, Q1, median, Q3 and max of the points ranked by y.
///
/// Returns an empty vector for an empty input; with fewer than five points
/// some ranks repeat.
pub fn quartile_feature_points(points: &[Point]) -> Vec<Point> {
    if points.is_empty() {
        return Vec::new();
    }
    let mut sorted = points.to_vec();
    sorted.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

    let last = (sorted.len() - 1) as f64;
    [0.0, 0.25, 0.5, 0.75, 1.0]
        .iter()
        .map(|q| sorted[(q * last).round() as usize])
        .collect()
}

// ============================================================================
// POLYNOMIAL FITTING (Least Squares)
// ============================================================================

/// Unconstrained least-squares fit of x = c2·y² + c1·y + c0.
pub fn fit_quadratic(points: &[Point]) -> Result<Quadratic, FitError> {
    require_distinct(points, 3)?;

    let mut s = [0.0f64; 5]; // Σ y^k, k = 0..4
    let mut sx = [0.0f64; 3]; // Σ x·y^k, k = 0..2
    for &(x, y) in points {
        let mut yk = 1.0;
        for (k, acc) in s.iter_mut().enumerate() {
            *acc += yk;
            if k < 3 {
                sx[k] += x * yk;
            }
            yk *= y;
        }
    }

    //   | s4 s3 s2 | | c2 |   | sx2 |
    //   | s3 s2 s1 | | c1 | = | sx1 |
    //   | s2 s1 s0 | | c0 |   | sx0 |
    let (c2, c1, c0) = solve_3x3(
        [s[4], s[3], s[2], s[3], s[2], s[1], s[2], s[1], s[0]],
        [sx[2], sx[1], sx[0]],
    )
    .ok_or(FitError::Singular)?;

    Ok([c2, c1, c0])
}

/// Least-squares fit of c1 and c0 with the curvature c2 held fixed.
///
/// Lets every lane of a carriageway share the curvature of one reference
/// lane, which keeps sparse lanes from bending on their own.
pub fn fit_quadratic_frozen(points: &[Point], c2: f64) -> Result<Quadratic, FitError> {
    require_distinct(points, 2)?;

    // Residual after removing the frozen term is a straight line in y.
    let n = points.len() as f64;
    let mut sy = 0.0;
    let mut syy = 0.0;
    let mut sr = 0.0;
    let mut sry = 0.0;
    for &(x, y) in points {
        let r = x - c2 * y * y;
        sy += y;
        syy += y * y;
        sr += r;
        sry += r * y;
    }

    let det = n * syy - sy * sy;
    if det.abs() < SINGULAR_EPS {
        return Err(FitError::Singular);
    }
    let c1 = (n * sry - sy * sr) / det;
    let c0 = (sr - c1 * sy) / n;

    if c1.is_finite() && c0.is_finite() {
        Ok([c2, c1, c0])
    } else {
        Err(FitError::Singular)
    }
}

pub fn evaluate(coef: &Quadratic, y: f64) -> f64 {
    coef[0] * y * y + coef[1] * y + coef[2]
}

/// dx/dy of the curve at `y`.
pub fn slope(coef: &Quadratic, y: f64) -> f64 {
    2.0 * coef[0] * y + coef[1]
}

fn require_distinct(points: &[Point], required: usize) -> Result<(), FitError> {
    let mut ys: Vec<f64> = points.iter().map(|p| p.1).collect();
    ys.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    ys.dedup_by(|a, b| (*a - *b).abs() < DISTINCT_EPS);

    if ys.len() < required {
        return Err(FitError::InsufficientPoints {
            required,
            found: ys.len(),
        });
    }
    Ok(())
}

/// Solve a 3×3 linear system Ax = b using Gaussian elimination with partial pivoting.
/// Matrix is row-major: [a00, a01, a02, a10, a11, a12, a20, a21, a22].
/// Returns None if the system is singular.
fn solve_3x3(mat: [f64; 9], rhs: [f64; 3]) -> Option<(f64, f64, f64)> {
    let mut m = [
        [mat[0], mat[1], mat[2], rhs[0]],
        [mat[3], mat[4], mat[5], rhs[1]],
        [mat[6], mat[7], mat[8], rhs[2]],
    ];

    for col in 0..3 {
        let mut max_row = col;
        for row in (col + 1)..3 {
            if m[row][col].abs() > m[max_row][col].abs() {
                max_row = row;
            }
        }
        if m[max_row][col].abs() < SINGULAR_EPS {
            return None;
        }
        m.swap(col, max_row);

        for row in (col + 1)..3 {
            let factor = m[row][col] / m[col][col];
            for j in col..4 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let c = m[2][3] / m[2][2];
    let b = (m[1][3] - m[1][2] * c) / m[1][1];
    let a = (m[0][3] - m[0][2] * c - m[0][1] * b) / m[0][0];

    if a.is_finite() && b.is_finite() && c.is_finite() {
        Some((a, b, c))
    } else {
        None
    }
}

// ============================================================================
// AXIS PARTITION
// ============================================================================

/// Cut `[min, max]` into intervals of length `step`.
///
/// Returns `n + 1` cut points for `n = ceil((max - min) / step)` intervals
/// (at least one). The last interval is shortened so the final cut lands
/// exactly on `max`.
pub fn partition_axis(min: f64, max: f64, step: f64) -> Vec<f64> {
    let span = (max - min).max(0.0);
    let n = ((span / step).ceil() as usize).max(1);

    let mut cuts: Vec<f64> = (0..n).map(|i| min + i as f64 * step).collect();
    cuts.push(max.max(min));
    cuts
}

/// Index of the interval containing `value`: the number of cut points
/// `<= value`, minus one, clamped to the valid interval range.
pub fn interval_index(cuts: &[f64], value: f64) -> usize {
    let intervals = cuts.len().saturating_sub(1).max(1);
    let at_or_below = cuts.iter().filter(|&&c| c <= value).count();
    at_or_below.saturating_sub(1).min(intervals - 1)
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    #[test]
    fn test_fit_exact_parabola() {
        let pts: Vec<Point> = (0..20)
            .map(|i| {
                let y = i as f64 * 10.0;
                (0.002 * y * y - 0.3 * y + 7.0, y)
            })
            .collect();
        let coef = fit_quadratic(&pts).unwrap();
        assert!(close(coef[0], 0.002, 1e-7), "c2 = {}", coef[0]);
        assert!(close(coef[1], -0.3, 1e-5), "c1 = {}", coef[1]);
        assert!(close(coef[2], 7.0, 1e-3), "c0 = {}", coef[2]);
    }

    #[test]
    fn test_fit_straight_lane_has_no_curvature() {
        let pts: Vec<Point> = (0..5).map(|i| (3.75, i as f64 * 50.0)).collect();
        let coef = fit_quadratic(&pts).unwrap();
        assert!(coef[0].abs() < 1e-9);
        assert!(coef[1].abs() < 1e-6);
        assert!(close(coef[2], 3.75, 1e-6));
    }

    #[test]
    fn test_fit_needs_three_distinct_rows() {
        let pts = vec![(0.0, 1.0), (1.0, 1.0), (2.0, 5.0)];
        assert_eq!(
            fit_quadratic(&pts),
            Err(FitError::InsufficientPoints {
                required: 3,
                found: 2
            })
        );
    }

    #[test]
    fn test_frozen_fit_recovers_offset_and_slope() {
        let c2 = 0.001;
        let pts: Vec<Point> = (0..5)
            .map(|i| {
                let y = i as f64 * 25.0;
                (c2 * y * y + 0.05 * y - 4.0, y)
            })
            .collect();
        let coef = fit_quadratic_frozen(&pts, c2).unwrap();
        assert_eq!(coef[0], c2);
        assert!(close(coef[1], 0.05, 1e-9));
        assert!(close(coef[2], -4.0, 1e-9));
    }

    #[test]
    fn test_frozen_fit_single_row_fails() {
        let pts = vec![(0.0, 3.0), (1.0, 3.0)];
        assert!(matches!(
            fit_quadratic_frozen(&pts, 0.0),
            Err(FitError::InsufficientPoints { .. })
        ));
    }

    #[test]
    fn test_solve_3x3_singular() {
        let result = solve_3x3(
            [1.0, 2.0, 3.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            [1.0, 1.0, 2.0],
        );
        assert!(result.is_none());
    }

    #[test]
    fn test_dispersion_ranks_spread() {
        let tight: Vec<Point> = (0..10).map(|i| (0.0, i as f64)).collect();
        let wide: Vec<Point> = (0..10).map(|i| (0.0, i as f64 * 3.0)).collect();
        assert!(dispersion(&tight) < dispersion(&wide));
        assert_eq!(dispersion(&[]), 0.0);
    }

    #[test]
    fn test_quartiles_sorted_by_y() {
        let pts: Vec<Point> = (0..9).rev().map(|i| (i as f64 * 0.1, i as f64)).collect();
        let q = quartile_feature_points(&pts);
        let ys: Vec<f64> = q.iter().map(|p| p.1).collect();
        assert_eq!(ys, vec![0.0, 2.0, 4.0, 6.0, 8.0]);
        assert!(close(q[2].0, 0.4, 1e-12));
    }

    #[test]
    fn test_partition_exact_multiple() {
        let cuts = partition_axis(0.0, 150.0, 50.0);
        assert_eq!(cuts, vec![0.0, 50.0, 100.0, 150.0]);
    }

    #[test]
    fn test_partition_short_tail() {
        let cuts = partition_axis(10.0, 130.0, 50.0);
        assert_eq!(cuts, vec![10.0, 60.0, 110.0, 130.0]);
        assert_eq!(cuts.len() - 1, 3);
    }

    #[test]
    fn test_partition_degenerate_span_has_one_cell() {
        let cuts = partition_axis(5.0, 5.0, 50.0);
        assert_eq!(cuts, vec![5.0, 5.0]);
    }

    #[test]
    fn test_interval_index_edges() {
        let cuts = partition_axis(0.0, 150.0, 50.0);
        assert_eq!(interval_index(&cuts, 0.0), 0);
        assert_eq!(interval_index(&cuts, 49.9), 0);
        assert_eq!(interval_index(&cuts, 50.0), 1);
        assert_eq!(interval_index(&cuts, 150.0), 2);
        assert_eq!(interval_index(&cuts, -3.0), 0);
    }

    #[test]
    fn test_slope_at_origin_is_linear_term() {
        let coef = [0.5, -2.0, 1.0];
        assert_eq!(slope(&coef, 0.0), -2.0);
        assert_eq!(evaluate(&coef, 2.0), -1.0);
    }
}
