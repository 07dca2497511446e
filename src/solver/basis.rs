//! Cubic B-spline design matrix for the smooth-in-day term.
//!
//! Clamped, equally spaced knot vector; rows evaluated with the de Boor
//! recurrence. Fit and prediction must share one knot vector, so the
//! domain is passed explicitly rather than derived from the evaluation
//! points.

use nalgebra::DMatrix;

/// Spline degree (cubic).
pub const DEGREE: usize = 3;

/// Evaluate the B-spline design matrix for `x` with `n_basis` functions
/// over `domain`.
///
/// `n_basis` is raised to the cubic minimum (degree + 1) if needed, and a
/// degenerate domain is widened to unit length. Points outside the domain
/// are clamped to its ends.
pub fn bspline_design(x: &[f64], n_basis: usize, domain: (f64, f64)) -> DMatrix<f64> {
    let n_basis = n_basis.max(DEGREE + 1);
    let (lo, hi) = if domain.1 > domain.0 {
        domain
    } else {
        (domain.0, domain.0 + 1.0)
    };
    let knots = clamped_knots(n_basis, lo, hi);

    let mut design = DMatrix::zeros(x.len(), n_basis);
    for (row, &xi) in x.iter().enumerate() {
        let t = xi.clamp(lo, hi);
        let span = find_span(&knots, n_basis, t);
        let vals = basis_funs(&knots, span, t);
        for (j, &v) in vals.iter().enumerate() {
            design[(row, span - DEGREE + j)] = v;
        }
    }
    design
}

/// Clamped knot vector: degree+1 copies of each end, interior knots
/// equally spaced.
fn clamped_knots(n_basis: usize, lo: f64, hi: f64) -> Vec<f64> {
    let n_interior = n_basis - DEGREE - 1;
    let mut knots = Vec::with_capacity(n_basis + DEGREE + 1);
    for _ in 0..=DEGREE {
        knots.push(lo);
    }
    for j in 1..=n_interior {
        knots.push(lo + (hi - lo) * j as f64 / (n_interior + 1) as f64);
    }
    for _ in 0..=DEGREE {
        knots.push(hi);
    }
    knots
}

/// Knot span index i with knots[i] <= t < knots[i+1], clamped so the last
/// basis segment absorbs t at the upper domain end.
fn find_span(knots: &[f64], n_basis: usize, t: f64) -> usize {
    if t >= knots[n_basis] {
        return n_basis - 1;
    }
    let mut span = DEGREE;
    while span + 1 < n_basis && t >= knots[span + 1] {
        span += 1;
    }
    span
}

/// Nonzero basis values at `t` (de Boor recurrence), length DEGREE + 1.
fn basis_funs(knots: &[f64], span: usize, t: f64) -> [f64; DEGREE + 1] {
    let mut vals = [0.0; DEGREE + 1];
    let mut left = [0.0; DEGREE + 1];
    let mut right = [0.0; DEGREE + 1];
    vals[0] = 1.0;

    for j in 1..=DEGREE {
        left[j] = t - knots[span + 1 - j];
        right[j] = knots[span + j] - t;
        let mut saved = 0.0;
        for r in 0..j {
            let denom = right[r + 1] + left[j - r];
            let term = if denom != 0.0 { vals[r] / denom } else { 0.0 };
            vals[r] = saved + right[r + 1] * term;
            saved = left[j - r] * term;
        }
        vals[j] = saved;
    }
    vals
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_partition_of_unity() {
        let x: Vec<f64> = (0..50).map(|i| 1.0 + i as f64 * 0.5).collect();
        let design = bspline_design(&x, 8, (1.0, 25.5));
        for row in 0..design.nrows() {
            let sum: f64 = (0..design.ncols()).map(|c| design[(row, c)]).sum();
            assert_relative_eq!(sum, 1.0, epsilon = 1e-10);
        }
    }

    #[test]
    fn test_domain_end_points() {
        let design = bspline_design(&[1.0, 20.0], 6, (1.0, 20.0));
        // Clamped spline: first basis is 1 at the lower end, last at the upper.
        assert_relative_eq!(design[(0, 0)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(design[(1, 5)], 1.0, epsilon = 1e-10);
    }

    #[test]
    fn test_basis_floor_and_clamping() {
        // Requested dimension below the cubic minimum is raised to 4, and
        // out-of-domain points evaluate at the clamped ends.
        let design = bspline_design(&[-5.0, 50.0], 2, (0.0, 10.0));
        assert_eq!(design.ncols(), 4);
        assert_relative_eq!(design[(0, 0)], 1.0, epsilon = 1e-10);
        assert_relative_eq!(design[(1, 3)], 1.0, epsilon = 1e-10);
    }
}
