//! # Epigraph Projection onto the l1-Norm Ball
//!
//! This module computes the Euclidean projection of a point `(x, s)` onto the
//! convex set `{(y, t) : ||y||_1 <= t}`, where `x` is a vector and `s` a
//! scalar bound carried as the final coordinate. It is the leaf kernel of the
//! rank penalty: the posterior projects the singular-value vector of the
//! candidate matrix, augmented with the scale variable, through this set on
//! every evaluation.
//!
//! # Method
//!
//! A point is feasible when `sum(|x_i|) <= s + |s|`; the doubled bound admits
//! `s = +inf` and admits a negative `s` only when `x` is exactly zero.
//! Feasible points project to themselves.
//!
//! For an infeasible point the projection is a soft-threshold at the unique
//! non-negative root `r` of
//!
//! `phi(r) = sum_i max(|x_i| - r, 0) - r - s`
//!
//! `phi` is continuous and strictly decreasing until it reaches `-r - s`, with
//! `phi(0) = ||x||_1 - s > 0` on the infeasible branch and
//! `phi(max|x_i|) = -max|x_i| - s <= 0` whenever `s >= -max|x_i|`, so the root
//! is bracketed by `[0, max|x_i|]` and plain bisection converges
//! unconditionally. A bound `s < -max|x_i|` cannot come out of the posterior
//! (the scale variable is an exponential) and is rejected as a caller bug.
//!
//! The projected point is `y_i = sign(x_i) * max(|x_i| - r, 0)` with bound
//! `t = s + r`, which satisfies `||y||_1 = t` exactly at the root.

use ndarray::{ArrayView1, ArrayViewMut1, s};
use thiserror::Error;

/// Bisection stops once the bracket width falls below this relative width.
const BISECTION_TOL: f64 = 1e-13;

/// Hard cap on bisection steps; the bracket halves each step, so this is
/// never reached for finite inputs.
const MAX_BISECTIONS: usize = 200;

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error(
        "projection root is not bracketed: phi({upper}) = {phi} > 0 for scale bound {bound}; the input violates the projector contract"
    )]
    RootNotBracketed { upper: f64, phi: f64, bound: f64 },

    #[error("projection output buffer has length {found}, expected {expected}")]
    OutputLength { expected: usize, found: usize },
}

/// Projects `point = (x, s)` onto `{(y, t) : ||y||_1 <= t}`, writing the
/// result into `out`.
///
/// `point` and `out` must have the same length `k + 1`; the first `k`
/// entries are the vector part and the last entry is the scale bound. The
/// function is pure: it reads `point`, overwrites `out`, and touches nothing
/// else.
pub fn project(point: ArrayView1<'_, f64>, mut out: ArrayViewMut1<'_, f64>) -> Result<(), ProjectionError> {
    if out.len() != point.len() {
        return Err(ProjectionError::OutputLength {
            expected: point.len(),
            found: out.len(),
        });
    }
    if point.is_empty() {
        return Ok(());
    }

    let k = point.len() - 1;
    let bound = point[k];
    let vector = point.slice(s![..k]);
    let l1_norm: f64 = vector.iter().map(|v| v.abs()).sum();

    // Feasible points, including s = +inf, pass through untouched.
    if bound == f64::INFINITY || l1_norm <= bound + bound.abs() {
        out.assign(&point);
        return Ok(());
    }

    let upper = vector.iter().fold(0.0_f64, |acc, v| acc.max(v.abs()));
    let phi_upper = -upper - bound;
    if phi_upper > 0.0 {
        return Err(ProjectionError::RootNotBracketed {
            upper,
            phi: phi_upper,
            bound,
        });
    }

    let mut lo = 0.0_f64;
    let mut hi = upper;
    for _ in 0..MAX_BISECTIONS {
        if hi - lo <= BISECTION_TOL * hi.max(1.0) {
            break;
        }
        let mid = 0.5 * (lo + hi);
        if phi(vector, mid, bound) > 0.0 {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let root = 0.5 * (lo + hi);

    for (slot, &value) in out.slice_mut(s![..k]).iter_mut().zip(vector.iter()) {
        *slot = value.signum() * (value.abs() - root).max(0.0);
    }
    out[k] = bound + root;
    Ok(())
}

fn phi(vector: ArrayView1<'_, f64>, threshold: f64, bound: f64) -> f64 {
    let shrunk: f64 = vector
        .iter()
        .map(|v| (v.abs() - threshold).max(0.0))
        .sum();
    shrunk - threshold - bound
}
