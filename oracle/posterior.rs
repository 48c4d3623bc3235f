//! # Matrix-Completion Posterior Oracle
//!
//! Joint log-density and gradient of a Bayesian low-rank matrix-completion
//! model, evaluated once per call for an external gradient-based sampler
//! (HMC, NUTS). The sampler owns the chain; this module owns nothing but the
//! fixed problem data and per-chain scratch buffers.
//!
//! # Model
//!
//! The observed entries of a grid `Y` are treated as Gaussian measurements of
//! a candidate matrix `X` with noise variance `sigma^2`. The rank constraint
//! is smoothed: the singular values of `X`, augmented with a scale variable
//! `alpha`, are pushed toward the epigraph of the l1 norm through a
//! Moreau-Yosida envelope with scale `lambda` (see `projector`). Inverse-gamma
//! priors sit on `sigma^2` and `alpha`; both scalars travel in log space so
//! the sampler sees unconstrained coordinates.
//!
//! The parameter vector is `[X (row-major), log alpha, log sigma^2]`, length
//! `rows * cols + 2`.
//!
//! # Sharing across chains
//!
//! Large read-only data is behind `Arc`, so cloning the oracle for parallel
//! chains duplicates only the scratch buffers. Each clone owns its workspace;
//! one evaluation at a time per clone is a caller precondition, not an
//! internally enforced invariant.
//!
//! # Cost
//!
//! The SVD of `X` dominates and is recomputed from scratch on every call;
//! `X` changes every invocation, so nothing about it may be cached.

use ndarray::{Array1, Array2, ArrayView1, s};
use ndarray_linalg::SVD;
use std::cell::RefCell;
use std::sync::Arc;
use thiserror::Error;

use crate::data::{InverseGamma, ObservationSet, ProblemError};
use crate::projector::{self, ProjectionError};

/// A fatal error for a single evaluation; the oracle never retries or
/// approximates, a wrong silent answer would corrupt the sampler's
/// trajectory.
#[derive(Error, Debug)]
pub enum EvalError {
    #[error("parameter vector has length {found}, expected {expected}")]
    ParameterLength { expected: usize, found: usize },

    #[error("singular value decomposition failed: {0}")]
    SvdFailed(#[from] ndarray_linalg::error::LinalgError),

    #[error("singular value decomposition returned no singular vectors")]
    MissingSingularVectors,

    #[error(transparent)]
    Projection(#[from] ProjectionError),
}

/// Read-only problem data, shared across chains without duplication.
#[derive(Clone)]
struct ProblemData {
    /// Full observation grid; unobserved entries are placeholders, never read.
    y: Arc<Array2<f64>>,
    /// Sorted linear indices of the observed entries.
    observed: Arc<ObservationSet>,
    /// Moreau-Yosida smoothing scale of the rank penalty.
    lambda: f64,
    sigma2_prior: InverseGamma,
    alpha_prior: InverseGamma,
    rows: usize,
    cols: usize,
}

/// Per-chain scratch, sized once from the grid shape and overwritten in
/// place on every call. Never resized.
struct Workspace {
    /// Candidate matrix, filled from the parameter vector.
    x: Array2<f64>,
    /// `Y[observed] - X[observed]`, in observation order.
    residual: Array1<f64>,
    /// `[singular values of X; alpha]`, length `min(rows, cols) + 1`.
    spectrum: Array1<f64>,
    /// Epigraph projection of `spectrum`.
    projected: Array1<f64>,
}

impl Workspace {
    fn for_shape(rows: usize, cols: usize, n_observed: usize) -> Self {
        let k = rows.min(cols);
        Self {
            x: Array2::zeros((rows, cols)),
            residual: Array1::zeros(n_observed),
            spectrum: Array1::zeros(k + 1),
            projected: Array1::zeros(k + 1),
        }
    }
}

/// The evaluation oracle: fixed problem data plus one chain's scratch.
///
/// `evaluate` is deterministic given the parameter vector and the problem
/// data, consumes no randomness, and keeps no state across calls beyond the
/// scratch overwrite.
pub struct Posterior {
    data: ProblemData,
    scratch: RefCell<Workspace>,
}

impl Clone for Posterior {
    /// A clone is a sibling evaluation context for another chain: shared
    /// read-only data, fresh scratch buffers.
    fn clone(&self) -> Self {
        Self {
            data: self.data.clone(),
            scratch: RefCell::new(Workspace::for_shape(
                self.data.rows,
                self.data.cols,
                self.data.observed.len(),
            )),
        }
    }
}

impl Posterior {
    pub fn new(
        y: Array2<f64>,
        observed: ObservationSet,
        lambda: f64,
        sigma2_prior: InverseGamma,
        alpha_prior: InverseGamma,
    ) -> Result<Self, ProblemError> {
        if !(lambda > 0.0) {
            return Err(ProblemError::NonPositiveLambda(lambda));
        }
        let sigma2_prior = sigma2_prior.validate("sigma2")?;
        let alpha_prior = alpha_prior.validate("alpha")?;

        let (rows, cols) = y.dim();
        // The observation set validates against its own bounds at build time;
        // re-check against this grid in case the two were constructed apart.
        for index in observed.iter() {
            if index >= rows * cols {
                return Err(ProblemError::IndexOutOfRange { index, rows, cols });
            }
        }

        log::info!(
            "matrix-completion posterior: {rows}x{cols} grid, {} observed entries, lambda = {lambda:.3e}",
            observed.len()
        );

        let scratch = RefCell::new(Workspace::for_shape(rows, cols, observed.len()));
        Ok(Self {
            data: ProblemData {
                y: Arc::new(y),
                observed: Arc::new(observed),
                lambda,
                sigma2_prior,
                alpha_prior,
                rows,
                cols,
            },
            scratch,
        })
    }

    /// Grid shape `(rows, cols)`.
    pub fn shape(&self) -> (usize, usize) {
        (self.data.rows, self.data.cols)
    }

    /// Length of the parameter vector: `rows * cols + 2`.
    pub fn param_len(&self) -> usize {
        self.data.rows * self.data.cols + 2
    }

    /// Number of observed entries.
    pub fn observed_len(&self) -> usize {
        self.data.observed.len()
    }

    pub fn lambda(&self) -> f64 {
        self.data.lambda
    }

    /// The observation grid with unobserved entries zeroed, which is also
    /// the conventional starting matrix for a sampler.
    pub fn masked_matrix(&self) -> Array2<f64> {
        let mut masked = Array2::zeros((self.data.rows, self.data.cols));
        let cols = self.data.cols;
        for index in self.data.observed.iter() {
            let (r, c) = (index / cols, index % cols);
            masked[[r, c]] = self.data.y[[r, c]];
        }
        masked
    }

    /// Standard initial parameter vector: the masked grid, `log alpha` seeded
    /// at the log of its nuclear norm, and `log sigma^2 = 0`.
    pub fn initial_theta(&self) -> Result<Array1<f64>, EvalError> {
        let masked = self.masked_matrix();
        let (_, singular_values, _) = masked.svd(false, false)?;
        let nuclear_norm: f64 = singular_values.sum();

        let n = self.data.rows * self.data.cols;
        let mut theta = Array1::zeros(n + 2);
        for (slot, &value) in theta.slice_mut(s![..n]).iter_mut().zip(masked.iter()) {
            *slot = value;
        }
        theta[n] = nuclear_norm.ln();
        theta[n + 1] = 0.0;
        Ok(theta)
    }

    /// Evaluates the unnormalized log-posterior and its gradient at `theta`.
    ///
    /// Additive constants independent of the parameters are dropped.
    /// Non-finite intermediates (an underflowing `sigma^2`, an overflowing
    /// `alpha`) propagate as IEEE infinities and NaNs; the caller's
    /// divergence handling is the only place they are dealt with.
    pub fn evaluate(&self, theta: ArrayView1<'_, f64>) -> Result<(f64, Array1<f64>), EvalError> {
        let n = self.data.rows * self.data.cols;
        if theta.len() != n + 2 {
            return Err(EvalError::ParameterLength {
                expected: n + 2,
                found: theta.len(),
            });
        }

        let log_alpha = theta[n];
        let log_sigma2 = theta[n + 1];
        let alpha = log_alpha.exp();
        let sigma2 = log_sigma2.exp();

        let mut scratch = self.scratch.borrow_mut();
        let workspace = &mut *scratch;

        // Candidate matrix, row-major from the leading block of theta.
        for (slot, &value) in workspace.x.iter_mut().zip(theta.iter()) {
            *slot = value;
        }

        // Residual over the observed entries, in observation order.
        let cols = self.data.cols;
        let mut sum_squares = 0.0;
        for (slot, index) in workspace
            .residual
            .iter_mut()
            .zip(self.data.observed.iter())
        {
            let (r, c) = (index / cols, index % cols);
            let residual = self.data.y[[r, c]] - workspace.x[[r, c]];
            *slot = residual;
            sum_squares += residual * residual;
        }

        let n_observed = self.data.observed.len() as f64;
        let sigma2_prior = self.data.sigma2_prior;
        let alpha_prior = self.data.alpha_prior;

        // Gaussian data fit folded together with the inverse-gamma prior on
        // sigma^2, plus the alpha prior.
        let quadratic_form = (sum_squares + 2.0 * sigma2_prior.scale) / (2.0 * sigma2);
        let mut log_density = -quadratic_form
            - (0.5 * n_observed + sigma2_prior.shape) * log_sigma2
            - alpha_prior.scale / alpha
            - alpha_prior.shape * log_alpha;

        let mut gradient = Array1::zeros(n + 2);
        for (&residual, index) in workspace.residual.iter().zip(self.data.observed.iter()) {
            gradient[index] = residual / sigma2;
        }
        gradient[n] = alpha_prior.scale / alpha - alpha_prior.shape;
        gradient[n + 1] = quadratic_form - (0.5 * n_observed + sigma2_prior.shape);

        // Rank penalty: project [singular values; alpha] onto the l1
        // epigraph, penalize the squared projection residual.
        let (u_opt, singular_values, vt_opt) = workspace.x.svd(true, true)?;
        let u = u_opt.ok_or(EvalError::MissingSingularVectors)?;
        let vt = vt_opt.ok_or(EvalError::MissingSingularVectors)?;

        let k = singular_values.len();
        workspace
            .spectrum
            .slice_mut(s![..k])
            .assign(&singular_values);
        workspace.spectrum[k] = alpha;
        projector::project(workspace.spectrum.view(), workspace.projected.view_mut())?;

        let mut envelope = 0.0;
        for (&raw, &proj) in workspace.spectrum.iter().zip(workspace.projected.iter()) {
            let delta = raw - proj;
            envelope += delta * delta;
        }
        let lambda = self.data.lambda;
        log_density -= envelope / (2.0 * lambda);

        // Back-projection through the SVD: d sigma_i / d X = u_i v_i^T. Only
        // the leading k columns of U and rows of V^T participate.
        let mut shrinkage = Array1::zeros(k);
        for i in 0..k {
            shrinkage[i] = workspace.spectrum[i] - workspace.projected[i];
        }
        let penalty_grad = (&u.slice(s![.., ..k]) * &shrinkage).dot(&vt.slice(s![..k, ..]));
        for (slot, &value) in gradient
            .slice_mut(s![..n])
            .iter_mut()
            .zip(penalty_grad.iter())
        {
            *slot -= value / lambda;
        }
        // Chain rule through alpha = exp(log alpha).
        gradient[n] -= alpha * (workspace.spectrum[k] - workspace.projected[k]) / lambda;

        Ok((log_density, gradient))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn scalar_problem(y: f64, lambda: f64) -> Posterior {
        let grid = array![[y]];
        let observed = ObservationSet::new(vec![0], 1, 1).unwrap();
        Posterior::new(
            grid,
            observed,
            lambda,
            InverseGamma::new(1.0, 1.0),
            InverseGamma::new(2.0, 3.0),
        )
        .unwrap()
    }

    #[test]
    fn construction_rejects_bad_configuration() {
        let observed = ObservationSet::new(vec![0], 1, 1).unwrap();
        let bad_lambda = Posterior::new(
            array![[1.0]],
            observed.clone(),
            0.0,
            InverseGamma::new(1.0, 1.0),
            InverseGamma::new(1.0, 1.0),
        );
        assert!(matches!(bad_lambda, Err(ProblemError::NonPositiveLambda(_))));

        let bad_prior = Posterior::new(
            array![[1.0]],
            observed.clone(),
            0.5,
            InverseGamma::new(-1.0, 1.0),
            InverseGamma::new(1.0, 1.0),
        );
        assert!(matches!(bad_prior, Err(ProblemError::InvalidPrior { .. })));

        let wrong_grid = ObservationSet::new(vec![3], 2, 2).unwrap();
        let mismatched = Posterior::new(
            array![[1.0]],
            wrong_grid,
            0.5,
            InverseGamma::new(1.0, 1.0),
            InverseGamma::new(1.0, 1.0),
        );
        assert!(matches!(
            mismatched,
            Err(ProblemError::IndexOutOfRange { index: 3, .. })
        ));
    }

    #[test]
    fn parameter_length_is_checked_per_call() {
        let posterior = scalar_problem(2.0, 0.5);
        let err = posterior.evaluate(array![1.0, 2.0].view()).unwrap_err();
        assert!(matches!(
            err,
            EvalError::ParameterLength {
                expected: 3,
                found: 2
            }
        ));
    }

    #[test]
    fn inactive_penalty_matches_hand_computed_density() {
        // alpha = 10 dominates the single singular value 1, so the spectrum
        // is feasible and only the data fit and priors contribute.
        let posterior = scalar_problem(2.0, 0.5);
        let theta = array![1.0, 10.0_f64.ln(), 0.0];
        let (log_density, gradient) = posterior.evaluate(theta.view()).unwrap();

        // -qf - 0 - 3/10 - 2 ln 10 with qf = (1 + 2)/2.
        let expected = -1.5 - 0.3 - 2.0 * 10.0_f64.ln();
        assert_relative_eq!(log_density, expected, epsilon = 1e-12);

        assert_relative_eq!(gradient[0], 1.0, epsilon = 1e-12);
        assert_relative_eq!(gradient[1], 0.3 - 2.0, epsilon = 1e-12);
        assert_relative_eq!(gradient[2], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn active_penalty_matches_hand_computed_density() {
        // X = 2, alpha = 1/2: the spectrum [2, 0.5] is infeasible; the
        // projection root is 0.75 and the envelope residual is [0.75, -0.75].
        let posterior = scalar_problem(2.0, 0.5);
        let theta = array![2.0, 0.5_f64.ln(), 0.0];
        let (log_density, gradient) = posterior.evaluate(theta.view()).unwrap();

        let expected = -1.0 - 3.0 / 0.5 - 2.0 * 0.5_f64.ln() - 1.125;
        assert_relative_eq!(log_density, expected, epsilon = 1e-9);

        // Data-fit gradient vanishes (residual is zero); the penalty pulls
        // the entry down by 0.75 / lambda.
        assert_relative_eq!(gradient[0], -1.5, epsilon = 1e-9);
        assert_relative_eq!(gradient[1], 6.0 - 2.0 + 0.75, epsilon = 1e-9);
        assert_relative_eq!(gradient[2], 1.0 - 1.5, epsilon = 1e-9);
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let mut rng = StdRng::seed_from_u64(1234);
        let rows = 4;
        let cols = 4;
        let grid = Array2::from_shape_fn((rows, cols), |_| rng.sample::<f64, _>(StandardNormal));
        let observed =
            ObservationSet::new(vec![0, 2, 5, 7, 8, 10, 13, 15], rows, cols).unwrap();
        let posterior = Posterior::new(
            grid,
            observed,
            0.05,
            InverseGamma::new(1.5, 0.5),
            InverseGamma::new(2.0, 1.0),
        )
        .unwrap();

        let mut theta = Array1::zeros(posterior.param_len());
        for slot in theta.iter_mut() {
            *slot = 0.3 * rng.sample::<f64, _>(StandardNormal);
        }
        // Keep alpha below the nuclear norm so the penalty branch is active.
        theta[rows * cols] = -0.5;

        let (_, analytic) = posterior.evaluate(theta.view()).unwrap();

        let step = 1e-5;
        for index in 0..theta.len() {
            let mut plus = theta.clone();
            let mut minus = theta.clone();
            plus[index] += step;
            minus[index] -= step;
            let (logp_plus, _) = posterior.evaluate(plus.view()).unwrap();
            let (logp_minus, _) = posterior.evaluate(minus.view()).unwrap();
            let numeric = (logp_plus - logp_minus) / (2.0 * step);
            assert_relative_eq!(
                analytic[index],
                numeric,
                epsilon = 1e-5,
                max_relative = 1e-5
            );
        }
    }

    #[test]
    fn non_finite_parameters_propagate_without_clamping() {
        let posterior = scalar_problem(2.0, 0.5);
        // log sigma^2 = -inf drives sigma^2 to zero: the quadratic form
        // blows up against the log term and the density must come back
        // non-finite, not repaired to something the sampler would accept.
        let theta = array![1.0, 0.0, f64::NEG_INFINITY];
        let (log_density, gradient) = posterior.evaluate(theta.view()).unwrap();
        assert!(!log_density.is_finite());
        assert!(gradient.iter().any(|g| !g.is_finite()));
    }

    #[test]
    fn clones_share_problem_data_but_not_scratch() {
        let posterior = scalar_problem(2.0, 0.5);
        let sibling = posterior.clone();
        assert!(Arc::ptr_eq(&posterior.data.y, &sibling.data.y));
        assert!(Arc::ptr_eq(&posterior.data.observed, &sibling.data.observed));
        assert!(!std::ptr::eq(
            posterior.scratch.as_ptr(),
            sibling.scratch.as_ptr()
        ));
    }

    #[test]
    fn initial_theta_has_expected_layout() {
        let mut rng = StdRng::seed_from_u64(5);
        let grid = Array2::from_shape_fn((3, 5), |_| rng.sample::<f64, _>(StandardNormal));
        let observed = ObservationSet::new(vec![0, 4, 7, 11, 14], 3, 5).unwrap();
        let posterior = Posterior::new(
            grid.clone(),
            observed,
            0.01,
            InverseGamma::new(1.0, 1.0),
            InverseGamma::new(1.0, 1.0),
        )
        .unwrap();

        let theta = posterior.initial_theta().unwrap();
        assert_eq!(theta.len(), 3 * 5 + 2);
        // Observed entries carry the grid values, everything else is zero.
        assert_eq!(theta[0], grid[[0, 0]]);
        assert_eq!(theta[4], grid[[0, 4]]);
        assert_eq!(theta[1], 0.0);
        assert_eq!(theta[3 * 5 + 1], 0.0);
        // The log-alpha seed is the log nuclear norm of the masked grid.
        let masked = posterior.masked_matrix();
        let (_, singular_values, _) = masked.svd(false, false).unwrap();
        assert_relative_eq!(
            theta[3 * 5],
            singular_values.sum().ln(),
            epsilon = 1e-12
        );
    }
}
