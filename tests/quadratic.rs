//! Damped Newton on the quadratic model  E(u) = ½ uᵀAu − bᵀu.
//!
//! A is the 1-D Dirichlet-like tridiagonal matrix tridiag(−1, 4, −1), which
//! is SPD, so the sparse Cholesky path applies and a single full Newton step
//! lands on A⁻¹b.

use approx::assert_abs_diff_eq;
use damped_newton::*;
use sprs::{CsMat, TriMat};

// ─────────────────────────────────────────────────────────────
//  Helpers
// ─────────────────────────────────────────────────────────────

fn tridiagonal(n: usize, diag: f64, off: f64) -> CsMat<f64> {
    let mut tri = TriMat::new((n, n));
    for i in 0..n {
        tri.add_triplet(i, i, diag);
        if i + 1 < n {
            tri.add_triplet(i, i + 1, off);
            tri.add_triplet(i + 1, i, off);
        }
    }
    tri.to_csc()
}

fn quadratic_operator(n: usize) -> SparseOperator<QuadraticEnergy> {
    let a = tridiagonal(n, 4.0, -1.0);
    let b: Vec<f64> = (1..=n).map(|i| i as f64).collect();
    SparseOperator::new(QuadraticEnergy::new(a, b).unwrap())
}

fn residual(op: &SparseOperator<QuadraticEnergy>, u: &[f64]) -> Vec<f64> {
    let mut r = vec![0.0; u.len()];
    op.apply_residual(u, &mut r).unwrap();
    r
}

/// Delegates to an inner operator but hands back −L⁻¹r.
struct FlippedSign<'a> {
    inner: &'a mut SparseOperator<QuadraticEnergy>,
}

impl EnergyOperator for FlippedSign<'_> {
    fn energy(&self, state: &[f64]) -> Result<f64, NewtonError> {
        self.inner.energy(state)
    }

    fn apply_residual(&self, state: &[f64], out: &mut [f64]) -> Result<(), NewtonError> {
        self.inner.apply_residual(state, out)
    }

    fn assemble_linearization(&mut self, state: &[f64]) -> Result<(), NewtonError> {
        self.inner.assemble_linearization(state)
    }

    fn inverse_apply(&mut self, free: &FreeDofs, rhs: &[f64], out: &mut [f64]) -> Result<(), NewtonError> {
        self.inner.inverse_apply(free, rhs, out)?;
        out.iter_mut().for_each(|x| *x = -*x);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Convergence
// ─────────────────────────────────────────────────────────────

/// One full step (τ = 1) reaches A⁻¹b; the next iteration sees a
/// negligible descent indicator and stops.
#[test]
fn converges_in_one_full_step() {
    let n = 6;
    let mut op = quadratic_operator(n);
    let mut u = vec![0.0; n];
    let free = FreeDofs::all(n);

    let report = minimize_with_defaults(&mut op, &mut u, &free).unwrap();

    assert!(report.converged(), "termination = {:?}", report.termination);
    assert_eq!(report.iterations, 1);
    assert_eq!(report.step_lengths, vec![1.0]);
    assert_eq!(report.direction_flips, 0);
    assert!(report.descent_indicator < 1e-15, "err = {:e}", report.descent_indicator);

    for (i, ri) in residual(&op, &u).iter().enumerate() {
        assert!(ri.abs() < 1e-12, "residual[{i}] = {ri:e}");
    }
}

/// Starting away from zero makes no difference for a quadratic.
#[test]
fn converges_from_arbitrary_start() {
    let n = 5;
    let mut op = quadratic_operator(n);
    let mut u = vec![10.0, -3.0, 7.5, 0.25, -100.0];
    let free = FreeDofs::all(n);

    let report = minimize_with_defaults(&mut op, &mut u, &free).unwrap();

    assert!(report.converged());
    assert_eq!(report.iterations, 1);
    for ri in residual(&op, &u) {
        assert_abs_diff_eq!(ri, 0.0, epsilon = 1e-10);
    }
}

/// Energy trace: initial energy followed by the minimum ½bᵀu* … below it.
#[test]
fn energy_does_not_increase() {
    let n = 8;
    let mut op = quadratic_operator(n);
    let mut u = vec![1.0; n];
    let free = FreeDofs::all(n);

    let report = minimize_with_defaults(&mut op, &mut u, &free).unwrap();

    assert_eq!(report.energy_trace.len(), report.iterations + 1);
    for pair in report.energy_trace.windows(2) {
        assert!(pair[1] <= pair[0], "energy increased: {} -> {}", pair[0], pair[1]);
    }
    // At the minimizer E = −½ bᵀu*.
    let b = op.model().rhs().to_vec();
    let expected = -0.5 * inner_product(&b, &u);
    assert_abs_diff_eq!(report.final_energy().unwrap(), expected, epsilon = 1e-10);
}

// ─────────────────────────────────────────────────────────────
//  Stopping rule & sign correction
// ─────────────────────────────────────────────────────────────

/// b = A u₀ makes the residual vanish exactly at u₀.
#[test]
fn zero_residual_returns_start_unchanged() {
    let n = 5;
    let a = tridiagonal(n, 4.0, -1.0);
    let u0 = vec![1.0, 2.0, 3.0, 4.0, 5.0];
    let mut b = vec![0.0; n];
    for (&v, (row, col)) in a.iter() {
        b[row] += v * u0[col];
    }
    let mut op = SparseOperator::new(QuadraticEnergy::new(a, b).unwrap());
    let mut u = u0.clone();

    let report = minimize_with_defaults(&mut op, &mut u, &FreeDofs::all(n)).unwrap();

    assert!(report.converged());
    assert_eq!(report.iterations, 0);
    assert_eq!(report.descent_indicator, 0.0);
    assert!(report.energy_trace.is_empty());
    assert_eq!(u, u0);
}

/// A solver that returns −A⁻¹r still converges: the minimizer flips w.
#[test]
fn inverted_solver_sign_is_corrected() {
    let n = 6;
    let mut inner = quadratic_operator(n);
    let mut u = vec![0.0; n];
    let free = FreeDofs::all(n);

    let report = {
        let mut flipped = FlippedSign { inner: &mut inner };
        minimize_with_defaults(&mut flipped, &mut u, &free).unwrap()
    };

    assert!(report.converged());
    assert_eq!(report.direction_flips, 1);
    assert_eq!(report.step_lengths, vec![1.0]);
    for ri in residual(&inner, &u) {
        assert_abs_diff_eq!(ri, 0.0, epsilon = 1e-12);
    }
}

// ─────────────────────────────────────────────────────────────
//  Fixed degrees of freedom
// ─────────────────────────────────────────────────────────────

/// Entries outside the free mask are bit-for-bit untouched; the free block
/// reaches its conditional minimum.
#[test]
fn fixed_dofs_are_never_altered() {
    let n = 6;
    let mut op = quadratic_operator(n);
    let mut u = vec![2.5, 0.0, 0.0, -0.0, 0.0, -1.25];
    let before = u.clone();
    let free = FreeDofs::from_fixed(n, &[0, 3, 5]).unwrap();

    let report = minimize_with_defaults(&mut op, &mut u, &free).unwrap();
    assert!(report.converged());

    for i in [0, 3, 5] {
        assert_eq!(u[i].to_bits(), before[i].to_bits(), "fixed DOF {i} changed");
    }
    let r = residual(&op, &u);
    for i in free.free_indices() {
        assert!(r[i].abs() < 1e-12, "free residual[{i}] = {:e}", r[i]);
    }
}

/// With every DOF fixed the direction is zero and the run stops at once.
#[test]
fn all_fixed_stops_immediately() {
    let n = 4;
    let mut op = quadratic_operator(n);
    let mut u = vec![1.0, -2.0, 3.0, -4.0];
    let free = FreeDofs::from_flags(vec![false; n]);

    let report = minimize_with_defaults(&mut op, &mut u, &free).unwrap();

    assert!(report.converged());
    assert_eq!(report.iterations, 0);
    assert_eq!(u, vec![1.0, -2.0, 3.0, -4.0]);
}

// ─────────────────────────────────────────────────────────────
//  Option / input validation
// ─────────────────────────────────────────────────────────────

#[test]
fn zero_iteration_budget_is_not_an_error() {
    let n = 3;
    let mut op = quadratic_operator(n);
    let mut u = vec![0.0; n];
    let options = NewtonOptions::default().with_max_iterations(0);

    let report = minimize(&mut op, &mut u, &FreeDofs::all(n), &options).unwrap();

    assert_eq!(report.termination, Termination::IterationBudgetExhausted);
    assert_eq!(report.iterations, 0);
    assert!(report.descent_indicator.is_nan());
    assert_eq!(u, vec![0.0; n]);
}

#[test]
fn mask_length_mismatch_is_rejected() {
    let mut op = quadratic_operator(4);
    let mut u = vec![0.0; 4];

    let err = minimize_with_defaults(&mut op, &mut u, &FreeDofs::all(3)).unwrap_err();
    assert!(matches!(err, NewtonError::Shape(_)), "got {err}");
}

#[test]
fn bad_options_are_rejected() {
    let mut op = quadratic_operator(2);
    let mut u = vec![0.0; 2];
    let free = FreeDofs::all(2);

    for options in [
        NewtonOptions::default().with_backtrack_factor(1.0),
        NewtonOptions::default().with_backtrack_factor(0.0),
        NewtonOptions::default().with_min_step(0.0),
        NewtonOptions::default().with_min_step(f64::NAN),
        NewtonOptions::default().with_tolerance(-1.0),
    ] {
        let err = minimize(&mut op, &mut u, &free, &options).unwrap_err();
        assert!(matches!(err, NewtonError::InvalidOptions(_)), "{options:?}: got {err}");
    }
}
