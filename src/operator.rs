//! Collaborator contract consumed by the minimizer.
//!
//! An [`EnergyOperator`] bundles the energy functional, its residual
//! (gradient), a stateful linearization and the inverse-apply of that
//! linearization on the free degrees of freedom.  Concrete providers live in
//! [`crate::sparse`] and [`crate::adapter`]; anything else (an FEM assembly,
//! a hand-written model) can implement the trait directly.

use crate::types::{FreeDofs, NewtonError};

/// Energy / residual / linearization provider.
///
/// Contract:
/// * `energy` is a pure function of the state and finite for valid states.
/// * `apply_residual` writes ∇E(u) into `out` (same length as `u`).
/// * `assemble_linearization` refreshes the internal Jacobian / Hessian at
///   `u`; `inverse_apply` is only valid after it.
/// * `inverse_apply` solves L·x = rhs restricted to the free DOFs and writes
///   zero into the fixed entries of `out`.
///
/// Solvers backed by a Cholesky-type factorization require the linearization
/// to be symmetric positive definite on the free block; callers that cannot
/// guarantee this should select an indefinite factorization.
pub trait EnergyOperator {
    fn energy(&self, state: &[f64]) -> Result<f64, NewtonError>;

    fn apply_residual(&self, state: &[f64], out: &mut [f64]) -> Result<(), NewtonError>;

    fn assemble_linearization(&mut self, state: &[f64]) -> Result<(), NewtonError>;

    fn inverse_apply(
        &mut self,
        free: &FreeDofs,
        rhs: &[f64],
        out: &mut [f64],
    ) -> Result<(), NewtonError>;

    /// Standard Euclidean inner product.  Override for weighted spaces.
    fn inner_product(&self, a: &[f64], b: &[f64]) -> f64 {
        inner_product(a, b)
    }
}

impl<T: EnergyOperator + ?Sized> EnergyOperator for &mut T {
    fn energy(&self, state: &[f64]) -> Result<f64, NewtonError> {
        (**self).energy(state)
    }

    fn apply_residual(&self, state: &[f64], out: &mut [f64]) -> Result<(), NewtonError> {
        (**self).apply_residual(state, out)
    }

    fn assemble_linearization(&mut self, state: &[f64]) -> Result<(), NewtonError> {
        (**self).assemble_linearization(state)
    }

    fn inverse_apply(
        &mut self,
        free: &FreeDofs,
        rhs: &[f64],
        out: &mut [f64],
    ) -> Result<(), NewtonError> {
        (**self).inverse_apply(free, rhs, out)
    }

    fn inner_product(&self, a: &[f64], b: &[f64]) -> f64 {
        (**self).inner_product(a, b)
    }
}

pub fn inner_product(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub(crate) fn all_finite(v: &[f64]) -> bool {
    v.iter().all(|x| x.is_finite())
}
