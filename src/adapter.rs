//! Run the damped Newton loop on problems written against `argmin`'s
//! `CostFunction` / `Gradient` / `Hessian` traits.
//!
//! Uses `Vec<f64>` as the argmin parameter type and `Vec<Vec<f64>>` (row-major)
//! as the Hessian type, so no `argmin-math` backend has to match our ndarray.

use crate::dense::dense_inverse_apply;
use crate::types::{FreeDofs, InverseKind, NewtonError};
use crate::operator::EnergyOperator;
use argmin::core::{CostFunction, Gradient, Hessian};
use ndarray::Array2;

/// Wraps an argmin problem as an [`EnergyOperator`] with a dense
/// linearization.
#[derive(Debug)]
pub struct ArgminOperator<P> {
    problem: P,
    kind: InverseKind,
    hessian: Option<Array2<f64>>,
}

impl<P> ArgminOperator<P> {
    /// Dense Cholesky inverse (Hessian assumed SPD on the free block).
    pub fn new(problem: P) -> Self {
        Self::with_inverse(problem, InverseKind::Cholesky)
    }

    /// `InverseKind::Ldl` selects pivoted elimination for indefinite Hessians.
    pub fn with_inverse(problem: P, kind: InverseKind) -> Self {
        Self { problem, kind, hessian: None }
    }

    pub fn problem(&self) -> &P {
        &self.problem
    }

    pub fn into_problem(self) -> P {
        self.problem
    }

    /// Hessian from the most recent `assemble_linearization`.
    pub fn hessian(&self) -> Option<&Array2<f64>> {
        self.hessian.as_ref()
    }
}

fn to_dense(rows: Vec<Vec<f64>>, n: usize) -> Result<Array2<f64>, NewtonError> {
    if rows.len() != n || rows.iter().any(|r| r.len() != n) {
        return Err(NewtonError::Shape(format!("Hessian is not {n}×{n}")));
    }
    let mut h = Array2::<f64>::zeros((n, n));
    for (i, row) in rows.into_iter().enumerate() {
        for (j, v) in row.into_iter().enumerate() {
            h[[i, j]] = v;
        }
    }
    Ok(h)
}

impl<P> EnergyOperator for ArgminOperator<P>
where
    P: CostFunction<Param = Vec<f64>, Output = f64>
        + Gradient<Param = Vec<f64>, Gradient = Vec<f64>>
        + Hessian<Param = Vec<f64>, Hessian = Vec<Vec<f64>>>,
{
    fn energy(&self, state: &[f64]) -> Result<f64, NewtonError> {
        Ok(self.problem.cost(&state.to_vec())?)
    }

    fn apply_residual(&self, state: &[f64], out: &mut [f64]) -> Result<(), NewtonError> {
        let g = self.problem.gradient(&state.to_vec())?;
        if g.len() != out.len() {
            return Err(NewtonError::Shape(format!(
                "gradient has {} entries, state has {}",
                g.len(),
                out.len()
            )));
        }
        out.copy_from_slice(&g);
        Ok(())
    }

    fn assemble_linearization(&mut self, state: &[f64]) -> Result<(), NewtonError> {
        let rows = self.problem.hessian(&state.to_vec())?;
        self.hessian = Some(to_dense(rows, state.len())?);
        Ok(())
    }

    fn inverse_apply(
        &mut self,
        free: &FreeDofs,
        rhs: &[f64],
        out: &mut [f64],
    ) -> Result<(), NewtonError> {
        let h = self.hessian.as_ref().ok_or(NewtonError::MissingLinearization)?;
        dense_inverse_apply(h, free, rhs, out, self.kind)
    }
}
