//! Sparse assembled provider: CSC Hessian + cached `sprs-ldl` factorization
//! of the free-DOF block.
//!
//! A [`SparseModel`] supplies energy, gradient and Hessian triplets;
//! [`SparseOperator`] turns it into an [`EnergyOperator`].

use crate::operator::{all_finite, EnergyOperator};
use crate::types::{Factorization, FreeDofs, InverseKind, NewtonError};
use sprs::{CsMat, TriMat};

// ─────────────────────────────────────────────────────────────
//  Model trait
// ─────────────────────────────────────────────────────────────

/// Energy functional with a sparse second derivative.
pub trait SparseModel {
    /// Number of degrees of freedom.
    fn dim(&self) -> usize;

    fn energy(&self, u: &[f64]) -> f64;

    /// Write ∇E(u) into `out`.
    fn gradient(&self, u: &[f64], out: &mut [f64]);

    /// Push the Hessian at `u` as triplets.  Duplicate (row, col) entries
    /// are summed on assembly.
    fn hessian(&self, u: &[f64], tri: &mut TriMat<f64>);
}

// ─────────────────────────────────────────────────────────────
//  Quadratic model  E(u) = ½ uᵀAu − bᵀu
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct QuadraticEnergy {
    a: CsMat<f64>,
    b: Vec<f64>,
}

impl QuadraticEnergy {
    pub fn new(a: CsMat<f64>, b: Vec<f64>) -> Result<Self, NewtonError> {
        if a.rows() != a.cols() || a.rows() != b.len() {
            return Err(NewtonError::Shape(format!(
                "A is {}×{}, b has {} entries",
                a.rows(),
                a.cols(),
                b.len()
            )));
        }
        Ok(Self { a, b })
    }

    pub fn matrix(&self) -> &CsMat<f64> {
        &self.a
    }

    pub fn rhs(&self) -> &[f64] {
        &self.b
    }
}

/// out = A x  (works for CSC and CSR storage).
fn spmv_into(a: &CsMat<f64>, x: &[f64], out: &mut [f64]) {
    out.fill(0.0);
    for (&v, (row, col)) in a.iter() {
        out[row] += v * x[col];
    }
}

impl SparseModel for QuadraticEnergy {
    fn dim(&self) -> usize {
        self.b.len()
    }

    fn energy(&self, u: &[f64]) -> f64 {
        let mut au = vec![0.0; u.len()];
        spmv_into(&self.a, u, &mut au);
        u.iter()
            .zip(&au)
            .zip(&self.b)
            .map(|((ui, ai), bi)| 0.5 * ui * ai - bi * ui)
            .sum()
    }

    fn gradient(&self, u: &[f64], out: &mut [f64]) {
        spmv_into(&self.a, u, out);
        for (o, bi) in out.iter_mut().zip(&self.b) {
            *o -= bi;
        }
    }

    fn hessian(&self, _u: &[f64], tri: &mut TriMat<f64>) {
        for (&v, (row, col)) in self.a.iter() {
            tri.add_triplet(row, col, v);
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Operator with cached factorization
// ─────────────────────────────────────────────────────────────

/// Factorization of the reduced system plus the pattern / mask it was
/// built for, so a refactor with identical structure can reuse the
/// symbolic analysis.
#[derive(Debug)]
struct CachedFactor {
    mask: FreeDofs,
    indptr: Vec<usize>,
    indices: Vec<usize>,
    factorization: Factorization,
}

#[derive(Debug)]
pub struct SparseOperator<M> {
    model: M,
    kind: InverseKind,
    /// Last assembled linearization (CSC, dim × dim).
    matrix: Option<CsMat<f64>>,
    factor: Option<CachedFactor>,
    /// Whether `factor` holds the numeric values of `matrix`.
    factor_current: bool,
}

impl<M: SparseModel> SparseOperator<M> {
    /// Operator that inverts with sparse Cholesky.
    pub fn new(model: M) -> Self {
        Self::with_inverse(model, InverseKind::Cholesky)
    }

    pub fn with_inverse(model: M, kind: InverseKind) -> Self {
        Self {
            model,
            kind,
            matrix: None,
            factor: None,
            factor_current: false,
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn into_model(self) -> M {
        self.model
    }

    pub fn inverse_kind(&self) -> InverseKind {
        self.kind
    }

    /// Linearization from the most recent `assemble_linearization`.
    pub fn matrix(&self) -> Option<&CsMat<f64>> {
        self.matrix.as_ref()
    }

    fn check_len(&self, what: &str, len: usize) -> Result<(), NewtonError> {
        let n = self.model.dim();
        if len != n {
            return Err(NewtonError::Shape(format!("{what} has {len} entries, model has {n} DOFs")));
        }
        Ok(())
    }

    /// Bring `self.factor` in line with the current matrix and mask.
    fn refactor(&mut self, reduced: &CsMat<f64>, free: &FreeDofs) -> Result<(), NewtonError> {
        let indptr: Vec<usize> = reduced.indptr().raw_storage().to_vec();
        let indices = reduced.indices();

        let reusable = matches!(
            &self.factor,
            Some(c) if c.mask == *free
                && c.indptr == indptr
                && c.indices == indices
                && c.factorization.kind() == self.kind
        );

        if reusable {
            let updated = match self.factor.as_mut() {
                Some(cached) => cached.factorization.update(reduced.view()),
                None => Ok(()),
            };
            if let Err(e) = updated {
                self.factor = None;
                return Err(e.into());
            }
        } else {
            self.factor = None;
            let factorization = Factorization::new(reduced.view(), self.kind)?;
            self.factor = Some(CachedFactor {
                mask: free.clone(),
                indptr,
                indices: indices.to_vec(),
                factorization,
            });
        }
        self.factor_current = true;
        Ok(())
    }
}

/// Extract the free × free block of `a` (CSC).
fn reduce_to_free(a: &CsMat<f64>, free: &FreeDofs) -> CsMat<f64> {
    let map = free.compressed_index();
    let nf = free.num_free();
    let mut tri = TriMat::new((nf, nf));
    for (&v, (row, col)) in a.iter() {
        if let (Some(r), Some(c)) = (map[row], map[col]) {
            tri.add_triplet(r, c, v);
        }
    }
    tri.to_csc()
}

impl<M: SparseModel> EnergyOperator for SparseOperator<M> {
    fn energy(&self, state: &[f64]) -> Result<f64, NewtonError> {
        self.check_len("state", state.len())?;
        Ok(self.model.energy(state))
    }

    fn apply_residual(&self, state: &[f64], out: &mut [f64]) -> Result<(), NewtonError> {
        self.check_len("state", state.len())?;
        self.check_len("residual buffer", out.len())?;
        self.model.gradient(state, out);
        Ok(())
    }

    fn assemble_linearization(&mut self, state: &[f64]) -> Result<(), NewtonError> {
        self.check_len("state", state.len())?;
        let n = self.model.dim();
        let mut tri = TriMat::new((n, n));
        self.model.hessian(state, &mut tri);
        self.matrix = Some(tri.to_csc());
        self.factor_current = false;
        Ok(())
    }

    fn inverse_apply(
        &mut self,
        free: &FreeDofs,
        rhs: &[f64],
        out: &mut [f64],
    ) -> Result<(), NewtonError> {
        self.check_len("free-DOF mask", free.len())?;
        self.check_len("rhs", rhs.len())?;
        self.check_len("solution buffer", out.len())?;

        out.fill(0.0);
        if free.num_free() == 0 {
            return Ok(());
        }

        let matrix = self.matrix.as_ref().ok_or(NewtonError::MissingLinearization)?;
        let stale = !self.factor_current
            || self.factor.as_ref().map_or(true, |c| c.mask != *free);
        if stale {
            let reduced = reduce_to_free(matrix, free);
            self.refactor(&reduced, free)?;
        }

        let cached = self.factor.as_ref().ok_or(NewtonError::MissingLinearization)?;
        let b: Vec<f64> = free.free_indices().map(|i| rhs[i]).collect();
        let x = cached.factorization.solve(&b);
        if !all_finite(&x) {
            return Err(NewtonError::Singular("factorized solve produced NaN or Inf".into()));
        }

        for (xi, i) in x.into_iter().zip(free.free_indices()) {
            out[i] = xi;
        }
        Ok(())
    }
}
