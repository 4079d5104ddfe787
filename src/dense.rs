//! Dense factorizations for small linearizations (e.g. argmin Hessians).
//!
//! Both solvers work on a copy so the assembled matrix is preserved.

use crate::types::{FreeDofs, InverseKind, NewtonError};
use ndarray::Array2;

const PIVOT_EPS: f64 = 1e-300;

fn check_square(a: &Array2<f64>, b: &[f64]) -> Result<usize, NewtonError> {
    let n = b.len();
    if a.dim() != (n, n) {
        return Err(NewtonError::Shape(format!("matrix {:?} does not match rhs of length {n}", a.dim())));
    }
    Ok(n)
}

/// Solve A x = b by Cholesky (A = L Lᵀ).  Fails on a non-positive pivot,
/// i.e. when A is not symmetric positive definite.
pub fn cholesky_solve(a: &Array2<f64>, b: &[f64]) -> Result<Vec<f64>, NewtonError> {
    let n = check_square(a, b)?;
    let mut l = Array2::<f64>::zeros((n, n));

    for j in 0..n {
        let mut diag = a[[j, j]];
        for k in 0..j {
            diag -= l[[j, k]] * l[[j, k]];
        }
        if !(diag > 0.0) {
            return Err(NewtonError::Singular(format!(
                "non-positive pivot {diag:e} at row {j} in Cholesky (not SPD)"
            )));
        }
        let ljj = diag.sqrt();
        l[[j, j]] = ljj;
        for i in (j + 1)..n {
            let mut s = a[[i, j]];
            for k in 0..j {
                s -= l[[i, k]] * l[[j, k]];
            }
            l[[i, j]] = s / ljj;
        }
    }

    // L y = b
    let mut x = b.to_vec();
    for i in 0..n {
        for k in 0..i {
            x[i] -= l[[i, k]] * x[k];
        }
        x[i] /= l[[i, i]];
    }
    // Lᵀ x = y
    for i in (0..n).rev() {
        for k in (i + 1)..n {
            x[i] -= l[[k, i]] * x[k];
        }
        x[i] /= l[[i, i]];
    }
    Ok(x)
}

/// Fallback for free blocks Cholesky refuses: elimination with row
/// pivoting on the largest remaining entry of each column, then back
/// substitution.  A column with no usable pivot is reported as singular.
pub fn lu_solve(a: &Array2<f64>, b: &[f64]) -> Result<Vec<f64>, NewtonError> {
    let n = check_square(a, b)?;
    let mut m = a.clone();
    let mut x = b.to_vec();

    for k in 0..n {
        let (p, best) = (k..n)
            .map(|row| (row, m[[row, k]].abs()))
            .fold((k, f64::NEG_INFINITY), |acc, cur| if cur.1 > acc.1 { cur } else { acc });
        if !(best > PIVOT_EPS) {
            return Err(NewtonError::Singular(format!("no pivot in column {k} of the free block")));
        }
        if p != k {
            for j in k..n {
                m.swap([k, j], [p, j]);
            }
            x.swap(k, p);
        }

        let pivot = m[[k, k]];
        for row in (k + 1)..n {
            let l = m[[row, k]] / pivot;
            if l == 0.0 {
                continue;
            }
            for j in k..n {
                m[[row, j]] -= l * m[[k, j]];
            }
            x[row] -= l * x[k];
        }
    }

    for k in (0..n).rev() {
        let tail: f64 = ((k + 1)..n).map(|j| m[[k, j]] * x[j]).sum();
        x[k] = (x[k] - tail) / m[[k, k]];
    }
    Ok(x)
}

/// Solve `matrix · out = rhs` on the free block; fixed entries of `out` are 0.
pub fn dense_inverse_apply(
    matrix: &Array2<f64>,
    free: &FreeDofs,
    rhs: &[f64],
    out: &mut [f64],
    kind: InverseKind,
) -> Result<(), NewtonError> {
    let n = rhs.len();
    if matrix.dim() != (n, n) || free.len() != n || out.len() != n {
        return Err(NewtonError::Shape(format!(
            "matrix {:?}, mask {}, rhs {n}, out {}",
            matrix.dim(),
            free.len(),
            out.len()
        )));
    }

    let idx: Vec<usize> = free.free_indices().collect();
    let nf = idx.len();
    let mut reduced = Array2::<f64>::zeros((nf, nf));
    for (ri, &i) in idx.iter().enumerate() {
        for (rj, &j) in idx.iter().enumerate() {
            reduced[[ri, rj]] = matrix[[i, j]];
        }
    }
    let b: Vec<f64> = idx.iter().map(|&i| rhs[i]).collect();

    let x = match kind {
        InverseKind::Cholesky => cholesky_solve(&reduced, &b)?,
        InverseKind::Ldl => lu_solve(&reduced, &b)?,
    };

    out.fill(0.0);
    for (ri, &i) in idx.iter().enumerate() {
        out[i] = x[ri];
    }
    Ok(())
}
