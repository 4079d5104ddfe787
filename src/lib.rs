//! **damped_newton** — energy-descent guarded Newton minimization.
//!
//! The crate drives a state vector toward a stationary point of an energy
//! functional:
//!
//! 1. **Contract** (`operator`): energy, residual, linearization, inverse-apply.
//! 2. **Minimizer** (`newton`): Newton direction + backtracking until the
//!    energy does not increase.
//! 3. **Sparse provider** (`sparse`): CSC Hessian, sparse Cholesky / LDL
//!    of the free-DOF block via `sprs-ldl`.
//! 4. **Dense solvers** (`dense`) and an **argmin adapter** (`adapter`).

pub mod types;
pub mod operator;
pub mod newton;
pub mod sparse;
pub mod dense;
pub mod adapter;

pub use adapter::ArgminOperator;
pub use newton::{minimize, minimize_with_defaults};
pub use operator::{inner_product, EnergyOperator};
pub use sparse::{QuadraticEnergy, SparseModel, SparseOperator};
pub use types::{
    FreeDofs, InverseKind, MinimizeReport, NewtonError, NewtonOptions, Quantity, Termination,
};
