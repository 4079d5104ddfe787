use sprs::{FillInReduction, SymmetryCheck};
use sprs_ldl::{Ldl, LdlNumeric};
use std::fmt;

// ─────────────────────────────────────────────────────────────
//  Error type
// ─────────────────────────────────────────────────────────────

/// Which quantity turned out NaN / ±Inf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    /// Energy at the current iterate.
    Energy,
    /// Energy at a backtracking trial point.
    TrialEnergy,
    /// Residual (gradient) vector.
    Residual,
    /// Newton direction returned by the linear solve.
    Direction,
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Energy => "energy",
            Self::TrialEnergy => "trial energy",
            Self::Residual => "residual",
            Self::Direction => "Newton direction",
        };
        f.write_str(name)
    }
}

/// Unified error type for all fallible operations in the crate.
///
/// Every failure aborts the current run.  The state vector handed to
/// [`crate::newton::minimize`] always holds the last committed iterate.
#[derive(Debug)]
pub enum NewtonError {
    /// The linearization could not be inverted on the free-DOF subspace
    /// (singular, indefinite under Cholesky, or non-finite solution).
    LinearSolve { iteration: usize, reason: String },
    /// Backtracking shrank τ below the configured floor without finding a
    /// trial energy ≤ the current one.
    LineSearchStalled { iteration: usize, step: f64, energy: f64 },
    /// Energy, residual or direction contained NaN / Inf.
    NonFiniteValue { iteration: usize, quantity: Quantity },
    /// A provider could not invert its linearization.  Carries no
    /// iteration; `minimize` turns it into [`NewtonError::LinearSolve`].
    Singular(String),
    /// Raw factorization failure from `sprs-ldl`.
    Linalg(sprs::errors::LinalgError),
    /// Shape mismatch in input data.
    Shape(String),
    /// Options that cannot drive a run (e.g. backtrack factor ≥ 1).
    InvalidOptions(String),
    /// `inverse_apply` called before any `assemble_linearization`.
    MissingLinearization,
    /// Error raised by a user-supplied objective.
    Problem(String),
}

impl fmt::Display for NewtonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LinearSolve { iteration, reason } =>
                write!(f, "linear solve failed at iteration {iteration}: {reason}"),
            Self::LineSearchStalled { iteration, step, energy } =>
                write!(f, "line search stalled at iteration {iteration}: τ={step:e} without decrease below energy {energy:e}"),
            Self::NonFiniteValue { iteration, quantity } =>
                write!(f, "non-finite {quantity} at iteration {iteration}"),
            Self::Singular(reason) => write!(f, "cannot invert linearization: {reason}"),
            Self::Linalg(e) => write!(f, "linear algebra error: {e}"),
            Self::Shape(msg) => write!(f, "shape error: {msg}"),
            Self::InvalidOptions(msg) => write!(f, "invalid options: {msg}"),
            Self::MissingLinearization =>
                write!(f, "linearization not assembled (call assemble_linearization first)"),
            Self::Problem(msg) => write!(f, "objective error: {msg}"),
        }
    }
}

impl std::error::Error for NewtonError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Linalg(e) => Some(e),
            _ => None,
        }
    }
}

impl From<sprs::errors::LinalgError> for NewtonError {
    fn from(e: sprs::errors::LinalgError) -> Self {
        Self::Linalg(e)
    }
}

impl From<argmin::core::Error> for NewtonError {
    fn from(e: argmin::core::Error) -> Self {
        Self::Problem(e.to_string())
    }
}

// ─────────────────────────────────────────────────────────────
//  Solver options
// ─────────────────────────────────────────────────────────────

pub const DEFAULT_MAX_ITERATIONS: usize = 10;
pub const DEFAULT_TOLERANCE: f64 = 1e-15;
pub const DEFAULT_BACKTRACK_FACTOR: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NewtonOptions {
    /// Outer Newton iterations.
    pub max_iterations: usize,
    /// Stop once |⟨w, r⟩| drops below this.
    pub tolerance: f64,
    /// Multiplier applied to τ on every rejected trial.
    pub backtrack_factor: f64,
    /// Smallest τ tried before reporting a stalled line search.
    pub min_step: f64,
}

impl Default for NewtonOptions {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tolerance: DEFAULT_TOLERANCE,
            backtrack_factor: DEFAULT_BACKTRACK_FACTOR,
            min_step: f64::EPSILON,
        }
    }
}

impl NewtonOptions {
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn with_backtrack_factor(mut self, factor: f64) -> Self {
        self.backtrack_factor = factor;
        self
    }

    pub fn with_min_step(mut self, min_step: f64) -> Self {
        self.min_step = min_step;
        self
    }

    /// Reject option combinations under which the line search could not
    /// terminate or the stopping rule is meaningless.
    pub fn validate(&self) -> Result<(), NewtonError> {
        if !(self.backtrack_factor > 0.0 && self.backtrack_factor < 1.0) {
            return Err(NewtonError::InvalidOptions(format!(
                "backtrack_factor must lie in (0, 1), got {}",
                self.backtrack_factor
            )));
        }
        if !(self.min_step.is_finite() && self.min_step > 0.0 && self.min_step <= 1.0) {
            return Err(NewtonError::InvalidOptions(format!(
                "min_step must lie in (0, 1], got {}",
                self.min_step
            )));
        }
        if !(self.tolerance >= 0.0) {
            return Err(NewtonError::InvalidOptions(format!(
                "tolerance must be non-negative, got {}",
                self.tolerance
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
//  Free degrees of freedom
// ─────────────────────────────────────────────────────────────

/// One flag per degree of freedom: `true` = free, `false` = fixed by a
/// boundary / constraint condition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeDofs {
    flags: Vec<bool>,
}

impl FreeDofs {
    /// Every DOF free.
    pub fn all(n: usize) -> Self {
        Self { flags: vec![true; n] }
    }

    pub fn from_flags(flags: Vec<bool>) -> Self {
        Self { flags }
    }

    /// All DOFs free except `fixed`.  Out-of-range indices are a shape error.
    pub fn from_fixed(n: usize, fixed: &[usize]) -> Result<Self, NewtonError> {
        let mut flags = vec![true; n];
        for &i in fixed {
            let slot = flags.get_mut(i).ok_or_else(|| {
                NewtonError::Shape(format!("fixed DOF {i} out of range for {n} DOFs"))
            })?;
            *slot = false;
        }
        Ok(Self { flags })
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    /// `false` for fixed DOFs and for indices past the end of the mask.
    pub fn is_free(&self, i: usize) -> bool {
        self.flags.get(i).copied().unwrap_or(false)
    }

    pub fn num_free(&self) -> usize {
        self.flags.iter().filter(|&&f| f).count()
    }

    pub fn free_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.flags.iter().enumerate().filter(|(_, &f)| f).map(|(i, _)| i)
    }

    pub fn as_flags(&self) -> &[bool] {
        &self.flags
    }

    /// Global DOF → position in the reduced (free-only) system, `None` if fixed.
    pub fn compressed_index(&self) -> Vec<Option<usize>> {
        let mut next = 0;
        self.flags
            .iter()
            .map(|&f| {
                if f {
                    next += 1;
                    Some(next - 1)
                } else {
                    None
                }
            })
            .collect()
    }
}

// ─────────────────────────────────────────────────────────────
//  Factorisation strategy
// ─────────────────────────────────────────────────────────────

/// How the linearization is inverted on the free-DOF block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InverseKind {
    /// Symmetric positive definite: LDLᵀ with D > 0 enforced.
    #[default]
    Cholesky,
    /// Symmetric indefinite: LDLᵀ with no sign constraint on D.
    Ldl,
}

/// Factor of the free × free block that [`crate::sparse::SparseOperator`]
/// keeps between Newton iterations.
///
/// The variant records which [`InverseKind`] produced it, so a cached factor
/// is only reused for the same kind.
pub enum Factorization {
    Cholesky(LdlNumeric<f64, usize>),
    Ldl(LdlNumeric<f64, usize>),
}

impl fmt::Debug for Factorization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = match self {
            Self::Cholesky(ldl) | Self::Ldl(ldl) => ldl.d().len(),
        };
        write!(f, "Factorization::{:?} {{ free: {n} }}", self.kind())
    }
}

/// Under `InverseKind::Cholesky` a zero or negative pivot means the block is
/// not positive definite; report the first offending reduced index.
fn require_spd(ldl: &LdlNumeric<f64, usize>) -> Result<(), sprs::errors::LinalgError> {
    match ldl.d().iter().position(|&di| !(di > 0.0)) {
        Some(index) => Err(sprs::errors::LinalgError::SingularMatrix(
            sprs::errors::SingularMatrixInfo {
                index,
                reason: "free block is not positive definite (pivot <= 0)",
            },
        )),
        None => Ok(()),
    }
}

impl Factorization {
    /// Factor a reduced block.  Ordering is reverse Cuthill–McKee; the
    /// symmetry check is skipped because callers assemble symmetric blocks.
    pub fn new(block: sprs::CsMatView<f64>, kind: InverseKind) -> Result<Self, sprs::errors::LinalgError> {
        let ldl = Ldl::new()
            .fill_in_reduction(FillInReduction::ReverseCuthillMcKee)
            .check_symmetry(SymmetryCheck::DontCheckSymmetry)
            .numeric(block)?;
        Ok(match kind {
            InverseKind::Cholesky => {
                require_spd(&ldl)?;
                Self::Cholesky(ldl)
            }
            InverseKind::Ldl => Self::Ldl(ldl),
        })
    }

    /// New values, same pattern and mask: keeps the symbolic analysis.
    pub fn update(&mut self, block: sprs::CsMatView<f64>) -> Result<(), sprs::errors::LinalgError> {
        match self {
            Self::Ldl(ldl) => ldl.update(block),
            Self::Cholesky(ldl) => {
                ldl.update(block)?;
                require_spd(ldl)
            }
        }
    }

    /// Solve against a right-hand side already restricted to free DOFs.
    pub fn solve(&self, free_rhs: &[f64]) -> Vec<f64> {
        match self {
            Self::Cholesky(ldl) | Self::Ldl(ldl) => ldl.solve(free_rhs),
        }
    }

    pub fn kind(&self) -> InverseKind {
        match self {
            Self::Cholesky(_) => InverseKind::Cholesky,
            Self::Ldl(_) => InverseKind::Ldl,
        }
    }
}

// ─────────────────────────────────────────────────────────────
//  Run report
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// |⟨w, r⟩| fell below the tolerance.
    Converged,
    /// `max_iterations` steps were committed without meeting the tolerance.
    /// Not an error: the caller decides whether the iterate is good enough.
    IterationBudgetExhausted,
}

#[derive(Debug, Clone)]
pub struct MinimizeReport {
    /// Number of committed steps.
    pub iterations: usize,
    pub termination: Termination,
    /// Last computed |⟨w, r⟩| (`NaN` if no iteration ran).
    pub descent_indicator: f64,
    /// Energy before the first step, then after every committed step.
    pub energy_trace: Vec<f64>,
    /// Accepted damping factor τ for each committed step.
    pub step_lengths: Vec<f64>,
    /// How many directions had to be negated.
    pub direction_flips: usize,
}

impl MinimizeReport {
    pub fn converged(&self) -> bool {
        self.termination == Termination::Converged
    }

    /// Energy at the returned state, if any energy was evaluated.
    pub fn final_energy(&self) -> Option<f64> {
        self.energy_trace.last().copied()
    }
}
