//! Damped Newton minimization with energy-descent backtracking.
//!
//! Each outer iteration:
//!   1. r = ∇E(u)
//!   2. refresh the linearization at u
//!   3. w = L⁻¹ r on the free DOFs
//!   4. stop if |⟨w, r⟩| < tol, negate w if ⟨w, r⟩ < 0
//!   5. halve τ from 1 until E(u − τw) ≤ E(u)
//!   6. u ← u − τw
//!
//! Energy is therefore non-increasing across the run.  Scratch buffers are
//! local to one call; nothing is shared between runs.

use crate::operator::{all_finite, EnergyOperator};
use crate::types::{FreeDofs, MinimizeReport, NewtonError, NewtonOptions, Quantity, Termination};
use log::{debug, info, trace, warn};

// ─────────────────────────────────────────────────────────────
//  Entry points
// ─────────────────────────────────────────────────────────────

/// Minimize with [`NewtonOptions::default`] (10 iterations, tol 1e-15).
pub fn minimize_with_defaults<O>(
    op: &mut O,
    state: &mut [f64],
    free: &FreeDofs,
) -> Result<MinimizeReport, NewtonError>
where
    O: EnergyOperator + ?Sized,
{
    minimize(op, state, free, &NewtonOptions::default())
}

/// Run one damped Newton minimization in place on `state`.
///
/// Side effect: `op.assemble_linearization` is called once per outer
/// iteration, so the operator's linearization afterwards belongs to the last
/// iterate at which a direction was computed.
///
/// On error `state` holds the last committed iterate.
pub fn minimize<O>(
    op: &mut O,
    state: &mut [f64],
    free: &FreeDofs,
    options: &NewtonOptions,
) -> Result<MinimizeReport, NewtonError>
where
    O: EnergyOperator + ?Sized,
{
    options.validate()?;
    let n = state.len();
    if free.len() != n {
        return Err(NewtonError::Shape(format!(
            "free-DOF mask has {} entries, state has {n}",
            free.len()
        )));
    }

    let mut r = vec![0.0; n];
    let mut w = vec![0.0; n];
    let mut uh = vec![0.0; n];

    let mut report = MinimizeReport {
        iterations: 0,
        termination: Termination::IterationBudgetExhausted,
        descent_indicator: f64::NAN,
        energy_trace: Vec::new(),
        step_lengths: Vec::new(),
        direction_flips: 0,
    };

    for it in 0..options.max_iterations {
        op.apply_residual(state, &mut r)?;
        if !all_finite(&r) {
            return Err(NewtonError::NonFiniteValue { iteration: it, quantity: Quantity::Residual });
        }

        op.assemble_linearization(state)?;

        w.fill(0.0);
        op.inverse_apply(free, &r, &mut w)
            .map_err(|e| linear_solve_failure(it, e))?;
        // Providers may leave anything in fixed slots; only the free block
        // enters ⟨w, r⟩ and the step.
        for (wi, &is_free) in w.iter_mut().zip(free.as_flags()) {
            if !is_free {
                *wi = 0.0;
            }
        }
        if !all_finite(&w) {
            return Err(NewtonError::LinearSolve {
                iteration: it,
                reason: "solution contains NaN or Inf".into(),
            });
        }

        let err = op.inner_product(&w, &r);
        if !err.is_finite() {
            return Err(NewtonError::NonFiniteValue { iteration: it, quantity: Quantity::Direction });
        }
        report.descent_indicator = err.abs();

        if err.abs() < options.tolerance {
            debug!("Newton {it}: |<w,r>|={:.3e} below tol={:.1e}, converged", err.abs(), options.tolerance);
            report.termination = Termination::Converged;
            break;
        }
        if err < 0.0 {
            warn!("Newton {it}: <w,r>={err:.3e} < 0, negating direction");
            w.iter_mut().for_each(|wi| *wi = -*wi);
            report.direction_flips += 1;
        }

        let energy = op.energy(state)?;
        if !energy.is_finite() {
            return Err(NewtonError::NonFiniteValue { iteration: it, quantity: Quantity::Energy });
        }
        if report.energy_trace.is_empty() {
            report.energy_trace.push(energy);
        }

        let (tau, trial_energy) = backtrack(&*op, state, free, &w, energy, &mut uh, options, it)?;
        debug!(
            "Newton {it}: E={energy:.6e} -> {trial_energy:.6e}, |<w,r>|={:.3e}, tau={tau:.3e}",
            err.abs()
        );

        state.copy_from_slice(&uh);
        report.iterations += 1;
        report.energy_trace.push(trial_energy);
        report.step_lengths.push(tau);
    }

    if report.termination == Termination::IterationBudgetExhausted {
        info!(
            "Newton: iteration budget ({}) exhausted, |<w,r>|={:.3e}",
            options.max_iterations, report.descent_indicator
        );
    }

    Ok(report)
}

// ─────────────────────────────────────────────────────────────
//  Backtracking line search
// ─────────────────────────────────────────────────────────────

/// Shrink τ until E(u − τw) ≤ `energy`.  Returns the accepted τ and the
/// trial energy; `uh` holds the accepted trial state.
#[allow(clippy::too_many_arguments)]
fn backtrack<O>(
    op: &O,
    state: &[f64],
    free: &FreeDofs,
    w: &[f64],
    energy: f64,
    uh: &mut [f64],
    options: &NewtonOptions,
    iteration: usize,
) -> Result<(f64, f64), NewtonError>
where
    O: EnergyOperator + ?Sized,
{
    let mut tau = 1.0;
    loop {
        trial_state(uh, state, free, w, tau);
        let trial_energy = op.energy(uh)?;
        if !trial_energy.is_finite() {
            return Err(NewtonError::NonFiniteValue { iteration, quantity: Quantity::TrialEnergy });
        }
        if trial_energy <= energy {
            return Ok((tau, trial_energy));
        }

        tau *= options.backtrack_factor;
        trace!("Newton {iteration}: E(uh)={trial_energy:.6e} > E={energy:.6e}, tau -> {tau:.3e}");
        if tau < options.min_step {
            return Err(NewtonError::LineSearchStalled { iteration, step: tau, energy });
        }
    }
}

/// uh = u − τw on the free DOFs; fixed DOFs copied verbatim.
fn trial_state(uh: &mut [f64], state: &[f64], free: &FreeDofs, w: &[f64], tau: f64) {
    uh.copy_from_slice(state);
    for i in free.free_indices() {
        uh[i] = state[i] - tau * w[i];
    }
}

fn linear_solve_failure(iteration: usize, e: NewtonError) -> NewtonError {
    match e {
        NewtonError::Linalg(e) => NewtonError::LinearSolve { iteration, reason: e.to_string() },
        NewtonError::Singular(reason) => NewtonError::LinearSolve { iteration, reason },
        other => other,
    }
}
