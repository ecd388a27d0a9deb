//! Active-set non-negative least squares, optionally with linear equality
//! constraints handled through Lagrange multipliers on an augmented system.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

/// Errors raised when a solver is handed a malformed system.
#[derive(Debug, Error)]
pub enum SolverError {
    #[error("lhs must be a square matrix ({rows}x{cols} given)")]
    NotSquare { rows: usize, cols: usize },

    #[error("rhs length {rhs_len} does not match system dimension {dim}")]
    DimensionMismatch { rhs_len: usize, dim: usize },

    #[error("epsilon must be greater than zero ({0} given)")]
    NonPositiveEpsilon(f64),
}

/// Solves `min ||Ax - b||^2` subject to `x >= 0`.
pub fn solve(a: &DMatrix<f64>, b: &DVector<f64>, epsilon: f64) -> Result<DVector<f64>, SolverError> {
    if b.len() != a.nrows() {
        return Err(SolverError::DimensionMismatch {
            rhs_len: b.len(),
            dim: a.nrows(),
        });
    }

    let ata = a.tr_mul(a);
    let atb = a.tr_mul(b);
    solve_premultiplied(&ata, &atb, epsilon)
}

/// Solves the non-negative least-squares problem given in premultiplied form
/// `A'Ax = A'b`.
pub fn solve_premultiplied(
    ata: &DMatrix<f64>,
    atb: &DVector<f64>,
    epsilon: f64,
) -> Result<DVector<f64>, SolverError> {
    solve_premultiplied_with_equality_constraints(ata, atb, epsilon, 0)
}

/// Solves a premultiplied non-negative least-squares problem with additional
/// linear equality constraints.
///
/// The constraints are appended to the premultiplied system as an augmented
/// block (see https://en.wikipedia.org/wiki/Quadratic_programming#Equality_constraints):
/// the first `n - k` rows and columns hold `A'A`, the final `k` rows hold the
/// constraint LHS (mirrored in the final `k` columns), and the bottom-right
/// `k`x`k` block is zero. The bottom `k` entries of the RHS hold the
/// constraint values. The corresponding entries of the returned vector are
/// the Lagrange multipliers, which are unconstrained in sign; only the first
/// `n - k` variables are forced non-negative.
pub fn solve_premultiplied_with_equality_constraints(
    ata: &DMatrix<f64>,
    atb: &DVector<f64>,
    epsilon: f64,
    constraint_count: usize,
) -> Result<DVector<f64>, SolverError> {
    if ata.nrows() != ata.ncols() {
        return Err(SolverError::NotSquare {
            rows: ata.nrows(),
            cols: ata.ncols(),
        });
    }
    if atb.len() != ata.nrows() {
        return Err(SolverError::DimensionMismatch {
            rhs_len: atb.len(),
            dim: ata.nrows(),
        });
    }
    if epsilon <= 0.0 {
        return Err(SolverError::NonPositiveEpsilon(epsilon));
    }

    let total = ata.nrows();
    let free_count = total - constraint_count;

    // The set of passive (positive) variables; everything else is pinned at
    // zero. Lagrange multipliers are always treated as passive.
    let mut passive = vec![false; free_count];
    let mut passive_size = 0;

    let mut x = DVector::zeros(total);
    let mut w = atb.clone();

    loop {
        // Select the pinned variable with the largest gradient.
        let mut max_w = -1.0;
        let mut k = None;
        for i in 0..free_count {
            if !passive[i] && w[i] > max_w {
                k = Some(i);
                max_w = w[i];
            }
        }

        if max_w > epsilon || passive_size == 0 {
            let k = match k {
                Some(k) => k,
                None => break,
            };
            passive[k] = true;

            let mut s = DVector::zeros(total);
            let mut rolled_back = false;

            match solve_partial(ata, atb, &passive, constraint_count, &mut s) {
                Some((mut mapping, mut s_partial)) => {
                    passive_size = mapping.len() - constraint_count;

                    // Make sure that none of the passive variables went negative.
                    while min_non_constraint(&s_partial, constraint_count) < 0.0 {
                        let mut alpha = 1.0;
                        let mut j = None;
                        for i in 0..mapping.len() - constraint_count {
                            let s_val = s_partial[i];
                            if s_val <= 0.0 {
                                let x_val = x[mapping[i]];
                                let candidate = x_val / (x_val - s_val);
                                if candidate <= alpha {
                                    alpha = candidate;
                                    j = Some(mapping[i]);
                                }
                            }
                        }

                        let j = match j {
                            Some(j) => j,
                            None => break,
                        };

                        // x = x + alpha * (s - x)
                        let step = &s - &x;
                        x.axpy(alpha, &step, 1.0);

                        // At least one previously positive value must drop to
                        // zero; round-off does not guarantee it, so pin the
                        // limiting variable explicitly.
                        passive[j] = false;
                        x[j] = 0.0;

                        if j == k {
                            // Treat all remaining gradient values as
                            // insignificant rather than looping forever.
                            max_w = 0.0;
                        } else {
                            for i in 0..free_count {
                                if passive[i] && x[i] <= 0.0 {
                                    passive[i] = false;
                                    x[i] = 0.0;
                                }
                            }
                        }

                        s.fill(0.0);
                        match solve_partial(ata, atb, &passive, constraint_count, &mut s) {
                            Some((next_mapping, next_partial)) => {
                                mapping = next_mapping;
                                s_partial = next_partial;
                                passive_size = mapping.len() - constraint_count;
                            }
                            None => {
                                rolled_back = true;
                                break;
                            }
                        }
                    }
                }
                None => rolled_back = true,
            }

            if rolled_back {
                // The passive sub-system went singular; drop the most recently
                // admitted variable and finish with what we have.
                warn!("singular sub-system during NNLS solve; rolling back");
                passive[k] = false;
                x[k] = 0.0;
                s.fill(0.0);
                if let Some((mapping, _)) =
                    solve_partial(ata, atb, &passive, constraint_count, &mut s)
                {
                    passive_size = mapping.len() - constraint_count;
                }
                max_w = 0.0;
            }

            x = s;
            w = atb - ata * &x;
        }

        if passive_size >= free_count || max_w <= epsilon {
            break;
        }
    }

    Ok(x)
}

/// Solves the sub-system restricted to the passive variables (plus all
/// constraint rows), scattering the solution into `full_out`. Returns the
/// index mapping and the compact solution, or `None` if the sub-system is
/// singular.
fn solve_partial(
    ata: &DMatrix<f64>,
    atb: &DVector<f64>,
    passive: &[bool],
    constraint_count: usize,
    full_out: &mut DVector<f64>,
) -> Option<(Vec<usize>, DVector<f64>)> {
    let mut mapping: Vec<usize> = (0..passive.len()).filter(|&i| passive[i]).collect();
    mapping.extend(ata.nrows() - constraint_count..ata.nrows());

    let size = mapping.len();
    let mut sub = DMatrix::zeros(size, size);
    let mut sub_rhs = DVector::zeros(size);
    for (i, &row) in mapping.iter().enumerate() {
        sub_rhs[i] = atb[row];
        for (j, &col) in mapping.iter().enumerate() {
            sub[(i, j)] = ata[(row, col)];
        }
    }

    let solution = sub.lu().solve(&sub_rhs)?;
    for (i, &row) in mapping.iter().enumerate() {
        full_out[row] = solution[i];
    }

    Some((mapping, solution))
}

/// Minimum over the non-constraint entries of a compact solution vector.
fn min_non_constraint(s: &DVector<f64>, constraint_count: usize) -> f64 {
    s.iter()
        .take(s.len() - constraint_count)
        .copied()
        .fold(f64::INFINITY, f64::min)
}
