//! Extraction of the optimized functions from a solved fitting system.

use itertools::Itertools;
use nalgebra::DVector;

use crate::matrix_system::MatrixSystem;
use crate::nnls::{self, SolverError};

use super::BasisFunctions;

/// Scale factor relating the solver tolerance to the magnitude of the
/// right-hand side; systems built from image data span many orders of
/// magnitude, so an absolute tolerance would be meaningless.
pub const NNLS_TOLERANCE_SCALE: f64 = 1e-12;

/// The solved coefficients for a batch of optimized functions, one solution
/// vector per observation channel.
///
/// Coefficient layout follows the fitting system: element `b` is the raw
/// constant term of instance `b`, and element `instance_count * (k + 1) + b`
/// weights library function `k` of instance `b`.
pub struct OptimizedFunctions<'a, B: BasisFunctions + ?Sized> {
    basis_library: &'a B,
    instance_count: usize,
    solutions: Vec<DVector<f64>>,
}

impl<'a, B: BasisFunctions + ?Sized> OptimizedFunctions<'a, B> {
    /// Solves the premultiplied system once per channel under non-negativity,
    /// with the tolerance scaled to the median magnitude of each channel's
    /// right-hand side.
    pub fn solve_non_negative(
        basis_library: &'a B,
        system: &MatrixSystem,
    ) -> Result<Self, SolverError> {
        let instance_count = system.dim() / (basis_library.function_count() + 1);

        let solutions = system
            .rhs
            .iter()
            .map(|rhs| {
                let tolerance = NNLS_TOLERANCE_SCALE * median_positive(rhs);
                nnls::solve_premultiplied(&system.lhs, rhs, tolerance)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            basis_library,
            instance_count,
            solutions,
        })
    }

    pub fn instance_count(&self) -> usize {
        self.instance_count
    }

    /// Whether any coefficient of instance `b` came out non-zero in any
    /// channel. Instances that never received sample support solve to all
    /// zeros and can be skipped downstream.
    pub fn is_instance_non_zero(&self, b: usize) -> bool {
        self.solutions.iter().any(|solution| {
            solution[b] != 0.0
                || (0..self.basis_library.function_count())
                    .any(|k| solution[self.instance_count * (k + 1) + b] != 0.0)
        })
    }

    /// The constant term of instance `b`, with the metallic portion removed;
    /// what remains is the part that behaves as a true constant (i.e. diffuse
    /// reflectance for a BRDF).
    pub fn true_constant_term(&self, b: usize, channel: usize) -> f64 {
        self.solutions[channel][b] * (1.0 - self.basis_library.metallicity())
    }

    /// Reconstructs the non-constant part of instance `b`'s function over the
    /// whole optimized domain, invoking `consumer` with `(value, index)` from
    /// the top of the domain downward.
    pub fn evaluate_non_constant_solution(
        &self,
        b: usize,
        channel: usize,
        consumer: &mut dyn FnMut(f64, usize),
    ) {
        let solution = &self.solutions[channel];
        self.basis_library.evaluate_solution(
            solution[b],
            &|k| solution[self.instance_count * (k + 1) + b],
            consumer,
        );
    }
}

/// Median positive element of the vector, falling back to 1.0 when the upper
/// half contains no positive element at all (e.g. an empty system). Pairs
/// with [`NNLS_TOLERANCE_SCALE`] to derive a solver tolerance from the
/// right-hand side it is applied to.
pub fn median_positive(values: &DVector<f64>) -> f64 {
    values
        .iter()
        .copied()
        .sorted_by(f64::total_cmp)
        .skip(values.len() / 2)
        .find(|&v| v > 0.0)
        .unwrap_or(1.0)
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;
    use nalgebra::DMatrix;

    use super::*;
    use crate::function::StepBasis;

    #[test]
    fn median_positive_skips_lower_half() {
        let values = DVector::from_vec(vec![-1.0, 0.0, 2.0, 8.0]);
        assert_approx_eq!(f64, median_positive(&values), 2.0);
    }

    #[test]
    fn median_positive_falls_back_to_one() {
        let values = DVector::from_vec(vec![-3.0, -1.0, 0.0]);
        assert_approx_eq!(f64, median_positive(&values), 1.0);
    }

    #[test]
    fn recovers_known_coefficients() {
        // One instance, step basis over a 2-element domain: unknowns are the
        // constant term and two step coefficients. Build the normal equations
        // from a well-conditioned diagonal-dominant observation set directly.
        let basis = StepBasis::new(2, 0.0);

        // Observations: rows of A evaluate (constant, step0, step1) at
        // domain values 0 and 1 plus a pure-constant observation.
        // x_true = (0.25, 0.5, 0.3).
        let a = DMatrix::from_row_slice(
            3,
            3,
            &[
                1.0, 1.0, 1.0, // value 0: both steps active
                1.0, 0.0, 1.0, // value 1: only step 1 active
                1.0, 0.0, 0.0, // constant only
            ],
        );
        let x_true = DVector::from_vec(vec![0.25, 0.5, 0.3]);
        let y = &a * &x_true;

        let mut system = MatrixSystem::new(3, 1);
        system.lhs = a.tr_mul(&a);
        system.rhs[0] = a.tr_mul(&y);

        let solved = OptimizedFunctions::solve_non_negative(&basis, &system)
            .expect("well-formed system");

        assert!(solved.is_instance_non_zero(0));
        assert_approx_eq!(f64, solved.true_constant_term(0, 0), 0.25, epsilon = 1e-9);

        let mut curve = vec![0.0; 3];
        solved.evaluate_non_constant_solution(0, 0, &mut |value, m| curve[m] = value);

        // Cumulative recovery: value 1 sees only step 1, value 0 sees both.
        assert_approx_eq!(f64, curve[2], 0.0, epsilon = 1e-9);
        assert_approx_eq!(f64, curve[1], 0.3, epsilon = 1e-9);
        assert_approx_eq!(f64, curve[0], 0.8, epsilon = 1e-9);
    }

    #[test]
    fn unsupported_instance_solves_to_zero() {
        let basis = StepBasis::new(2, 0.0);

        // Two instances but the second has zero weight everywhere, so its
        // rows and columns of the normal equations are all zero.
        let dim = 2 * 3;
        let mut system = MatrixSystem::new(dim, 1);
        for &i in &[0usize, 2, 4] {
            for &j in &[0usize, 2, 4] {
                system.lhs[(i, j)] = if i == j { 2.0 } else { 0.5 };
            }
            system.rhs[0][i] = 1.0;
        }

        let solved = OptimizedFunctions::solve_non_negative(&basis, &system)
            .expect("well-formed system");

        assert!(solved.is_instance_non_zero(0));
        assert!(!solved.is_instance_non_zero(1));
    }
}
