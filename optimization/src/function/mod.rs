//! Basis-function libraries and the machinery that fits optimized functions
//! expressed as non-negative combinations of a library.
//!
//! The optimization problem is a least-squares solution to:
//! `SUM(over b from 1 to B) (w_b * f_b(p) * g(p)) = y(p)`
//! where `f_b` is the function being optimized, `w_b` are fixed weights, `g`
//! is a fixed analytic factor, and `y` is the observed value being fitted.

mod builder;
mod smoothstep;
mod solution;
mod step;
mod sums;

pub use builder::*;
pub use smoothstep::*;
pub use solution::*;
pub use step::*;
pub use sums::*;

use nalgebra::DVector;

use crate::matrix_system::MatrixSystem;

/// A library of underlying basis functions from which the optimized functions
/// are constructed.
///
/// All library functions are assumed to evaluate to 1.0 at the low end of the
/// domain and decrease monotonically to 0.0: a given function is 1.0 up to
/// some inflection point, passes through its explicitly defined range down to
/// a second inflection point, and is 0.0 beyond that. The provided
/// implementations of [`contribute_to_fitting_system`](BasisFunctions::contribute_to_fitting_system)
/// and [`evaluate_solution`](BasisFunctions::evaluate_solution) rely on this
/// shape.
pub trait BasisFunctions {
    /// Evaluates library function `function_index` at a discrete domain value.
    fn evaluate(&self, function_index: usize, value: usize) -> f64;

    /// The number of functions in the library.
    fn function_count(&self) -> usize;

    /// The number of discrete elements in the domain of the function being
    /// optimized.
    fn optimized_domain_size(&self) -> usize;

    /// The assumed "metallicity" of the function being optimized. This
    /// controls the constant term fitted alongside the library coefficients:
    /// a fully metallic function applies the same analytic factor to the
    /// constant term as to the basis functions, while a non-metallic function
    /// uses a plain constant.
    fn metallicity(&self) -> f64;

    /// Index of the first function whose explicit (transitioning) range
    /// contains `value`; all lower-indexed functions evaluate to 0.0 there.
    fn first_function_index_for_domain_value(&self, value: usize) -> usize;

    /// Index of the last function whose explicit range contains `value`; all
    /// higher-indexed functions evaluate to 1.0 there.
    fn last_function_index_for_domain_value(&self, value: usize) -> usize;

    /// Flushes the accumulated running totals into the fitting system, for
    /// the bucket `value_current` and any buckets skipped up to `value_next`.
    ///
    /// Rows `0..instance_count` of the system correspond to the constant
    /// terms; library function `k` of instance `b` lives at row
    /// `instance_count * (k + 1) + b`.
    fn contribute_to_fitting_system(
        &self,
        value_current: usize,
        value_next: usize,
        instance_count: usize,
        sums: &MatrixBuilderSums,
        fitting_system: &mut MatrixSystem,
    ) {
        let k_first = self.first_function_index_for_domain_value(value_current);
        let k_last = self.last_function_index_for_domain_value(value_current);
        let function_count = self.function_count();
        let metallicity = self.metallicity();
        let channels = fitting_system.channels();

        for b1 in 0..instance_count {
            // Library functions in [k_first, k_last] are mid-transition at
            // the current bucket, so their contributions carry the linear
            // interpolation (blending) weights.
            for k in (k_first..=k_last).take_while(|&k| k < function_count) {
                let i = instance_count * (k + 1) + b1;

                // f_lower is always >= f_upper (lower/upper refer to the
                // domain parameter, not the evaluation result).
                let f_lower = self.evaluate(k, value_current);
                let f_upper = self.evaluate(k, value_current + 1);

                for channel in 0..channels {
                    fitting_system.add_to_rhs(
                        i,
                        channel,
                        lerp_helper(
                            f_lower,
                            f_upper,
                            sums.weighted_analytic_times_observed_blended(channel)[b1],
                            sums.weighted_analytic_times_observed(channel)[b1],
                        ),
                    );
                }

                for b2 in 0..instance_count {
                    // Cross terms between the constant coefficients and the
                    // library coefficients; the matrix is symmetric so both
                    // mirrored elements get the update.
                    let cross = lerp_helper(
                        f_lower,
                        f_upper,
                        metallicity * sums.weighted_analytic_squared_blended()[(b1, b2)]
                            + (1.0 - metallicity) * sums.weighted_analytic_blended()[(b1, b2)],
                        metallicity * sums.weighted_analytic_squared()[(b1, b2)]
                            + (1.0 - metallicity) * sums.weighted_analytic()[(b1, b2)],
                    );
                    fitting_system.add_to_lhs(i, b2, cross);
                    fitting_system.add_to_lhs(b2, i, cross);

                    // Pairs where both row and column are mid-transition.
                    for k2 in (k_first..=k_last).take_while(|&k2| k2 < function_count) {
                        let j = instance_count * (k2 + 1) + b2;

                        let f2_lower = self.evaluate(k2, value_current);
                        let f2_upper = self.evaluate(k2, value_current + 1);

                        fitting_system.add_to_lhs(
                            i,
                            j,
                            lerp_helper(
                                f_lower,
                                f_upper,
                                lerp_helper(
                                    f2_lower,
                                    f2_upper,
                                    sums.weighted_analytic_squared_blended_squared()[(b1, b2)],
                                    sums.weighted_analytic_squared_blended()[(b1, b2)],
                                ),
                                lerp_helper(
                                    f2_lower,
                                    f2_upper,
                                    sums.weighted_analytic_squared_blended()[(b1, b2)],
                                    sums.weighted_analytic_squared()[(b1, b2)],
                                ),
                            ),
                        );
                    }

                    // Pairs where the row is mid-transition but the column
                    // has already saturated to 1.0.
                    for k2 in k_last + 1..function_count {
                        let j = instance_count * (k2 + 1) + b2;

                        let coeff = lerp_helper(
                            f_lower,
                            f_upper,
                            sums.weighted_analytic_squared_blended()[(b1, b2)],
                            sums.weighted_analytic_squared()[(b1, b2)],
                        );
                        fitting_system.add_to_lhs(i, j, coeff);
                        fitting_system.add_to_lhs(j, i, coeff);
                    }
                }
            }

            // Library functions that saturate between the current bucket and
            // the next evaluate to exactly 1.0 from here on, so the cumulative
            // (unblended) totals apply. This loop usually runs once but can
            // run several times when buckets were skipped.
            let next_k_last = self.last_function_index_for_domain_value(value_next);
            for m1 in (k_last + 1..=next_k_last).take_while(|&m1| m1 < function_count) {
                let i = instance_count * (m1 + 1) + b1;

                for channel in 0..channels {
                    fitting_system.add_to_rhs(
                        i,
                        channel,
                        sums.weighted_analytic_times_observed_cumulative(channel)[b1],
                    );
                }

                for b2 in 0..instance_count {
                    fitting_system.add_to_lhs(
                        i,
                        b2,
                        metallicity * sums.weighted_analytic_squared_cumulative()[(b1, b2)]
                            + (1.0 - metallicity) * sums.weighted_analytic_cumulative()[(b1, b2)],
                    );
                    fitting_system.add_to_lhs(
                        b2,
                        i,
                        metallicity * sums.weighted_analytic_squared_cumulative()[(b2, b1)]
                            + (1.0 - metallicity) * sums.weighted_analytic_cumulative()[(b2, b1)],
                    );

                    // Diagonal-block corner case where m1 = m2; added once so
                    // the element is not duplicated by the mirrored update.
                    let j = instance_count * (m1 + 1) + b2;
                    fitting_system.add_to_lhs(
                        i,
                        j,
                        sums.weighted_analytic_squared_cumulative()[(b1, b2)],
                    );

                    // Every later element of the distribution also receives
                    // the total: the value of an A'A element is determined by
                    // the lower of its two bucket indices.
                    for m2 in m1 + 1..function_count {
                        let j = instance_count * (m2 + 1) + b2;
                        fitting_system.add_to_lhs(
                            i,
                            j,
                            sums.weighted_analytic_squared_cumulative()[(b1, b2)],
                        );
                        fitting_system.add_to_lhs(
                            j,
                            i,
                            sums.weighted_analytic_squared_cumulative()[(b2, b1)],
                        );
                    }
                }
            }
        }
    }

    /// Recovers the optimized function from solved coefficients by cumulative
    /// summation from the top of the domain downward, invoking `consumer`
    /// with `(value, domain_index)` for every element including the constant
    /// term at index `optimized_domain_size()`.
    fn evaluate_solution(
        &self,
        constant_term: f64,
        non_constant_solution: &dyn Fn(usize) -> f64,
        consumer: &mut dyn FnMut(f64, usize),
    ) {
        let function_count = self.function_count();

        // sums[k] holds the total weight of library functions in
        // [k, function_count) plus the metallic part of the constant term;
        // those functions are all saturated at 1.0 for domain values below
        // their transition.
        let mut sums = vec![0.0; function_count + 1];
        sums[function_count] = constant_term * self.metallicity();
        consumer(sums[function_count], function_count);

        for k in (0..function_count).rev() {
            sums[k] = sums[k + 1] + non_constant_solution(k);
        }

        for value in (0..self.optimized_domain_size()).rev() {
            let k_first = self.first_function_index_for_domain_value(value);
            let k_last = self.last_function_index_for_domain_value(value);

            // Everything from k_last up is saturated; the rest of the
            // explicit range needs direct evaluation.
            let mut total = sums[k_last];
            for k in (k_first + 1..k_last).rev() {
                total += non_constant_solution(k) * self.evaluate(k, value);
            }

            consumer(total, value);
        }
    }
}

#[inline]
fn lerp_helper(f_lower: f64, f_upper: f64, sum_blended: f64, sum_unblended: f64) -> f64 {
    f_lower * sum_blended + f_upper * (sum_unblended - sum_blended)
}

/// One observation prepared for matrix building: the exact (fractional)
/// domain position, the analytic factor `g`, the per-instance weights, and
/// the observed values for each channel.
pub struct MatrixBuilderSample<'a> {
    /// Exact position in the optimized domain; samples must be processed in
    /// ascending order of this value.
    pub exact: f64,
    /// The discretized bucket, clamped to the optimized domain.
    pub floor: usize,
    /// Linear interpolation weight toward `floor` (1.0 when exactly on the
    /// bucket, approaching 0.0 just below the next bucket).
    pub blending_weight: f64,
    /// Whether the sample falls inside the optimized domain at all; samples
    /// beyond it only contribute to the constant term.
    pub in_optimized_domain: bool,
    /// The analytic factor `g` evaluated for this sample.
    pub analytic: f64,
    /// Weight applied to this sample's squared residual.
    pub sample_weight: f64,
    /// Fixed per-instance weights `w_b`.
    pub instance_weights: &'a DVector<f64>,
    /// Observed values `y`, one per channel.
    pub observed: Vec<f64>,
}

impl<'a> MatrixBuilderSample<'a> {
    pub fn new(
        exact: f64,
        domain_size: usize,
        analytic: f64,
        sample_weight: f64,
        instance_weights: &'a DVector<f64>,
        observed: Vec<f64>,
    ) -> Self {
        let floor = (exact.floor() as usize).min(domain_size - 1);

        // When floor and exact coincide the blending weight is 1.0, falling
        // toward 0.0 just below the next bucket. A sample past the domain has
        // been clamped, leaving the weight at 0.0.
        let blending_weight = (1.0 + floor as f64 - exact).max(0.0);

        Self {
            exact,
            floor,
            blending_weight,
            in_optimized_domain: exact < domain_size as f64,
            analytic,
            sample_weight,
            instance_weights,
            observed,
        }
    }

    #[inline]
    pub fn instance_weight(&self, b: usize) -> f64 {
        self.instance_weights[b]
    }
}
