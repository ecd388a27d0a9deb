//! Smoothstep-based basis library with configurable transition widths.

use super::BasisFunctions;

/// The classic cubic Hermite smoothstep, `3x^2 - 2x^3` on `[0, 1]`.
#[inline]
pub fn smoothstep(x: f64) -> f64 {
    x * x * (3.0 - 2.0 * x)
}

/// A library of smoothed step functions. Function `k` is 1.0 at the low end
/// of the domain, rolls off through an interpolation function (typically
/// [`smoothstep`]) over a transition window, and is 0.0 beyond it.
///
/// The transition windows grow with the function index, from
/// `min_smoothstep_width` for function 0 up to at most
/// `max_smoothstep_width`, so the library represents sharp features near the
/// low end of the domain and progressively smoother ones toward the high end.
/// The function count may differ from the domain resolution; function indices
/// are remapped linearly so that the last function finishes its transition at
/// the top of the domain.
pub struct SmoothStepBasis<F = fn(f64) -> f64> {
    resolution: usize,
    metallicity: f64,
    min_smoothstep_width: usize,
    max_smoothstep_width: usize,
    function_count: usize,
    smoothstep: F,
}

impl<F: Fn(f64) -> f64> SmoothStepBasis<F> {
    pub fn new(
        resolution: usize,
        metallicity: f64,
        min_smoothstep_width: usize,
        max_smoothstep_width: usize,
        function_count: usize,
        smoothstep: F,
    ) -> Self {
        assert!(resolution >= 1, "resolution must be greater than zero");
        assert!(function_count >= 2, "a library needs at least two functions");

        let min_smoothstep_width = min_smoothstep_width.clamp(1, resolution);
        Self {
            resolution,
            metallicity: metallicity.clamp(0.0, 1.0),
            min_smoothstep_width,
            max_smoothstep_width: max_smoothstep_width.max(min_smoothstep_width),
            function_count,
            smoothstep,
        }
    }

    /// Where function `k`'s transition window ends, in domain units.
    #[inline]
    fn remapped_index(&self, function_index: usize) -> f64 {
        function_index as f64 * (self.resolution - self.min_smoothstep_width) as f64
            / (self.function_count - 1) as f64
    }
}

impl<F: Fn(f64) -> f64> BasisFunctions for SmoothStepBasis<F> {
    fn evaluate(&self, function_index: usize, value: usize) -> f64 {
        let remapped_index = self.remapped_index(function_index);

        if (value as f64) < remapped_index + self.min_smoothstep_width as f64 {
            // The effective width can't extend past the low end of the domain.
            let effective_width =
                (self.max_smoothstep_width as f64).min(remapped_index + self.min_smoothstep_width as f64);

            // Distance from the end of the transition window back to `value`.
            let domain_index = self.min_smoothstep_width as f64 + remapped_index - value as f64;

            if domain_index < effective_width {
                (self.smoothstep)(domain_index / effective_width)
            } else {
                1.0
            }
        } else {
            0.0
        }
    }

    fn function_count(&self) -> usize {
        self.function_count
    }

    fn optimized_domain_size(&self) -> usize {
        self.resolution
    }

    fn metallicity(&self) -> f64 {
        self.metallicity
    }

    fn first_function_index_for_domain_value(&self, value: usize) -> usize {
        // Inverse of the remapping: the last function whose window has fully
        // closed before `value`, plus one. Guarded against going negative for
        // values inside the very first window.
        let first = ((value as f64 - self.min_smoothstep_width as f64)
            * (self.function_count - 1) as f64
            / (self.resolution - self.min_smoothstep_width) as f64)
            .floor() as isize
            + 1;
        first.max(0) as usize
    }

    fn last_function_index_for_domain_value(&self, _value: usize) -> usize {
        // Wide windows mean any function can still be mid-transition at any
        // domain value, so no function is guaranteed saturated.
        self.function_count - 1
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;

    use super::*;

    #[test]
    fn monotone_in_value_and_bounded() {
        let basis = SmoothStepBasis::new(16, 0.0, 1, 6, 8, smoothstep);

        for k in 0..basis.function_count() {
            let mut previous = f64::INFINITY;
            for value in 0..=16 {
                let f = basis.evaluate(k, value);
                assert!((0.0..=1.0).contains(&f), "function {k} at {value}: {f}");
                assert!(f <= previous, "function {k} must decrease with value");
                previous = f;
            }
        }
    }

    #[test]
    fn first_index_is_consistent_with_evaluate() {
        let basis = SmoothStepBasis::new(16, 0.0, 2, 5, 8, smoothstep);

        for value in 0..16 {
            let k_first = basis.first_function_index_for_domain_value(value);
            for k in 0..k_first.min(basis.function_count()) {
                assert_eq!(
                    basis.evaluate(k, value),
                    0.0,
                    "function {k} below the first index must be zero at {value}"
                );
            }
        }
    }

    #[test]
    fn first_function_matches_plain_smoothstep() {
        // Function 0 transitions over exactly the minimum width starting at
        // the low end of the domain.
        let basis = SmoothStepBasis::new(8, 0.0, 4, 4, 8, smoothstep);

        assert_approx_eq!(f64, basis.evaluate(0, 0), 1.0);
        assert_approx_eq!(f64, basis.evaluate(0, 1), smoothstep(0.75));
        assert_approx_eq!(f64, basis.evaluate(0, 2), smoothstep(0.5));
        assert_approx_eq!(f64, basis.evaluate(0, 3), smoothstep(0.25));
        assert_approx_eq!(f64, basis.evaluate(0, 4), 0.0);
    }
}
