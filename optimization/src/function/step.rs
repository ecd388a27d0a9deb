//! Hard step-function basis library.

use super::BasisFunctions;

/// A library of hard step functions: function `k` evaluates to 1.0 for domain
/// values up to and including `k` and 0.0 beyond, so each function transitions
/// over exactly one bucket.
pub struct StepBasis {
    resolution: usize,
    metallicity: f64,
}

impl StepBasis {
    pub fn new(resolution: usize, metallicity: f64) -> Self {
        assert!(resolution >= 1, "resolution must be greater than zero");
        Self {
            resolution,
            metallicity: metallicity.clamp(0.0, 1.0),
        }
    }
}

impl BasisFunctions for StepBasis {
    fn evaluate(&self, function_index: usize, value: usize) -> f64 {
        if value <= function_index {
            1.0
        } else {
            0.0
        }
    }

    fn function_count(&self) -> usize {
        self.resolution
    }

    fn optimized_domain_size(&self) -> usize {
        self.resolution
    }

    fn metallicity(&self) -> f64 {
        self.metallicity
    }

    fn first_function_index_for_domain_value(&self, value: usize) -> usize {
        value
    }

    fn last_function_index_for_domain_value(&self, value: usize) -> usize {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluates_as_step() {
        let basis = StepBasis::new(4, 0.0);
        assert_eq!(basis.evaluate(2, 0), 1.0);
        assert_eq!(basis.evaluate(2, 2), 1.0);
        assert_eq!(basis.evaluate(2, 3), 0.0);
    }

    #[test]
    fn solution_recovery_is_cumulative() {
        let basis = StepBasis::new(4, 0.0);
        let coefficients = [0.1, 0.2, 0.3, 0.4];

        let mut curve = vec![0.0; 5];
        basis.evaluate_solution(
            0.5,
            &|k| coefficients[k],
            &mut |value, m| curve[m] = value,
        );

        // Constant term is scaled by metallicity (zero here); each earlier
        // element adds its step coefficient onto the next.
        assert_eq!(curve[4], 0.0);
        assert!((curve[3] - 0.4).abs() < 1e-12);
        assert!((curve[2] - 0.7).abs() < 1e-12);
        assert!((curve[1] - 0.9).abs() < 1e-12);
        assert!((curve[0] - 1.0).abs() < 1e-12);
    }
}
