//! Sort-and-sweep assembly of the basis-fitting normal equations.

use crate::matrix_system::MatrixSystem;

use super::{BasisFunctions, MatrixBuilderSample, MatrixBuilderSums};

/// Builds the premultiplied fitting system for one batch of samples.
///
/// A sample at bucket `m` influences every matrix element whose bucket index
/// is `>= m`, so a naive assembly costs `O(samples * M * B^2)`. Instead, the
/// samples are sorted by domain position and swept once: running totals
/// accumulate per bucket and are flushed into the matrix only when the sweep
/// advances to a new bucket, bringing the cost down to
/// `O(samples * B^2 + M * B^2)`.
///
/// Each builder owns its own scratch state and output system, so independent
/// batches (one per view) can be built in parallel and merged afterwards with
/// [`MatrixSystem::add_contribution`].
pub struct MatrixBuilder<'a, B: BasisFunctions + ?Sized> {
    instance_count: usize,
    observation_count: usize,
    metallicity: f64,
    basis_library: &'a B,
    sums: MatrixBuilderSums,
    contribution: MatrixSystem,
    previous_floor: Option<usize>,
}

impl<'a, B: BasisFunctions + ?Sized> MatrixBuilder<'a, B> {
    pub fn new(
        instance_count: usize,
        observation_count: usize,
        metallicity: f64,
        basis_library: &'a B,
    ) -> Self {
        let dim = instance_count * (basis_library.function_count() + 1);
        Self {
            instance_count,
            observation_count,
            metallicity,
            basis_library,
            sums: MatrixBuilderSums::new(instance_count, observation_count),
            contribution: MatrixSystem::new(dim, observation_count),
            previous_floor: None,
        }
    }

    pub fn metallicity(&self) -> f64 {
        self.metallicity
    }

    pub fn basis_library(&self) -> &B {
        self.basis_library
    }

    /// The constant term (i.e. diffuse for a BRDF), which incorporates the
    /// analytic factor in proportion to the metallicity.
    fn constant_term(&self, analytic: f64) -> f64 {
        self.metallicity * analytic + (1.0 - self.metallicity)
    }

    /// Sorts the samples, sweeps them into the system, and returns the
    /// finished contribution.
    pub fn build(mut self, mut samples: Vec<MatrixBuilderSample>) -> MatrixSystem {
        // Ascending order, so low buckets are visited first and each flush of
        // the running totals covers every sample at or below the bucket.
        samples.sort_unstable_by(|a, b| a.exact.total_cmp(&b.exact));

        for sample in &samples {
            self.process_sample(sample);
        }
        self.finish();
        self.contribution
    }

    fn process_sample(&mut self, sample: &MatrixBuilderSample) {
        let previous_floor = self.previous_floor.unwrap_or(0);
        debug_assert!(previous_floor <= sample.floor);

        // Bucket advanced: flush the running totals accumulated for the
        // previous bucket into the matrix, then reset the totals that apply
        // to a single bucket only.
        if sample.floor > previous_floor {
            self.basis_library.contribute_to_fitting_system(
                previous_floor,
                sample.floor,
                self.instance_count,
                &self.sums,
                &mut self.contribution,
            );
            self.sums.clear_non_cumulative();
        }

        let constant_term = self.constant_term(sample.analytic);
        let constant_term_squared = constant_term * constant_term;

        if sample.in_optimized_domain {
            self.sums.accept(sample);
        }

        // The constant-term rows and columns gain nothing from deferral, so
        // they are updated for every sample directly.
        for b1 in 0..self.instance_count {
            for channel in 0..self.observation_count {
                self.contribution.add_to_rhs(
                    b1,
                    channel,
                    sample.instance_weight(b1)
                        * sample.sample_weight
                        * sample.observed[channel]
                        * constant_term,
                );
            }

            for b2 in 0..self.instance_count {
                let weight_product = sample.instance_weight(b1)
                    * sample.instance_weight(b2)
                    * sample.sample_weight;
                self.contribution
                    .add_to_lhs(b1, b2, weight_product * constant_term_squared);
            }
        }

        self.previous_floor = Some(sample.floor);
    }

    /// Flushes the totals for the final bucket; without this the samples at
    /// the top of the optimized domain would never reach the matrix.
    fn finish(&mut self) {
        if let Some(floor) = self.previous_floor {
            self.basis_library.contribute_to_fitting_system(
                floor,
                self.basis_library.optimized_domain_size() - 1,
                self.instance_count,
                &self.sums,
                &mut self.contribution,
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use nalgebra::{DMatrix, DVector};
    use proptest::prelude::*;

    use super::*;
    use crate::function::{smoothstep, SmoothStepBasis, StepBasis};

    /// Reference assembly that materializes the full observation matrix; the
    /// fast sweep must agree with this within a small relative tolerance.
    fn brute_force_system<B: BasisFunctions>(
        samples: &[MatrixBuilderSample],
        library: &B,
        instance_count: usize,
        metallicity: f64,
    ) -> MatrixSystem {
        let dim = instance_count * (library.function_count() + 1);
        let channels = samples.first().map_or(3, |s| s.observed.len());

        let mut a = DMatrix::zeros(samples.len(), dim);
        let mut y: Vec<DVector<f64>> = (0..channels).map(|_| DVector::zeros(samples.len())).collect();

        for (row, sample) in samples.iter().enumerate() {
            // Square root because the weight applies to the squared residual.
            let sqrt_weight = sample.sample_weight.sqrt();
            let t = sample.blending_weight;

            for channel in 0..channels {
                y[channel][row] = sqrt_weight * sample.observed[channel];
            }

            let constant_factor = metallicity * sample.analytic + (1.0 - metallicity);

            for b in 0..instance_count {
                a[(row, b)] = sqrt_weight * sample.instance_weight(b) * constant_factor;

                if sample.in_optimized_domain {
                    for k in 0..library.function_count() {
                        let f_floor = library.evaluate(k, sample.floor);
                        let f_ceil = library.evaluate(k, sample.floor + 1);
                        let f_interp = f_floor * t + f_ceil * (1.0 - t);

                        let j = instance_count * (k + 1) + b;
                        a[(row, j)] = sqrt_weight
                            * sample.analytic
                            * sample.instance_weight(b)
                            * f_interp;
                    }
                }
            }
        }

        let mut system = MatrixSystem::new(dim, channels);
        system.lhs = a.tr_mul(&a);
        for channel in 0..channels {
            system.rhs[channel] = a.tr_mul(&y[channel]);
        }
        system
    }

    fn assert_systems_close(fast: &MatrixSystem, reference: &MatrixSystem) {
        let tolerance = |expected: f64| (expected.abs() * 1e-3).max(1e-9);

        for i in 0..reference.dim() {
            for (channel, rhs) in reference.rhs.iter().enumerate() {
                assert!(
                    (rhs[i] - fast.rhs[channel][i]).abs() <= tolerance(rhs[i]),
                    "rhs channel {channel} row {i}: {} vs {}",
                    rhs[i],
                    fast.rhs[channel][i]
                );
            }
            for j in 0..reference.dim() {
                assert!(
                    (reference.lhs[(i, j)] - fast.lhs[(i, j)]).abs()
                        <= tolerance(reference.lhs[(i, j)]),
                    "lhs ({i}, {j}): {} vs {}",
                    reference.lhs[(i, j)],
                    fast.lhs[(i, j)]
                );
            }
        }
    }

    struct SampleData {
        exact: f64,
        analytic: f64,
        weight: f64,
        observed: [f64; 3],
    }

    fn pseudo_random_data(count: usize, domain_size: usize, seed: u64) -> Vec<SampleData> {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 33) as f64 / (1u64 << 31) as f64
        };

        (0..count)
            .map(|_| SampleData {
                // Allow some samples past the optimized domain.
                exact: next() * (domain_size as f64 * 1.2),
                analytic: next(),
                weight: next(),
                observed: [next(), next(), next()],
            })
            .collect()
    }

    fn build_samples<'a>(
        data: &[SampleData],
        instance_weights: &'a DVector<f64>,
        domain_size: usize,
    ) -> Vec<MatrixBuilderSample<'a>> {
        data.iter()
            .map(|d| {
                MatrixBuilderSample::new(
                    d.exact,
                    domain_size,
                    d.analytic,
                    d.weight,
                    instance_weights,
                    d.observed.to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn sweep_matches_brute_force_step_basis() {
        let domain_size = 4;
        let library = StepBasis::new(domain_size, 0.0);
        let instance_weights = DVector::from_vec(vec![0.6, 0.4]);

        let data = pseudo_random_data(64, domain_size, 7);
        let samples = build_samples(&data, &instance_weights, domain_size);
        let reference = brute_force_system(&samples, &library, 2, 0.0);

        let fast = MatrixBuilder::new(2, 3, 0.0, &library).build(samples);
        assert_systems_close(&fast, &reference);
    }

    #[test]
    fn sweep_matches_brute_force_smoothstep_basis() {
        let domain_size = 8;
        let library = SmoothStepBasis::new(domain_size, 0.5, 1, 4, 8, smoothstep);
        let instance_weights = DVector::from_vec(vec![0.5, 0.3, 0.2]);

        let data = pseudo_random_data(96, domain_size, 13);
        let samples = build_samples(&data, &instance_weights, domain_size);
        let reference = brute_force_system(&samples, &library, 3, 0.5);

        let fast = MatrixBuilder::new(3, 3, 0.5, &library).build(samples);
        assert_systems_close(&fast, &reference);
    }

    proptest! {
        #[test]
        fn sweep_matches_brute_force_for_arbitrary_samples(seed in 1u64..10_000) {
            let domain_size = 4;
            let library = StepBasis::new(domain_size, 0.25);
            let instance_weights = DVector::from_vec(vec![0.7, 0.3]);

            let data = pseudo_random_data(32, domain_size, seed);
            let samples = build_samples(&data, &instance_weights, domain_size);
            let reference = brute_force_system(&samples, &library, 2, 0.25);

            let fast = MatrixBuilder::new(2, 3, 0.25, &library).build(samples);
            assert_systems_close(&fast, &reference);
        }
    }
}
