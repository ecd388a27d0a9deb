//! Running totals maintained while sweeping sorted samples into the fitting
//! system.

use nalgebra::{DMatrix, DVector};

use super::MatrixBuilderSample;

/// Running totals over the samples visited so far, kept per pair of optimized
/// instances (matrices) and per instance and channel (vectors).
///
/// The cumulative totals keep accumulating for the whole sweep; the
/// non-cumulative ones apply only to a single bucket and are cleared whenever
/// the bucket advances, after they have been flushed into the fitting system.
pub struct MatrixBuilderSums {
    weighted_analytic_cumulative: DMatrix<f64>,
    weighted_analytic: DMatrix<f64>,
    weighted_analytic_blended: DMatrix<f64>,
    weighted_analytic_squared_cumulative: DMatrix<f64>,
    weighted_analytic_squared: DMatrix<f64>,
    weighted_analytic_squared_blended: DMatrix<f64>,
    weighted_analytic_squared_blended_squared: DMatrix<f64>,
    weighted_analytic_times_observed_cumulative: Vec<DVector<f64>>,
    weighted_analytic_times_observed: Vec<DVector<f64>>,
    weighted_analytic_times_observed_blended: Vec<DVector<f64>>,
}

impl MatrixBuilderSums {
    pub fn new(instance_count: usize, observation_count: usize) -> Self {
        let matrix = || DMatrix::zeros(instance_count, instance_count);
        let vectors = || {
            (0..observation_count)
                .map(|_| DVector::zeros(instance_count))
                .collect()
        };

        Self {
            weighted_analytic_cumulative: matrix(),
            weighted_analytic: matrix(),
            weighted_analytic_blended: matrix(),
            weighted_analytic_squared_cumulative: matrix(),
            weighted_analytic_squared: matrix(),
            weighted_analytic_squared_blended: matrix(),
            weighted_analytic_squared_blended_squared: matrix(),
            weighted_analytic_times_observed_cumulative: vectors(),
            weighted_analytic_times_observed: vectors(),
            weighted_analytic_times_observed_blended: vectors(),
        }
    }

    /// Folds one sample into the running totals.
    pub fn accept(&mut self, sample: &MatrixBuilderSample) {
        let instance_count = self.weighted_analytic_cumulative.nrows();
        let observation_count = self.weighted_analytic_times_observed.len();

        for b1 in 0..instance_count {
            let single_weighted_analytic =
                sample.analytic * sample.instance_weight(b1) * sample.sample_weight;

            for channel in 0..observation_count {
                let weighted_observed = single_weighted_analytic * sample.observed[channel];
                self.weighted_analytic_times_observed[channel][b1] += weighted_observed;
                self.weighted_analytic_times_observed_cumulative[channel][b1] += weighted_observed;
                self.weighted_analytic_times_observed_blended[channel][b1] +=
                    sample.blending_weight * weighted_observed;
            }

            for b2 in 0..instance_count {
                let weighted_analytic = single_weighted_analytic * sample.instance_weight(b2);
                self.weighted_analytic[(b1, b2)] += weighted_analytic;
                self.weighted_analytic_cumulative[(b1, b2)] += weighted_analytic;
                self.weighted_analytic_blended[(b1, b2)] +=
                    sample.blending_weight * weighted_analytic;

                let weighted_analytic_squared = weighted_analytic * sample.analytic;
                self.weighted_analytic_squared[(b1, b2)] += weighted_analytic_squared;
                self.weighted_analytic_squared_cumulative[(b1, b2)] += weighted_analytic_squared;

                let squared_blended = sample.blending_weight * weighted_analytic_squared;
                self.weighted_analytic_squared_blended[(b1, b2)] += squared_blended;
                self.weighted_analytic_squared_blended_squared[(b1, b2)] +=
                    sample.blending_weight * squared_blended;
            }
        }
    }

    /// Clears the totals that apply to a single bucket. Called whenever the
    /// interpolation endpoints change, after the totals have been applied to
    /// the fitting system; the cumulative totals keep accumulating.
    pub fn clear_non_cumulative(&mut self) {
        self.weighted_analytic.fill(0.0);
        self.weighted_analytic_blended.fill(0.0);
        self.weighted_analytic_squared.fill(0.0);
        self.weighted_analytic_squared_blended.fill(0.0);
        self.weighted_analytic_squared_blended_squared.fill(0.0);
        for vector in &mut self.weighted_analytic_times_observed {
            vector.fill(0.0);
        }
        for vector in &mut self.weighted_analytic_times_observed_blended {
            vector.fill(0.0);
        }
    }

    pub fn weighted_analytic_cumulative(&self) -> &DMatrix<f64> {
        &self.weighted_analytic_cumulative
    }

    pub fn weighted_analytic(&self) -> &DMatrix<f64> {
        &self.weighted_analytic
    }

    pub fn weighted_analytic_blended(&self) -> &DMatrix<f64> {
        &self.weighted_analytic_blended
    }

    pub fn weighted_analytic_squared_cumulative(&self) -> &DMatrix<f64> {
        &self.weighted_analytic_squared_cumulative
    }

    pub fn weighted_analytic_squared(&self) -> &DMatrix<f64> {
        &self.weighted_analytic_squared
    }

    pub fn weighted_analytic_squared_blended(&self) -> &DMatrix<f64> {
        &self.weighted_analytic_squared_blended
    }

    pub fn weighted_analytic_squared_blended_squared(&self) -> &DMatrix<f64> {
        &self.weighted_analytic_squared_blended_squared
    }

    pub fn weighted_analytic_times_observed_cumulative(&self, channel: usize) -> &DVector<f64> {
        &self.weighted_analytic_times_observed_cumulative[channel]
    }

    pub fn weighted_analytic_times_observed(&self, channel: usize) -> &DVector<f64> {
        &self.weighted_analytic_times_observed[channel]
    }

    pub fn weighted_analytic_times_observed_blended(&self, channel: usize) -> &DVector<f64> {
        &self.weighted_analytic_times_observed_blended[channel]
    }
}
