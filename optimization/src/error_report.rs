//! Tracking of the global error metric across iterations.

/// Tracks the current and previously accepted error of an iterative
/// optimization, so that an iteration whose result regressed can be rejected.
#[derive(Clone, Debug)]
pub struct ErrorReport {
    sample_count: usize,
    error: f64,
    previous_error: f64,
}

impl ErrorReport {
    /// Creates a report with both errors initialized to infinity so that the
    /// first iteration is always accepted.
    pub fn new(sample_count: usize) -> Self {
        Self {
            sample_count,
            error: f64::INFINITY,
            previous_error: f64::INFINITY,
        }
    }

    pub fn error(&self) -> f64 {
        self.error
    }

    pub fn previous_error(&self) -> f64 {
        self.previous_error
    }

    pub fn sample_count(&self) -> usize {
        self.sample_count
    }

    /// Records a newly measured error; the old value becomes the previous
    /// error.
    pub fn set_error(&mut self, error: f64) {
        self.previous_error = self.error;
        self.error = error;
    }

    /// Discards the most recent measurement, restoring the previously
    /// accepted error.
    pub fn reject(&mut self) {
        self.error = self.previous_error;
    }
}
