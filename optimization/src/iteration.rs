//! Double-buffered iterative refinement with reject-on-regression.

use crate::error_report::ErrorReport;

/// Drives an iterative estimation process that refines a state in place.
///
/// Two copies of the state are kept (front and back). Each iteration reads
/// the accepted front state and writes a candidate into the back state; the
/// buffers are then swapped so the candidate becomes current. When an error
/// callback reports a regression, the swap is reverted and the previously
/// accepted state is restored, so the front buffer never gets worse.
pub struct DoubleBuffered<T> {
    front: T,
    back: T,
}

impl<T: Clone> DoubleBuffered<T> {
    pub fn new(initial: T) -> Self {
        Self {
            front: initial.clone(),
            back: initial,
        }
    }
}

impl<T> DoubleBuffered<T> {
    /// The most recently accepted state.
    pub fn front(&self) -> &T {
        &self.front
    }

    pub fn front_mut(&mut self) -> &mut T {
        &mut self.front
    }

    /// Consumes the driver, returning the accepted state.
    pub fn into_front(self) -> T {
        self.front
    }

    fn swap(&mut self) {
        std::mem::swap(&mut self.front, &mut self.back);
    }

    /// Runs a single estimation pass and accepts the result unconditionally.
    pub fn run_once(&mut self, mut estimate: impl FnMut(&T, &mut T)) {
        estimate(&self.front, &mut self.back);
        self.swap();
    }

    /// Runs a single estimation pass and reverts it if the error got worse.
    /// The error callback sees the candidate state before any revert happens.
    pub fn run_once_checked(
        &mut self,
        estimate: impl FnMut(&T, &mut T),
        error_calculator: impl FnOnce(&T) -> f64,
        report: &mut ErrorReport,
    ) {
        self.run_once(estimate);

        report.set_error(error_calculator(&self.front));
        if report.error() > report.previous_error() {
            // Error is worse; reject the new estimate.
            self.swap();
            report.reject();
        }
    }

    /// Repeats checked passes until the error improvement stays at or below
    /// `convergence_tolerance` for `unsuccessful_iterations_allowed`
    /// consecutive iterations.
    pub fn run_until_convergence(
        &mut self,
        mut estimate: impl FnMut(&T, &mut T),
        mut error_calculator: impl FnMut(&T) -> f64,
        report: &mut ErrorReport,
        convergence_tolerance: f64,
        unsuccessful_iterations_allowed: usize,
    ) {
        let mut unsuccessful_iterations = 0;

        while unsuccessful_iterations < unsuccessful_iterations_allowed {
            let previous_error = report.error();
            self.run_once_checked(&mut estimate, &mut error_calculator, report);

            if previous_error - report.error() <= convergence_tolerance {
                unsuccessful_iterations += 1;
            } else {
                unsuccessful_iterations = 0;
            }
        }
    }
}
