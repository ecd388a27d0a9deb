//! Damped iterative refinement of the per-texel normal field.

use std::cell::RefCell;

use nalgebra::Vector3;
use optimization::error_report::ErrorReport;
use optimization::iteration::DoubleBuffered;

use crate::settings::{NormalOptimizationSettings, TextureResolution};

/// Per-texel unit normals plus the damping factors steering how aggressive
/// the next refinement attempt may be.
#[derive(Clone, Debug)]
pub struct NormalField {
    resolution: TextureResolution,
    normals: Vec<Vector3<f64>>,
    damping: Vec<f64>,
    minimum_damping: f64,
}

impl NormalField {
    /// A flat field pointing straight up, with damping at 1.0 everywhere.
    pub fn new(resolution: TextureResolution) -> Self {
        Self::with_minimum_damping(resolution, 1.0)
    }

    /// A flat field whose damping floor (and initial damping) is `minimum`;
    /// estimators lowering the damping through [`Self::set_damping`] cannot
    /// go below it.
    pub fn with_minimum_damping(resolution: TextureResolution, minimum: f64) -> Self {
        let texel_count = resolution.texel_count();
        Self {
            resolution,
            normals: vec![Vector3::z(); texel_count],
            damping: vec![minimum.max(1.0); texel_count],
            minimum_damping: minimum,
        }
    }

    pub fn resolution(&self) -> TextureResolution {
        self.resolution
    }

    pub fn normal(&self, texel: usize) -> Vector3<f64> {
        self.normals[texel]
    }

    /// Stores a normal, renormalizing it; a degenerate (near-zero) candidate
    /// leaves the existing normal in place.
    pub fn set_normal(&mut self, texel: usize, normal: Vector3<f64>) {
        if let Some(unit) = normal.try_normalize(1e-12) {
            self.normals[texel] = unit;
        }
    }

    pub fn damping(&self, texel: usize) -> f64 {
        self.damping[texel]
    }

    /// Stores a damping factor, clamped to the field's configured minimum.
    pub fn set_damping(&mut self, texel: usize, damping: f64) {
        self.damping[texel] = damping.max(self.minimum_damping);
    }

    /// Low-pass filters the field. Each pass replaces a normal with the
    /// renormalized sum of its clamped 2D neighbors plus the corresponding
    /// normal of the pre-smoothing field, which anchors the result so
    /// repeated passes cannot erase genuine detail entirely.
    pub fn smooth(&mut self, passes: usize) {
        if passes == 0 {
            return;
        }

        let width = self.resolution.width;
        let height = self.resolution.height;
        let anchor = self.normals.clone();

        for _ in 0..passes {
            let previous = self.normals.clone();

            for y in 0..height {
                for x in 0..width {
                    let p = y * width + x;
                    let mut sum = anchor[p];

                    if x > 0 {
                        sum += previous[p - 1];
                    }
                    if x + 1 < width {
                        sum += previous[p + 1];
                    }
                    if y > 0 {
                        sum += previous[p - width];
                    }
                    if y + 1 < height {
                        sum += previous[p + width];
                    }

                    if let Some(unit) = sum.try_normalize(1e-12) {
                        self.normals[p] = unit;
                    }
                }
            }
        }
    }
}

/// Supplier of candidate normal updates and of the error metric that judges
/// them, typically backed by the rendering pipeline that produced the
/// samples.
pub trait NormalEstimator {
    /// Proposes a refined field into `candidate`, starting from the accepted
    /// `current` state. Implementations may consult and update the per-texel
    /// damping factors to steer step size.
    fn estimate(&mut self, current: &NormalField, candidate: &mut NormalField);

    /// Total error of the model under `candidate` normals.
    fn error(&mut self, candidate: &NormalField) -> f64;
}

/// Refines the normal field, in one of two modes.
///
/// With Levenberg-Marquardt enabled, each iteration proposes a candidate and
/// keeps it only if the estimator's error did not regress past the
/// previously accepted value, so the stored error never ends up worse than
/// it was before the call. Otherwise a single pass runs and is accepted
/// regardless of error.
pub fn refine(
    field: NormalField,
    estimator: &mut dyn NormalEstimator,
    report: &mut ErrorReport,
    settings: &NormalOptimizationSettings,
    convergence_tolerance: f64,
) -> NormalField {
    let mut buffers = DoubleBuffered::new(field);
    let estimator = RefCell::new(estimator);

    if settings.levenberg_marquardt_enabled {
        buffers.run_until_convergence(
            |current, candidate| estimator.borrow_mut().estimate(current, candidate),
            |candidate| estimator.borrow_mut().error(candidate),
            report,
            convergence_tolerance,
            settings.unsuccessful_iterations_allowed,
        );
    } else {
        buffers.run_once(|current, candidate| {
            estimator.borrow_mut().estimate(current, candidate)
        });
        report.set_error(estimator.borrow_mut().error(buffers.front()));
    }

    let mut refined = buffers.into_front();
    refined.smooth(settings.smoothing_iterations);
    refined
}
