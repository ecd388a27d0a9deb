//! The outer convergence controller alternating basis, weight, normal, and
//! roughness sub-problems.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use optimization::error_report::ErrorReport;
use optimization::function::BasisFunctions;
use rayon::prelude::*;

use crate::brdf;
use crate::decomposition::{Decomposition, MaterialBasis};
use crate::error::{FitError, Result};
use crate::normal::{self, NormalEstimator, NormalField};
use crate::roughness::{create_roughness_optimization, RoughnessOptimization};
use crate::samples::ReflectanceStream;
use crate::settings::SpecularFitSettings;
use crate::weights;

/// Cooperative cancellation flag, checked between outer iterations and
/// between weight blocks; a cancelled run leaves the last fully committed
/// state intact.
#[derive(Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(FitError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Summary of a finished run.
#[derive(Clone, Copy, Debug)]
pub struct FitStatistics {
    pub outer_iterations: usize,
    pub final_error: f64,
    pub sample_count: usize,
}

/// The outcome of a full fit, including the roughness strategy with its
/// fitted per-texel parameters.
pub struct FitResult {
    pub decomposition: Decomposition,
    pub normals: NormalField,
    pub roughness: Box<dyn RoughnessOptimization>,
    pub statistics: FitStatistics,
}

/// Weighted mean squared error of the current decomposition against every
/// visible sample, together with the visible-sample count.
pub fn mean_squared_error(
    stream: &dyn ReflectanceStream,
    decomposition: &Decomposition,
    optimize_reflectance: bool,
) -> (f64, usize) {
    let basis = decomposition.basis();
    let basis_count = basis.basis_count();
    let resolution = basis.basis_resolution();

    let (residual, total_weight, count) = (0..stream.view_count())
        .into_par_iter()
        .map(|view| {
            let mut residual = 0.0;
            let mut total_weight = 0.0;
            let mut count = 0usize;

            for (texel, sample) in stream.view_samples(view).iter().enumerate() {
                if !sample.is_visible() {
                    continue;
                }

                let m_exact = sample.halfway_index * resolution as f64;
                let texel_weights = decomposition.weights(texel);

                let mut model = nalgebra::Vector3::zeros();
                for b in 0..basis_count {
                    model += basis.evaluate_brdf(b, m_exact, sample.geom_ratio)
                        * texel_weights[b];
                }
                if !optimize_reflectance {
                    model *= sample.n_dot_l;
                }

                let observed = nalgebra::Vector3::from_column_slice(&sample.color);
                residual += sample.weight * (model - observed).norm_squared();
                total_weight += sample.weight;
                count += 1;
            }

            (residual, total_weight, count)
        })
        .reduce(
            || (0.0, 0.0, 0),
            |a, b| (a.0 + b.0, a.1 + b.1, a.2 + b.2),
        );

    if total_weight > 0.0 {
        (residual / total_weight, count)
    } else {
        (0.0, 0)
    }
}

/// Runs the full alternating optimization from scratch.
///
/// Each outer iteration reconstructs the basis, re-solves weights block by
/// block, recomputes the error, optionally refines normals (rejecting the
/// refinement if the iteration's error regressed), and re-fits roughness.
/// The loop stops after a single iteration when there is nothing to
/// alternate (one basis function, refinement disabled), and otherwise once
/// the error improvement drops to the preliminary tolerance.
pub fn optimize_from_scratch(
    stream: &dyn ReflectanceStream,
    settings: &SpecularFitSettings,
    mut normal_estimator: Option<&mut dyn NormalEstimator>,
    cancellation: &CancellationToken,
) -> Result<FitResult> {
    let basis_library = settings.basis.create_basis();
    let mut decomposition = Decomposition::new(settings.resolution, &settings.basis);
    let mut normals =
        NormalField::with_minimum_damping(settings.resolution, settings.normal.minimum_damping);
    let mut roughness = create_roughness_optimization(settings.roughness_strategy, settings.resolution);

    if settings.normal.refinement_enabled && normal_estimator.is_none() {
        warn!("normal refinement enabled but no estimator supplied; skipping refinement");
    }

    let mut report = ErrorReport::new(0);
    let mut outer_iterations = 0;
    let mut sample_count = 0;

    loop {
        cancellation.check()?;
        let previous_error = report.error();

        run_iteration(
            stream,
            settings,
            &basis_library,
            &mut decomposition,
            &mut normals,
            normal_estimator.as_deref_mut(),
            roughness.as_mut(),
            &mut report,
            &mut sample_count,
            settings.preliminary_convergence_tolerance,
            cancellation,
        )?;

        outer_iterations += 1;
        info!(
            "outer iteration {outer_iterations} finished; error {:.6e}",
            report.error()
        );

        let alternating =
            settings.basis.basis_count > 1 || settings.normal.refinement_enabled;
        if !(alternating && previous_error - report.error() > settings.preliminary_convergence_tolerance)
        {
            break;
        }
    }

    decomposition.fill_holes();

    Ok(FitResult {
        decomposition,
        normals,
        roughness,
        statistics: FitStatistics {
            outer_iterations,
            final_error: report.error(),
            sample_count,
        },
    })
}

/// Re-solves weights, normals, and roughness for a previously computed
/// basis, e.g. at full resolution after a preliminary low-resolution solve.
/// The basis itself is not touched; the per-iteration tail is otherwise the
/// same as in [`optimize_from_scratch`], under the tighter convergence
/// tolerance.
pub fn optimize_from_existing_basis(
    stream: &dyn ReflectanceStream,
    basis: MaterialBasis,
    settings: &SpecularFitSettings,
    mut normal_estimator: Option<&mut dyn NormalEstimator>,
    cancellation: &CancellationToken,
) -> Result<FitResult> {
    let mut decomposition = Decomposition::with_basis(settings.resolution, basis);
    let mut normals =
        NormalField::with_minimum_damping(settings.resolution, settings.normal.minimum_damping);
    let mut roughness = create_roughness_optimization(settings.roughness_strategy, settings.resolution);

    if settings.normal.refinement_enabled && normal_estimator.is_none() {
        warn!("normal refinement enabled but no estimator supplied; skipping refinement");
    }

    let mut report = ErrorReport::new(0);
    let mut outer_iterations = 0;
    let mut sample_count = 0;

    loop {
        cancellation.check()?;
        let previous_error = report.error();

        weight_and_normal_iteration(
            stream,
            settings,
            &mut decomposition,
            &mut normals,
            normal_estimator.as_deref_mut(),
            roughness.as_mut(),
            &mut report,
            &mut sample_count,
            settings.convergence_tolerance,
            cancellation,
        )?;

        outer_iterations += 1;
        info!(
            "existing-basis iteration {outer_iterations} finished; error {:.6e}",
            report.error()
        );

        let alternating =
            settings.basis.basis_count > 1 || settings.normal.refinement_enabled;
        if !(alternating && previous_error - report.error() > settings.convergence_tolerance) {
            break;
        }
    }

    decomposition.fill_holes();

    Ok(FitResult {
        decomposition,
        normals,
        roughness,
        statistics: FitStatistics {
            outer_iterations,
            final_error: report.error(),
            sample_count,
        },
    })
}

#[allow(clippy::too_many_arguments)]
fn run_iteration<B: BasisFunctions + Sync>(
    stream: &dyn ReflectanceStream,
    settings: &SpecularFitSettings,
    basis_library: &B,
    decomposition: &mut Decomposition,
    normals: &mut NormalField,
    normal_estimator: Option<&mut (dyn NormalEstimator + '_)>,
    roughness: &mut dyn RoughnessOptimization,
    report: &mut ErrorReport,
    sample_count: &mut usize,
    convergence_tolerance: f64,
    cancellation: &CancellationToken,
) -> Result<()> {
    brdf::reconstruct_basis(stream, decomposition, basis_library)?;

    weight_and_normal_iteration(
        stream,
        settings,
        decomposition,
        normals,
        normal_estimator,
        roughness,
        report,
        sample_count,
        convergence_tolerance,
        cancellation,
    )
}

/// The per-iteration tail shared by both run modes: weight blocks, the error
/// metric, optional normal refinement, and the roughness re-fit.
#[allow(clippy::too_many_arguments)]
fn weight_and_normal_iteration(
    stream: &dyn ReflectanceStream,
    settings: &SpecularFitSettings,
    decomposition: &mut Decomposition,
    normals: &mut NormalField,
    normal_estimator: Option<&mut (dyn NormalEstimator + '_)>,
    roughness: &mut dyn RoughnessOptimization,
    report: &mut ErrorReport,
    sample_count: &mut usize,
    convergence_tolerance: f64,
    cancellation: &CancellationToken,
) -> Result<()> {
    let previous_error = report.error();

    if settings.basis.basis_count > 1 {
        optimize_weight_blocks(stream, settings, decomposition, cancellation)?;
    }

    let (error, count) = mean_squared_error(stream, decomposition, settings.optimize_reflectance);
    *sample_count = count;
    report.set_error(error);

    if report.error() > 0.0 && settings.normal.refinement_enabled {
        if let Some(estimator) = normal_estimator {
            let snapshot = normals.clone();
            *normals = normal::refine(
                normals.clone(),
                estimator,
                report,
                &settings.normal,
                convergence_tolerance,
            );

            // Outer-granularity safety net: if this iteration still ended
            // worse than the last accepted one, drop its normal result.
            if report.error() > previous_error {
                *normals = snapshot;
                report.reject();
            }
        }
    }

    // May raise the error slightly; accepted unconditionally because the
    // roughness parameters are outputs, not inputs to the next iteration.
    roughness.execute(decomposition)?;

    Ok(())
}

fn optimize_weight_blocks(
    stream: &dyn ReflectanceStream,
    settings: &SpecularFitSettings,
    decomposition: &mut Decomposition,
    cancellation: &CancellationToken,
) -> Result<()> {
    let texel_count = settings.resolution.texel_count();
    let block_size = settings.weight_block_size.max(1);
    let block_count = (texel_count + block_size - 1) / block_size;

    decomposition.invalidate_weights();

    for block in 0..block_count {
        cancellation.check()?;

        let start = block * block_size;
        let end = (start + block_size).min(texel_count);
        debug!("solving weights for block {} ({start}..{end})", block + 1);

        let solved = weights::solve_block(
            stream,
            decomposition,
            start,
            end,
            settings.optimize_reflectance,
        )?;
        weights::commit_block(decomposition, solved);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use super::*;
    use crate::samples::{InMemoryStream, ReflectanceSample};
    use crate::settings::TextureResolution;

    fn diffuse_stream(texture: TextureResolution, view_count: usize) -> InMemoryStream {
        let texel_count = texture.texel_count();
        let mut samples = Vec::with_capacity(view_count * texel_count);
        for view in 0..view_count {
            for texel in 0..texel_count {
                samples.push(ReflectanceSample {
                    color: [0.25 / PI; 3],
                    visibility: 1.0,
                    halfway_index: ((view + texel) % 8) as f64 / 8.0,
                    geom_ratio: 1.0,
                    weight: 1.0,
                    n_dot_l: 1.0,
                });
            }
        }
        InMemoryStream::new(view_count, texel_count, samples)
    }

    fn single_basis_settings(texture: TextureResolution) -> SpecularFitSettings {
        let mut settings = SpecularFitSettings::new(texture);
        settings.basis.basis_count = 1;
        settings.basis.basis_resolution = 8;
        settings.basis.basis_complexity = 8;
        settings.normal.refinement_enabled = false;
        settings.weight_block_size = 4;
        settings
    }

    #[test]
    fn single_basis_without_refinement_runs_exactly_one_iteration() {
        let texture = TextureResolution::new(4, 2);
        let stream = diffuse_stream(texture, 3);
        let settings = single_basis_settings(texture);

        let result = optimize_from_scratch(
            &stream,
            &settings,
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        assert_eq!(result.statistics.outer_iterations, 1);
        // A perfectly diffuse scene fits exactly.
        assert!(result.statistics.final_error < 1e-12);
        assert!(
            (result.decomposition.basis().diffuse_albedo(0)[0] - 0.25).abs() < 1e-6
        );
    }

    #[test]
    fn alternating_run_terminates_and_fills_holes() {
        let texture = TextureResolution::new(4, 2);
        let stream = diffuse_stream(texture, 4);

        let mut settings = single_basis_settings(texture);
        settings.basis.basis_count = 2;
        settings.preliminary_convergence_tolerance = 1e-9;

        let result = optimize_from_scratch(
            &stream,
            &settings,
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(result.statistics.outer_iterations >= 1);
        for texel in 0..texture.texel_count() {
            assert!(result.decomposition.is_valid(texel));
        }
    }

    #[test]
    fn cancellation_surfaces_as_an_error() {
        let texture = TextureResolution::new(2, 2);
        let stream = diffuse_stream(texture, 2);
        let settings = single_basis_settings(texture);

        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result = optimize_from_scratch(&stream, &settings, None, &cancellation);
        assert!(matches!(result, Err(FitError::Cancelled)));
    }

    #[test]
    fn existing_basis_run_reuses_the_basis_unchanged() {
        let texture = TextureResolution::new(2, 2);
        let stream = diffuse_stream(texture, 3);

        let mut settings = single_basis_settings(texture);
        settings.basis.basis_count = 2;

        let mut basis = MaterialBasis::new(2, 8, 0.0);
        basis.set_diffuse_albedo(0, nalgebra::Vector3::new(0.25, 0.25, 0.25));
        basis.set_diffuse_albedo(1, nalgebra::Vector3::new(0.9, 0.9, 0.9));
        let before = basis.clone();

        let result = optimize_from_existing_basis(
            &stream,
            basis,
            &settings,
            None,
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(result.statistics.outer_iterations >= 1);
        for b in 0..2 {
            assert_eq!(
                result.decomposition.basis().diffuse_albedo(b),
                before.diffuse_albedo(b)
            );
        }
        // The observations match basis 0 exactly, so the weights select it.
        for texel in 0..texture.texel_count() {
            assert!(result.decomposition.is_valid(texel));
            assert!(result.decomposition.weights(texel)[0] > 0.99);
        }
    }

    /// Tilts every normal toward a fixed target; the error is the remaining
    /// distance to it.
    struct TiltToward {
        target: nalgebra::Vector3<f64>,
    }

    impl NormalEstimator for TiltToward {
        fn estimate(&mut self, current: &NormalField, candidate: &mut NormalField) {
            for p in 0..current.resolution().texel_count() {
                let step = current.normal(p) + (self.target - current.normal(p)) * 0.5;
                candidate.set_normal(p, step);
            }
        }

        fn error(&mut self, candidate: &NormalField) -> f64 {
            (0..candidate.resolution().texel_count())
                .map(|p| (candidate.normal(p) - self.target).norm_squared())
                .sum()
        }
    }

    #[test]
    fn existing_basis_run_refines_normals_and_roughness() {
        let texture = TextureResolution::new(2, 2);
        let stream = diffuse_stream(texture, 3);

        let mut settings = single_basis_settings(texture);
        settings.normal.refinement_enabled = true;
        settings.normal.unsuccessful_iterations_allowed = 2;

        // Deliberately off from the observed 0.25 albedo so the residual is
        // non-zero and the refinement stage actually engages.
        let mut basis = MaterialBasis::new(1, 8, 0.0);
        basis.set_diffuse_albedo(0, nalgebra::Vector3::new(0.3, 0.3, 0.3));

        let target = nalgebra::Vector3::new(0.6, 0.0, 0.8);
        let mut estimator = TiltToward { target };

        let result = optimize_from_existing_basis(
            &stream,
            basis,
            &settings,
            Some(&mut estimator),
            &CancellationToken::new(),
        )
        .unwrap();

        assert!(result.statistics.outer_iterations >= 1);
        assert_eq!(
            result.decomposition.basis().diffuse_albedo(0),
            nalgebra::Vector3::new(0.3, 0.3, 0.3)
        );
        // The estimator ran and converged toward its target.
        for p in 0..texture.texel_count() {
            assert!((result.normals.normal(p) - target).norm() < 0.1);
        }
        // The roughness strategy ran against the final decomposition.
        for texel in 0..texture.texel_count() {
            assert!(result.roughness.roughness()[texel] < 1.0);
        }
    }
}
