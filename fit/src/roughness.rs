//! Re-fitting of per-texel roughness and reflectivity from the current basis
//! and weights.

use std::f64::consts::PI;
use std::path::Path;

use image::{ImageBuffer, Luma, Rgb};
use nalgebra::Vector3;
use optimization::error_report::ErrorReport;
use optimization::iteration::DoubleBuffered;
use rayon::prelude::*;

use crate::decomposition::Decomposition;
use crate::error::Result;
use crate::settings::{RoughnessStrategy, TextureResolution};

/// One roughness-fitting strategy, selected via configuration.
pub trait RoughnessOptimization {
    /// Resets the fitted parameters to their initial state.
    fn clear(&mut self);

    /// Re-fits roughness and reflectivity for every texel from the
    /// decomposition's current basis and weights.
    fn execute(&mut self, decomposition: &Decomposition) -> Result<()>;

    /// Per-texel GGX roughness.
    fn roughness(&self) -> &[f64];

    /// Per-texel specular reflectivity (RGB).
    fn reflectivity(&self) -> &[Vector3<f64>];

    /// Writes `roughness.png` and `reflectivity.png` into `directory`.
    fn save_textures(&self, directory: &Path) -> Result<()>;
}

pub fn create_roughness_optimization(
    strategy: RoughnessStrategy,
    resolution: TextureResolution,
) -> Box<dyn RoughnessOptimization> {
    match strategy {
        RoughnessStrategy::Simple => Box::new(SimpleRoughnessOptimization::new(resolution)),
        RoughnessStrategy::Iterative {
            unsuccessful_iterations_allowed,
        } => Box::new(IterativeRoughnessOptimization::new(
            resolution,
            unsuccessful_iterations_allowed,
        )),
    }
}

/// The GGX microfacet normal distribution at halfway angle `theta`.
fn ggx_distribution(alpha: f64, cos_theta: f64) -> f64 {
    let alpha_squared = alpha * alpha;
    let denominator = cos_theta * cos_theta * (alpha_squared - 1.0) + 1.0;
    alpha_squared / (PI * denominator * denominator)
}

/// The per-texel specular curve obtained by blending the basis curves with
/// the texel's weights.
fn blended_curve(decomposition: &Decomposition, texel: usize) -> Vec<Vector3<f64>> {
    let basis = decomposition.basis();
    let weights = decomposition.weights(texel);

    (0..=basis.basis_resolution())
        .map(|m| {
            let mut value = Vector3::zeros();
            for b in 0..basis.basis_count() {
                value += Vector3::from_fn(|channel, _| basis.specular_value(channel, m, b))
                    * weights[b];
            }
            value
        })
        .collect()
}

/// Fits `reflectivity * D(alpha)` against the curve for a fixed `alpha`,
/// returning the closed-form reflectivity and the squared residual.
fn fit_reflectivity(curve: &[Vector3<f64>], alpha: f64) -> (Vector3<f64>, f64) {
    let resolution = curve.len() - 1;

    let mut numerator = Vector3::zeros();
    let mut denominator = 0.0;
    for (m, value) in curve.iter().enumerate() {
        // Buckets cover halfway angles from 0 to 90 degrees.
        let cos_theta = (m as f64 / resolution as f64 * PI / 2.0).cos();
        let d = ggx_distribution(alpha, cos_theta);
        numerator += value * d;
        denominator += d * d;
    }

    let reflectivity = if denominator > 0.0 {
        (numerator / denominator).map(|v| v.max(0.0))
    } else {
        Vector3::zeros()
    };

    let mut residual = 0.0;
    for (m, value) in curve.iter().enumerate() {
        let cos_theta = (m as f64 / resolution as f64 * PI / 2.0).cos();
        let d = ggx_distribution(alpha, cos_theta);
        residual += (value - reflectivity * d).norm_squared();
    }

    (reflectivity, residual)
}

/// Best fit over a fixed log-spaced grid of roughness candidates.
fn grid_search(curve: &[Vector3<f64>]) -> (f64, Vector3<f64>, f64) {
    const CANDIDATES: usize = 32;
    const ALPHA_MIN: f64 = 0.01;

    let mut best = (1.0, Vector3::zeros(), f64::INFINITY);
    for i in 0..CANDIDATES {
        let alpha = ALPHA_MIN * (1.0 / ALPHA_MIN).powf(i as f64 / (CANDIDATES - 1) as f64);
        let (reflectivity, residual) = fit_reflectivity(curve, alpha);
        if residual < best.2 {
            best = (alpha, reflectivity, residual);
        }
    }
    best
}

/// Single-pass strategy: per texel, a grid search over roughness with a
/// closed-form reflectivity fit at each candidate.
pub struct SimpleRoughnessOptimization {
    resolution: TextureResolution,
    roughness: Vec<f64>,
    reflectivity: Vec<Vector3<f64>>,
}

impl SimpleRoughnessOptimization {
    pub fn new(resolution: TextureResolution) -> Self {
        let texel_count = resolution.texel_count();
        Self {
            resolution,
            roughness: vec![1.0; texel_count],
            reflectivity: vec![Vector3::zeros(); texel_count],
        }
    }
}

impl RoughnessOptimization for SimpleRoughnessOptimization {
    fn clear(&mut self) {
        self.roughness.fill(1.0);
        for value in &mut self.reflectivity {
            *value = Vector3::zeros();
        }
    }

    fn execute(&mut self, decomposition: &Decomposition) -> Result<()> {
        let fitted: Vec<(f64, Vector3<f64>)> = (0..self.resolution.texel_count())
            .into_par_iter()
            .map(|texel| {
                let curve = blended_curve(decomposition, texel);
                let (alpha, reflectivity, _) = grid_search(&curve);
                (alpha, reflectivity)
            })
            .collect();

        for (texel, (alpha, reflectivity)) in fitted.into_iter().enumerate() {
            self.roughness[texel] = alpha;
            self.reflectivity[texel] = reflectivity;
        }
        Ok(())
    }

    fn roughness(&self) -> &[f64] {
        &self.roughness
    }

    fn reflectivity(&self) -> &[Vector3<f64>] {
        &self.reflectivity
    }

    fn save_textures(&self, directory: &Path) -> Result<()> {
        save_parameter_textures(directory, self.resolution, &self.roughness, &self.reflectivity)
    }
}

#[derive(Clone)]
struct IterativeState {
    roughness: Vec<f64>,
    reflectivity: Vec<Vector3<f64>>,
    damping: Vec<f64>,
    residual: f64,
}

/// Damped iterative strategy: seeds from the grid search, then repeatedly
/// proposes per-texel roughness perturbations whose magnitude shrinks as the
/// per-texel damping factor grows, accepting an iteration only when the total
/// residual improves.
pub struct IterativeRoughnessOptimization {
    resolution: TextureResolution,
    unsuccessful_iterations_allowed: usize,
    roughness: Vec<f64>,
    reflectivity: Vec<Vector3<f64>>,
}

impl IterativeRoughnessOptimization {
    pub fn new(resolution: TextureResolution, unsuccessful_iterations_allowed: usize) -> Self {
        let texel_count = resolution.texel_count();
        Self {
            resolution,
            unsuccessful_iterations_allowed,
            roughness: vec![1.0; texel_count],
            reflectivity: vec![Vector3::zeros(); texel_count],
        }
    }
}

impl RoughnessOptimization for IterativeRoughnessOptimization {
    fn clear(&mut self) {
        self.roughness.fill(1.0);
        for value in &mut self.reflectivity {
            *value = Vector3::zeros();
        }
    }

    fn execute(&mut self, decomposition: &Decomposition) -> Result<()> {
        let texel_count = self.resolution.texel_count();
        let curves: Vec<Vec<Vector3<f64>>> = (0..texel_count)
            .into_par_iter()
            .map(|texel| blended_curve(decomposition, texel))
            .collect();

        // Seed from the single-pass fit.
        let mut initial = IterativeState {
            roughness: vec![1.0; texel_count],
            reflectivity: vec![Vector3::zeros(); texel_count],
            damping: vec![1.0; texel_count],
            residual: 0.0,
        };
        for texel in 0..texel_count {
            let (alpha, reflectivity, residual) = grid_search(&curves[texel]);
            initial.roughness[texel] = alpha;
            initial.reflectivity[texel] = reflectivity;
            initial.residual += residual;
        }

        let mut buffers = DoubleBuffered::new(initial);
        let mut report = ErrorReport::new(texel_count);
        report.set_error(buffers.front().residual);

        buffers.run_until_convergence(
            |current, candidate| {
                let refined: Vec<(f64, Vector3<f64>, f64, f64)> = (0..texel_count)
                    .into_par_iter()
                    .map(|texel| {
                        refine_texel(
                            &curves[texel],
                            current.roughness[texel],
                            current.damping[texel],
                        )
                    })
                    .collect();

                candidate.residual = 0.0;
                for (texel, (alpha, reflectivity, residual, damping)) in
                    refined.into_iter().enumerate()
                {
                    candidate.roughness[texel] = alpha;
                    candidate.reflectivity[texel] = reflectivity;
                    candidate.damping[texel] = damping;
                    candidate.residual += residual;
                }
            },
            |candidate| candidate.residual,
            &mut report,
            0.0,
            self.unsuccessful_iterations_allowed,
        );

        let converged = buffers.into_front();
        self.roughness = converged.roughness;
        self.reflectivity = converged.reflectivity;
        Ok(())
    }

    fn roughness(&self) -> &[f64] {
        &self.roughness
    }

    fn reflectivity(&self) -> &[Vector3<f64>] {
        &self.reflectivity
    }

    fn save_textures(&self, directory: &Path) -> Result<()> {
        save_parameter_textures(directory, self.resolution, &self.roughness, &self.reflectivity)
    }
}

/// One damped refinement step for a single texel: tries roughness scaled up
/// and down by a factor that shrinks with damping, keeps the best of the
/// three, and adjusts the damping for the next attempt.
fn refine_texel(
    curve: &[Vector3<f64>],
    alpha: f64,
    damping: f64,
) -> (f64, Vector3<f64>, f64, f64) {
    const MAX_DAMPING: f64 = 1024.0;

    let step = 1.0 + 0.5 / damping;
    let candidates = [alpha, (alpha * step).min(1.0), (alpha / step).max(1e-4)];

    let mut best = (alpha, Vector3::zeros(), f64::INFINITY);
    for &candidate in &candidates {
        let (reflectivity, residual) = fit_reflectivity(curve, candidate);
        if residual < best.2 {
            best = (candidate, reflectivity, residual);
        }
    }

    // A step that moved the roughness succeeded: relax the damping so the
    // next attempt can move further. Otherwise tighten it.
    let next_damping = if best.0 != alpha {
        (damping * 0.5).max(1.0)
    } else {
        (damping * 2.0).min(MAX_DAMPING)
    };

    (best.0, best.1, best.2, next_damping)
}

fn save_parameter_textures(
    directory: &Path,
    resolution: TextureResolution,
    roughness: &[f64],
    reflectivity: &[Vector3<f64>],
) -> Result<()> {
    let width = resolution.width as u32;
    let height = resolution.height as u32;
    let quantize = |value: f64| (value.clamp(0.0, 1.0) * 255.0).round() as u8;

    // Row 0 of the texel buffer maps to the bottom image row.
    let mut roughness_image = ImageBuffer::new(width, height);
    let mut reflectivity_image = ImageBuffer::new(width, height);
    for (texel, &alpha) in roughness.iter().enumerate() {
        let x = (texel % resolution.width) as u32;
        let y = height - 1 - (texel / resolution.width) as u32;
        roughness_image.put_pixel(x, y, Luma([quantize(alpha)]));

        let value = reflectivity[texel];
        reflectivity_image.put_pixel(
            x,
            y,
            Rgb([quantize(value[0]), quantize(value[1]), quantize(value[2])]),
        );
    }

    roughness_image.save(directory.join("roughness.png"))?;
    reflectivity_image.save(directory.join("reflectivity.png"))?;
    Ok(())
}
