//! Configuration for a specular fit run.

use optimization::function::{smoothstep, SmoothStepBasis};

/// Dimensions of the texture space the fit operates over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextureResolution {
    pub width: usize,
    pub height: usize,
}

impl TextureResolution {
    pub fn new(width: usize, height: usize) -> Self {
        Self { width, height }
    }

    pub fn texel_count(&self) -> usize {
        self.width * self.height
    }
}

/// Shape parameters for the specular basis.
#[derive(Clone, Copy, Debug)]
pub struct SpecularBasisSettings {
    /// Number of basis functions (B).
    pub basis_count: usize,
    /// Number of microfacet-distribution buckets (M); the discretized curves
    /// have `M + 1` elements.
    pub basis_resolution: usize,
    /// Metallicity assumed for the whole material, in [0, 1].
    pub metallicity: f64,
    /// Narrowest allowed specular lobe, as a fraction of the resolution.
    pub specular_min_width: f64,
    /// Widest allowed specular lobe, as a fraction of the resolution.
    pub specular_smoothness: f64,
    /// Number of library functions available to represent each basis curve.
    pub basis_complexity: usize,
}

impl SpecularBasisSettings {
    /// Instantiates the smoothstep library described by these settings.
    pub fn create_basis(&self) -> SmoothStepBasis {
        SmoothStepBasis::new(
            self.basis_resolution,
            self.metallicity,
            (self.specular_min_width * self.basis_resolution as f64).round() as usize,
            (self.specular_smoothness * self.basis_resolution as f64).round() as usize,
            self.basis_complexity,
            smoothstep,
        )
    }
}

impl Default for SpecularBasisSettings {
    fn default() -> Self {
        Self {
            basis_count: 8,
            basis_resolution: 90,
            metallicity: 0.0,
            specular_min_width: 0.0,
            specular_smoothness: 1.0,
            basis_complexity: 90,
        }
    }
}

/// Settings for the damped normal-refinement stage.
#[derive(Clone, Copy, Debug)]
pub struct NormalOptimizationSettings {
    /// Outer gate: when false, normal optimization is skipped entirely and
    /// no estimator is consulted.
    pub refinement_enabled: bool,
    /// When true the estimator runs inside the damped accept/reject loop;
    /// when false a single estimation pass runs and is accepted as-is.
    pub levenberg_marquardt_enabled: bool,
    /// Lower bound for the per-texel damping factor.
    pub minimum_damping: f64,
    /// Number of low-pass smoothing passes applied after refinement.
    pub smoothing_iterations: usize,
    /// Consecutive non-improving refinement iterations tolerated before the
    /// inner loop gives up.
    pub unsuccessful_iterations_allowed: usize,
}

impl Default for NormalOptimizationSettings {
    fn default() -> Self {
        Self {
            refinement_enabled: true,
            levenberg_marquardt_enabled: true,
            minimum_damping: 1.0,
            smoothing_iterations: 0,
            unsuccessful_iterations_allowed: 8,
        }
    }
}

/// Which roughness-fitting strategy the controller should run after each
/// outer iteration.
#[derive(Clone, Copy, Debug)]
pub enum RoughnessStrategy {
    /// Single-pass grid search with a closed-form reflectivity fit.
    Simple,
    /// Damped iterative refinement seeded from the simple fit.
    Iterative {
        unsuccessful_iterations_allowed: usize,
    },
}

/// Top-level settings for one fit run.
#[derive(Clone, Copy, Debug)]
pub struct SpecularFitSettings {
    pub resolution: TextureResolution,
    pub basis: SpecularBasisSettings,
    pub normal: NormalOptimizationSettings,
    pub roughness_strategy: RoughnessStrategy,
    /// Error-delta threshold that terminates full-resolution / per-block
    /// solves.
    pub convergence_tolerance: f64,
    /// Looser threshold used for the preliminary from-scratch solve.
    pub preliminary_convergence_tolerance: f64,
    /// Number of texels whose weights are solved per block; bounds peak
    /// memory during weight optimization.
    pub weight_block_size: usize,
    /// When true the samples are treated as raw reflectance and the n.l
    /// factor is omitted from the fit.
    pub optimize_reflectance: bool,
}

impl SpecularFitSettings {
    pub fn new(resolution: TextureResolution) -> Self {
        Self {
            resolution,
            basis: SpecularBasisSettings::default(),
            normal: NormalOptimizationSettings::default(),
            roughness_strategy: RoughnessStrategy::Simple,
            convergence_tolerance: 1e-5,
            preliminary_convergence_tolerance: 1e-3,
            weight_block_size: 2048,
            optimize_reflectance: true,
        }
    }
}
