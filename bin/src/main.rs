//! Command-line driver: reads a reflectance sample dump, runs the specular
//! fit, and writes the solved basis, weight maps, and parameter textures.

#[macro_use]
extern crate log;

mod dump;

use std::fs;
use std::path::PathBuf;

use clap::Parser;
use fit::error::{FitError, Result};
use fit::optimize::{self, CancellationToken};
use fit::samples::ReflectanceStream;
use fit::serializer;
use fit::settings::{RoughnessStrategy, SpecularFitSettings, TextureResolution};

/// Fits a basis-lobe specular BRDF model to a reflectance sample dump.
#[derive(Debug, Parser)]
#[command(version)]
struct Options {
    /// Binary reflectance sample dump to fit against.
    #[arg(value_name = "SAMPLES")]
    input: PathBuf,

    /// Directory the solved textures and CSV are written into.
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output: PathBuf,

    /// Texture width in texels.
    #[arg(long, value_name = "TEXELS")]
    width: usize,

    /// Texture height in texels.
    #[arg(long, value_name = "TEXELS")]
    height: usize,

    /// Number of basis functions (B).
    #[arg(short = 'b', long, value_name = "COUNT", default_value_t = 8)]
    basis_count: usize,

    /// Number of microfacet-distribution buckets (M).
    #[arg(short = 'm', long, value_name = "COUNT", default_value_t = 90)]
    basis_resolution: usize,

    /// Assumed metallicity in [0, 1].
    #[arg(long, value_name = "FRACTION", default_value_t = 0.0)]
    metallicity: f64,

    /// Narrowest specular lobe as a fraction of the resolution.
    #[arg(long, value_name = "FRACTION", default_value_t = 0.0)]
    specular_min_width: f64,

    /// Widest specular lobe as a fraction of the resolution.
    #[arg(long, value_name = "FRACTION", default_value_t = 1.0)]
    specular_smoothness: f64,

    /// Number of library functions per basis curve; defaults to the
    /// resolution.
    #[arg(long, value_name = "COUNT")]
    basis_complexity: Option<usize>,

    /// Error-delta threshold terminating per-block solves.
    #[arg(long, value_name = "DELTA", default_value_t = 1e-5)]
    tolerance: f64,

    /// Looser threshold for the preliminary from-scratch solve.
    #[arg(long, value_name = "DELTA", default_value_t = 1e-3)]
    preliminary_tolerance: f64,

    /// Texels per weight-optimization block.
    #[arg(long, value_name = "TEXELS", default_value_t = 2048)]
    block_size: usize,

    /// Fit radiance (keep the n.l factor) instead of raw reflectance.
    #[arg(long)]
    radiance: bool,

    /// Reuse the basis CSV from a previous solve in this directory instead
    /// of reconstructing from scratch.
    #[arg(long, value_name = "DIR")]
    prior_basis: Option<PathBuf>,

    /// Refit roughness with the damped iterative strategy instead of the
    /// single-pass grid search.
    #[arg(long)]
    iterative_roughness: bool,

    /// Non-improving roughness iterations tolerated before giving up.
    #[arg(long, value_name = "COUNT", default_value_t = 8)]
    unsuccessful_iterations: usize,

    /// Write packed 4-per-image weight maps instead of one map per basis.
    #[arg(long)]
    packed_weight_maps: bool,

    /// Gamma for encoding the blended diffuse map.
    #[arg(long, value_name = "GAMMA", default_value_t = 2.2)]
    gamma: f64,
}

impl Options {
    fn settings(&self) -> SpecularFitSettings {
        let mut settings =
            SpecularFitSettings::new(TextureResolution::new(self.width, self.height));
        settings.basis.basis_count = self.basis_count;
        settings.basis.basis_resolution = self.basis_resolution;
        settings.basis.metallicity = self.metallicity;
        settings.basis.specular_min_width = self.specular_min_width;
        settings.basis.specular_smoothness = self.specular_smoothness;
        settings.basis.basis_complexity =
            self.basis_complexity.unwrap_or(self.basis_resolution);
        // There is no rasterization backend behind this driver to evaluate
        // candidate normals, so refinement stays off.
        settings.normal.refinement_enabled = false;
        settings.roughness_strategy = if self.iterative_roughness {
            RoughnessStrategy::Iterative {
                unsuccessful_iterations_allowed: self.unsuccessful_iterations,
            }
        } else {
            RoughnessStrategy::Simple
        };
        settings.convergence_tolerance = self.tolerance;
        settings.preliminary_convergence_tolerance = self.preliminary_tolerance;
        settings.weight_block_size = self.block_size;
        settings.optimize_reflectance = !self.radiance;
        settings
    }
}

fn run(options: &Options) -> Result<()> {
    let stream = dump::read_sample_dump(&options.input)?;
    info!(
        "loaded {} views x {} texels from {}",
        stream.view_count(),
        stream.texel_count(),
        options.input.display()
    );

    let settings = options.settings();
    if settings.resolution.texel_count() != stream.texel_count() {
        return Err(FitError::Parse(format!(
            "{}x{} does not match the dump's {} texels",
            options.width,
            options.height,
            stream.texel_count()
        )));
    }

    let cancellation = CancellationToken::new();

    let result = match &options.prior_basis {
        Some(directory) => {
            let basis = serializer::load_basis_functions(
                directory,
                settings.basis.basis_count,
                settings.basis.basis_resolution,
                settings.basis.metallicity,
            )?;
            optimize::optimize_from_existing_basis(&stream, basis, &settings, None, &cancellation)?
        }
        None => optimize::optimize_from_scratch(&stream, &settings, None, &cancellation)?,
    };

    info!(
        "converged after {} outer iterations; error {:.6e} over {} samples",
        result.statistics.outer_iterations,
        result.statistics.final_error,
        result.statistics.sample_count
    );

    fs::create_dir_all(&options.output)?;
    serializer::save_basis_functions(&options.output, result.decomposition.basis())?;
    if options.packed_weight_maps {
        serializer::save_packed_weight_maps(&options.output, &result.decomposition)?;
    } else {
        serializer::save_weight_maps(&options.output, &result.decomposition)?;
    }
    serializer::save_diffuse_map(&options.output, &result.decomposition, options.gamma)?;
    result.roughness.save_textures(&options.output)?;

    info!("results written to {}", options.output.display());
    Ok(())
}

fn main() {
    env_logger::init();

    let options = Options::parse();
    if let Err(e) = run(&options) {
        error!("{e}");
        std::process::exit(1);
    }
}
