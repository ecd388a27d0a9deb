//! Reconstruction of the basis specular curves and diffuse albedos from the
//! full sample stream.

use std::f64::consts::PI;

use nalgebra::Vector3;
use optimization::function::{
    BasisFunctions, MatrixBuilder, MatrixBuilderSample, OptimizedFunctions,
};
use optimization::matrix_system::MatrixSystem;
use rayon::prelude::*;

use crate::decomposition::Decomposition;
use crate::error::Result;
use crate::samples::ReflectanceStream;

/// Builds the matrix contribution for a single view from its visible
/// samples, using the decomposition's current per-texel weights as the fixed
/// instance weights.
fn view_contribution<B: BasisFunctions + ?Sized>(
    stream: &dyn ReflectanceStream,
    view: usize,
    decomposition: &Decomposition,
    basis_library: &B,
) -> MatrixSystem {
    let basis_count = decomposition.basis().basis_count();
    let resolution = basis_library.optimized_domain_size();

    let samples: Vec<MatrixBuilderSample> = stream
        .view_samples(view)
        .iter()
        .enumerate()
        .filter(|(_, sample)| sample.is_visible())
        .map(|(texel, sample)| {
            MatrixBuilderSample::new(
                sample.halfway_index * resolution as f64,
                resolution,
                sample.geom_ratio,
                sample.weight,
                decomposition.weights(texel),
                sample.color.to_vec(),
            )
        })
        .collect();

    MatrixBuilder::new(basis_count, 3, basis_library.metallicity(), basis_library).build(samples)
}

/// Rebuilds the decomposition's basis functions: one matrix contribution per
/// view (in parallel), reduced into a global system, then one non-negative
/// solve per color channel.
///
/// Basis instances whose coefficients solve to all-zero received no sample
/// support; they are cleared and left inactive rather than treated as an
/// error.
pub fn reconstruct_basis<B: BasisFunctions + Sync + ?Sized>(
    stream: &dyn ReflectanceStream,
    decomposition: &mut Decomposition,
    basis_library: &B,
) -> Result<()> {
    let basis_count = decomposition.basis().basis_count();
    let dim = basis_count * (basis_library.function_count() + 1);

    // Shared reborrow for the parallel builders; the solve below is the
    // first thing that mutates the decomposition again.
    let current: &Decomposition = decomposition;
    let system = (0..stream.view_count())
        .into_par_iter()
        .map(|view| view_contribution(stream, view, current, basis_library))
        .reduce(
            || MatrixSystem::new(dim, 3),
            |mut merged, contribution| {
                merged.add_contribution(&contribution);
                merged
            },
        );
    debug!("merged matrix contributions from {} views", stream.view_count());

    let solved = OptimizedFunctions::solve_non_negative(basis_library, &system)?;

    let basis_resolution = decomposition.basis().basis_resolution();
    let basis = decomposition.basis_mut();

    for b in 0..basis_count {
        if !solved.is_instance_non_zero(b) {
            trace!("basis {b} solved to zero; marking inactive");
            basis.clear_basis(b);
            continue;
        }

        let albedo =
            Vector3::from_fn(|channel, _| solved.true_constant_term(b, channel) * PI);
        basis.set_diffuse_albedo(b, albedo);

        for channel in 0..3 {
            solved.evaluate_non_constant_solution(b, channel, &mut |value, m| {
                if m <= basis_resolution {
                    basis.set_specular_value(channel, m, b, value);
                }
            });
        }
    }

    Ok(())
}
