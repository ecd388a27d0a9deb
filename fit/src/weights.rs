//! Per-texel weight optimization against a fixed basis.

use nalgebra::{DMatrix, DVector, Vector3};
use optimization::function::{median_positive, NNLS_TOLERANCE_SCALE};
use optimization::nnls;
use rayon::prelude::*;

use crate::decomposition::Decomposition;
use crate::error::Result;
use crate::samples::ReflectanceStream;

/// The solved weights for one texel, produced by [`solve_block`] and applied
/// by [`commit_block`].
pub struct TexelWeights {
    texel: usize,
    weights: Option<DVector<f64>>,
}

/// Solves the weight vectors for texels in `[block_start, block_end)`.
///
/// Per texel, a `(B + 1) x (B + 1)` normal-equation system is assembled: the
/// first `B` rows fit the per-basis BRDF values against the observed colors,
/// and the final augmented row constrains the weights to sum to one. Texels
/// with no visible sample in any view stay unsolved (and will be marked
/// invalid on commit).
///
/// Texels are independent, so the block is solved in parallel; nothing is
/// written to the decomposition here, which keeps cancellation between
/// blocks from leaving partially updated weights behind.
pub fn solve_block(
    stream: &dyn ReflectanceStream,
    decomposition: &Decomposition,
    block_start: usize,
    block_end: usize,
    optimize_reflectance: bool,
) -> Result<Vec<TexelWeights>> {
    let basis = decomposition.basis();
    let basis_count = basis.basis_count();
    let resolution = basis.basis_resolution();

    (block_start..block_end.min(stream.texel_count()))
        .into_par_iter()
        .map(|texel| {
            let mut qtq = DMatrix::zeros(basis_count + 1, basis_count + 1);
            let mut qtr = DVector::zeros(basis_count + 1);
            let mut visible = false;

            for view in 0..stream.view_count() {
                let sample = stream.view_samples(view)[texel];
                if !sample.is_visible() {
                    continue;
                }
                visible = true;

                let m_exact = sample.halfway_index * resolution as f64;
                let predicted: Vec<Vector3<f64>> = (0..basis_count)
                    .map(|b| basis.evaluate_brdf(b, m_exact, sample.geom_ratio))
                    .collect();
                let observed = Vector3::from_column_slice(&sample.color);

                let weight_squared = sample.weight * sample.weight;
                // Raw-reflectance samples already have the cosine factored
                // out.
                let n_dot_l_squared = if optimize_reflectance {
                    1.0
                } else {
                    sample.n_dot_l * sample.n_dot_l
                };
                let contribution_weight = weight_squared * n_dot_l_squared;

                for b1 in 0..basis_count {
                    qtr[b1] += contribution_weight * predicted[b1].dot(&observed);
                    for b2 in 0..basis_count {
                        qtq[(b1, b2)] += contribution_weight * predicted[b1].dot(&predicted[b2]);
                    }
                }
            }

            if !visible {
                return Ok(TexelWeights {
                    texel,
                    weights: None,
                });
            }

            // Sum-to-one constraint as an augmented row/column.
            for b in 0..basis_count {
                qtq[(basis_count, b)] = 1.0;
                qtq[(b, basis_count)] = 1.0;
            }
            qtr[basis_count] = 1.0;

            let tolerance = NNLS_TOLERANCE_SCALE * median_positive(&qtr);
            let solution =
                nnls::solve_premultiplied_with_equality_constraints(&qtq, &qtr, tolerance, 1)?;

            // Drop the Lagrange multiplier.
            Ok(TexelWeights {
                texel,
                weights: Some(solution.rows(0, basis_count).into_owned()),
            })
        })
        .collect()
}

/// Writes a solved block into the decomposition, marking texels valid when a
/// solution exists and explicitly invalid otherwise.
pub fn commit_block(decomposition: &mut Decomposition, block: Vec<TexelWeights>) {
    for solved in block {
        match solved.weights {
            Some(weights) => {
                decomposition.set_weights(solved.texel, weights);
                decomposition.set_weights_validity(solved.texel, true);
            }
            None => decomposition.set_weights_validity(solved.texel, false),
        }
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;
    use std::f64::consts::PI;

    use super::*;
    use crate::samples::{InMemoryStream, ReflectanceSample};
    use crate::settings::{SpecularBasisSettings, TextureResolution};

    fn two_basis_decomposition(texture: TextureResolution) -> Decomposition {
        let settings = SpecularBasisSettings {
            basis_count: 2,
            basis_resolution: 4,
            ..SpecularBasisSettings::default()
        };
        let mut decomposition = Decomposition::new(texture, &settings);

        // Basis 0: pure diffuse gray. Basis 1: specular ramp, no diffuse.
        let basis = decomposition.basis_mut();
        basis.set_diffuse_albedo(0, Vector3::new(0.5, 0.5, 0.5));
        for m in 0..=4 {
            let value = 1.0 - m as f64 / 4.0;
            for channel in 0..3 {
                basis.set_specular_value(channel, m, 1, value);
            }
        }
        decomposition
    }

    fn observe(decomposition: &Decomposition, weights: [f64; 2], halfway_index: f64) -> ReflectanceSample {
        let basis = decomposition.basis();
        let m_exact = halfway_index * basis.basis_resolution() as f64;
        let color: Vector3<f64> = (0..2)
            .map(|b| basis.evaluate_brdf(b, m_exact, 1.0) * weights[b])
            .sum();

        ReflectanceSample {
            color: [color[0], color[1], color[2]],
            visibility: 1.0,
            halfway_index,
            geom_ratio: 1.0,
            weight: 1.0,
            n_dot_l: 1.0,
        }
    }

    #[test]
    fn solved_weights_are_non_negative_and_sum_to_one() {
        let texture = TextureResolution::new(2, 1);
        let mut decomposition = two_basis_decomposition(texture);

        let true_weights = [[0.3, 0.7], [0.9, 0.1]];
        let view_count = 5;
        let mut samples = Vec::new();
        for view in 0..view_count {
            for texel in 0..2 {
                samples.push(observe(
                    &decomposition,
                    true_weights[texel],
                    view as f64 / view_count as f64,
                ));
            }
        }
        let stream = InMemoryStream::new(view_count, 2, samples);

        let block = solve_block(&stream, &decomposition, 0, 2, true).unwrap();
        commit_block(&mut decomposition, block);

        for texel in 0..2 {
            assert!(decomposition.is_valid(texel));
            let weights = decomposition.weights(texel);

            let mut sum = 0.0;
            for b in 0..2 {
                assert!(weights[b] >= 0.0, "texel {texel} weight {b} negative");
                sum += weights[b];
            }
            assert_approx_eq!(f64, sum, 1.0, epsilon = 1e-6);

            // Noise-free observations of a two-basis mix: the solve recovers
            // the generating weights.
            assert_approx_eq!(f64, weights[0], true_weights[texel][0], epsilon = 1e-6);
            assert_approx_eq!(f64, weights[1], true_weights[texel][1], epsilon = 1e-6);
        }
    }

    #[test]
    fn invisible_texels_are_marked_invalid() {
        let texture = TextureResolution::new(2, 1);
        let mut decomposition = two_basis_decomposition(texture);
        decomposition.set_weights_validity(1, true);

        let mut samples = vec![ReflectanceSample::default(); 2];
        samples[0] = observe(&decomposition, [1.0, 0.0], 0.5);
        let stream = InMemoryStream::new(1, 2, samples);

        let block = solve_block(&stream, &decomposition, 0, 2, true).unwrap();
        commit_block(&mut decomposition, block);

        assert!(decomposition.is_valid(0));
        assert!(!decomposition.is_valid(1));
    }

    #[test]
    fn cosine_weighting_applies_when_fitting_radiance() {
        // A single observation with n.l = 0: in radiance mode it contributes
        // nothing, so the texel solves like an unconstrained corner case with
        // the equality row only.
        let texture = TextureResolution::new(1, 1);
        let decomposition = two_basis_decomposition(texture);

        let mut sample = observe(&decomposition, [0.3, 0.7], 0.25);
        sample.n_dot_l = 0.0;
        let stream = InMemoryStream::new(1, 1, vec![sample]);

        let block = solve_block(&stream, &decomposition, 0, 1, false).unwrap();
        let weights = block[0].weights.as_ref().expect("visible texel");
        let sum: f64 = weights.iter().sum();
        assert_approx_eq!(f64, sum, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn diffuse_term_uses_lambertian_normalization() {
        let decomposition = two_basis_decomposition(TextureResolution::new(1, 1));
        let brdf = decomposition.basis().evaluate_brdf(0, 8.0, 1.0);
        // Past the domain, non-metallic: diffuse only.
        assert_approx_eq!(f64, brdf[0], 0.5 / PI);
    }
}
