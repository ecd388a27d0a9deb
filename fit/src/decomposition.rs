//! The solved material representation: basis specular curves, diffuse
//! albedos, and per-texel blend weights.

use nalgebra::{DMatrix, DVector, Vector3};

use crate::settings::{SpecularBasisSettings, TextureResolution};

/// The shared (texel-independent) part of a decomposition: for each basis
/// function, a discretized specular curve per color channel over microfacet
/// buckets `m` in `[0, M]`, plus one diffuse albedo.
#[derive(Clone, Debug)]
pub struct MaterialBasis {
    basis_count: usize,
    basis_resolution: usize,
    metallicity: f64,
    // One (M + 1) x B matrix per color channel.
    specular: [DMatrix<f64>; 3],
    diffuse_albedos: Vec<Vector3<f64>>,
}

impl MaterialBasis {
    pub fn new(basis_count: usize, basis_resolution: usize, metallicity: f64) -> Self {
        let curve = || DMatrix::zeros(basis_resolution + 1, basis_count);
        Self {
            basis_count,
            basis_resolution,
            metallicity,
            specular: [curve(), curve(), curve()],
            diffuse_albedos: vec![Vector3::zeros(); basis_count],
        }
    }

    pub fn from_settings(settings: &SpecularBasisSettings) -> Self {
        Self::new(
            settings.basis_count,
            settings.basis_resolution,
            settings.metallicity,
        )
    }

    pub fn basis_count(&self) -> usize {
        self.basis_count
    }

    pub fn basis_resolution(&self) -> usize {
        self.basis_resolution
    }

    pub fn metallicity(&self) -> f64 {
        self.metallicity
    }

    pub fn specular_value(&self, channel: usize, m: usize, b: usize) -> f64 {
        self.specular[channel][(m, b)]
    }

    pub fn set_specular_value(&mut self, channel: usize, m: usize, b: usize, value: f64) {
        self.specular[channel][(m, b)] = value;
    }

    pub fn diffuse_albedo(&self, b: usize) -> Vector3<f64> {
        self.diffuse_albedos[b]
    }

    pub fn set_diffuse_albedo(&mut self, b: usize, albedo: Vector3<f64>) {
        self.diffuse_albedos[b] = albedo;
    }

    /// Zeroes every curve and albedo of basis `b`.
    pub fn clear_basis(&mut self, b: usize) {
        for channel in &mut self.specular {
            channel.column_mut(b).fill(0.0);
        }
        self.diffuse_albedos[b] = Vector3::zeros();
    }

    /// Specular reflectance of basis `b` at a fractional microfacet bucket,
    /// linearly interpolated between adjacent buckets. Past the top of the
    /// domain only a metallic material keeps reflecting, at the final bucket's
    /// value.
    pub fn evaluate_specular(&self, b: usize, m_exact: f64) -> Vector3<f64> {
        let resolution = self.basis_resolution;

        if m_exact < resolution as f64 {
            let m1 = m_exact.floor().max(0.0) as usize;
            let m2 = m1 + 1;
            let t = m_exact - m1 as f64;

            Vector3::from_fn(|channel, _| {
                (1.0 - t) * self.specular[channel][(m1, b)] + t * self.specular[channel][(m2, b)]
            })
        } else if self.metallicity > 0.0 {
            Vector3::from_fn(|channel, _| self.specular[channel][(resolution, b)])
        } else {
            Vector3::zeros()
        }
    }

    /// Full BRDF value of basis `b` for a sample: Lambertian diffuse plus the
    /// specular curve scaled by the geometric masking/shadowing ratio.
    pub fn evaluate_brdf(&self, b: usize, m_exact: f64, geom_ratio: f64) -> Vector3<f64> {
        self.diffuse_albedos[b] / std::f64::consts::PI
            + self.evaluate_specular(b, m_exact) * geom_ratio
    }
}

/// A full decomposition: the shared basis plus per-texel weight vectors and
/// validity flags.
#[derive(Clone, Debug)]
pub struct Decomposition {
    resolution: TextureResolution,
    basis: MaterialBasis,
    weights_by_texel: Vec<DVector<f64>>,
    weights_validity: Vec<bool>,
}

impl Decomposition {
    /// Creates a decomposition with a zeroed basis and uniform (1/B) weights,
    /// all marked invalid until weight optimization visits them.
    pub fn new(resolution: TextureResolution, basis_settings: &SpecularBasisSettings) -> Self {
        let basis = MaterialBasis::from_settings(basis_settings);
        Self::with_basis(resolution, basis)
    }

    /// Wraps an existing (previously solved) basis with fresh uniform weights.
    pub fn with_basis(resolution: TextureResolution, basis: MaterialBasis) -> Self {
        let texel_count = resolution.texel_count();
        let basis_count = basis.basis_count();
        let uniform = DVector::from_element(basis_count, 1.0 / basis_count as f64);
        Self {
            resolution,
            basis,
            weights_by_texel: vec![uniform; texel_count],
            weights_validity: vec![false; texel_count],
        }
    }

    pub fn resolution(&self) -> TextureResolution {
        self.resolution
    }

    pub fn basis(&self) -> &MaterialBasis {
        &self.basis
    }

    pub fn basis_mut(&mut self) -> &mut MaterialBasis {
        &mut self.basis
    }

    pub fn weights(&self, texel: usize) -> &DVector<f64> {
        &self.weights_by_texel[texel]
    }

    pub fn set_weights(&mut self, texel: usize, weights: DVector<f64>) {
        self.weights_by_texel[texel] = weights;
    }

    pub fn is_valid(&self, texel: usize) -> bool {
        self.weights_validity[texel]
    }

    pub fn set_weights_validity(&mut self, texel: usize, valid: bool) {
        self.weights_validity[texel] = valid;
    }

    /// Marks every texel invalid ahead of a fresh weight-optimization pass.
    pub fn invalidate_weights(&mut self) {
        self.weights_validity.fill(false);
    }

    pub fn valid_texel_count(&self) -> usize {
        self.weights_validity.iter().filter(|&&v| v).count()
    }

    /// Propagates weights into texels that never received a valid
    /// observation, by repeatedly averaging the valid 1D-wrapped neighbors of
    /// each invalid texel.
    ///
    /// Left/right neighbor lookups wrap across row ends (and up/down across
    /// the texture ends) because the neighbors are computed modulo the texel
    /// count rather than clamped in 2D. Kept for compatibility with existing
    /// solves; see the serializer's weight-map convention, which this feeds.
    pub fn fill_holes(&mut self) {
        let texel_count = self.resolution.texel_count();
        let width = self.resolution.width;
        let basis_count = self.basis.basis_count();

        let mut filled = self.weights_validity.clone();
        let mut filled_count = filled.iter().filter(|&&v| v).count();

        // Texels filled during a pass only become usable as neighbors on the
        // next pass, so propagation order within a pass does not matter.
        for _ in 0..self.resolution.width.max(self.resolution.height) {
            if filled_count == texel_count {
                break;
            }

            let mut newly_filled = Vec::new();

            for p in 0..texel_count {
                if filled[p] {
                    continue;
                }

                let neighbors = [
                    (texel_count + p - 1) % texel_count,
                    (p + 1) % texel_count,
                    (texel_count + p - width) % texel_count,
                    (p + width) % texel_count,
                ];

                let mut count = 0;
                for b in 0..basis_count {
                    count = 0;
                    let mut sum = 0.0;
                    for &n in &neighbors {
                        if filled[n] {
                            sum += self.weights_by_texel[n][b];
                            count += 1;
                        }
                    }

                    if sum > 0.0 {
                        self.weights_by_texel[p][b] = sum / count as f64;
                    }
                }

                if count > 0 {
                    newly_filled.push(p);
                }
            }

            filled_count += newly_filled.len();
            for p in newly_filled {
                filled[p] = true;
                self.weights_validity[p] = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use float_cmp::assert_approx_eq;

    use super::*;

    fn single_seed_decomposition(
        resolution: TextureResolution,
        seed_texel: usize,
    ) -> Decomposition {
        let settings = SpecularBasisSettings {
            basis_count: 3,
            basis_resolution: 4,
            ..SpecularBasisSettings::default()
        };
        let mut decomposition = Decomposition::new(resolution, &settings);

        for p in 0..resolution.texel_count() {
            decomposition.set_weights(p, DVector::zeros(3));
        }
        decomposition.set_weights(seed_texel, DVector::from_vec(vec![1.0, 0.0, 0.0]));
        decomposition.set_weights_validity(seed_texel, true);
        decomposition
    }

    #[test]
    fn fill_holes_propagates_from_a_single_corner() {
        let resolution = TextureResolution::new(4, 4);
        let mut decomposition = single_seed_decomposition(resolution, 0);

        decomposition.fill_holes();

        // Every averaged neighbor chain traces back to [1, 0, 0], so the
        // whole grid converges to that exact vector.
        for p in 0..16 {
            assert!(decomposition.is_valid(p), "texel {p} not filled");
            assert_approx_eq!(f64, decomposition.weights(p)[0], 1.0);
            assert_approx_eq!(f64, decomposition.weights(p)[1], 0.0);
            assert_approx_eq!(f64, decomposition.weights(p)[2], 0.0);
        }
    }

    #[test]
    fn neighbor_lookup_wraps_across_row_ends() {
        // The only valid texel sits at the end of row 0; with modular
        // neighbor indexing, texel 4 (start of row 1) counts it as its left
        // neighbor even though the two are not geometrically adjacent.
        let resolution = TextureResolution::new(4, 4);
        let mut decomposition = single_seed_decomposition(resolution, 3);

        decomposition.fill_holes();

        assert!(decomposition.is_valid(4));
        assert_approx_eq!(f64, decomposition.weights(4)[0], 1.0);
    }

    #[test]
    fn evaluate_specular_interpolates_between_buckets() {
        let mut basis = MaterialBasis::new(2, 4, 0.0);
        basis.set_specular_value(0, 1, 0, 2.0);
        basis.set_specular_value(0, 2, 0, 4.0);

        let mid = basis.evaluate_specular(0, 1.5);
        assert_approx_eq!(f64, mid[0], 3.0);
        assert_approx_eq!(f64, mid[1], 0.0);

        // Non-metallic materials stop reflecting past the domain.
        assert_approx_eq!(f64, basis.evaluate_specular(0, 5.0)[0], 0.0);
    }

    #[test]
    fn metallic_basis_extends_past_the_domain() {
        let mut basis = MaterialBasis::new(1, 4, 1.0);
        basis.set_specular_value(1, 4, 0, 0.5);
        assert_approx_eq!(f64, basis.evaluate_specular(0, 6.0)[1], 0.5);
    }
}
