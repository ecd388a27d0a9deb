//! Reflectance observation records and the stream contract that supplies
//! them.

/// One reflectance observation for a (view, texel) pair.
///
/// `halfway_index` is the normalized halfway-angle parameter in [0, 1];
/// multiplying by the basis resolution yields the (fractional) microfacet
/// bucket. `geom_ratio` is the masking/shadowing geometric factor and
/// `weight` an additional combined confidence weight.
#[derive(Clone, Copy, Debug, Default)]
pub struct ReflectanceSample {
    pub color: [f64; 3],
    pub visibility: f64,
    pub halfway_index: f64,
    pub geom_ratio: f64,
    pub weight: f64,
    pub n_dot_l: f64,
}

impl ReflectanceSample {
    #[inline]
    pub fn is_visible(&self) -> bool {
        self.visibility > 0.0
    }
}

/// Supplier of reflectance observations, grouped by view and addressable by
/// texel index within each view.
///
/// The stream is consumed repeatedly (once per weight block plus once per
/// basis reconstruction), so implementations must support repeated iteration
/// over the same data.
pub trait ReflectanceStream: Sync {
    fn view_count(&self) -> usize;

    fn texel_count(&self) -> usize;

    /// All samples for one view, indexed by texel. Texels the view does not
    /// cover carry a zero visibility flag.
    fn view_samples(&self, view: usize) -> &[ReflectanceSample];
}

/// A stream backed by a flat, view-major vector of samples.
pub struct InMemoryStream {
    view_count: usize,
    texel_count: usize,
    samples: Vec<ReflectanceSample>,
}

impl InMemoryStream {
    /// `samples` must hold `view_count * texel_count` records in view-major
    /// order.
    pub fn new(view_count: usize, texel_count: usize, samples: Vec<ReflectanceSample>) -> Self {
        assert_eq!(
            samples.len(),
            view_count * texel_count,
            "sample vector does not match view/texel dimensions"
        );
        Self {
            view_count,
            texel_count,
            samples,
        }
    }
}

impl ReflectanceStream for InMemoryStream {
    fn view_count(&self) -> usize {
        self.view_count
    }

    fn texel_count(&self) -> usize {
        self.texel_count
    }

    fn view_samples(&self, view: usize) -> &[ReflectanceSample] {
        &self.samples[view * self.texel_count..(view + 1) * self.texel_count]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn views_slice_the_backing_vector() {
        let mut samples = vec![ReflectanceSample::default(); 6];
        samples[4].visibility = 1.0;

        let stream = InMemoryStream::new(2, 3, samples);
        assert_eq!(stream.view_count(), 2);
        assert!(!stream.view_samples(0)[1].is_visible());
        assert!(stream.view_samples(1)[1].is_visible());
    }
}
