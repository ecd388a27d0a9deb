//! Specular BRDF decomposition: fits a compact basis-lobe reflectance model,
//! per-texel blend weights, diffuse albedo, and refined normals to measured
//! reflectance samples.
//!
//! The numerical machinery (sorted-sweep matrix assembly, constrained NNLS,
//! damped double-buffered iteration) lives in the `optimization` crate; this
//! crate applies it to the reflectance domain and orchestrates the
//! alternating outer loop.

#[macro_use]
extern crate log;

pub mod brdf;
pub mod decomposition;
pub mod error;
pub mod normal;
pub mod optimize;
pub mod roughness;
pub mod samples;
pub mod serializer;
pub mod settings;
pub mod weights;
