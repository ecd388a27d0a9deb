//! On-disk persistence of a decomposition: the basis CSV, weight maps, and
//! the blended diffuse map.

use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use image::{GrayImage, ImageBuffer, Rgb, Rgba};
use nalgebra::Vector3;
use regex::Regex;

use crate::decomposition::{Decomposition, MaterialBasis};
use crate::error::{FitError, Result};
use crate::settings::TextureResolution;

pub const BASIS_FUNCTIONS_FILENAME: &str = "basisFunctions.csv";

const CHANNEL_NAMES: [&str; 3] = ["Red", "Green", "Blue"];

/// Formats the basis as CSV: one `"Red#b"` / `"Green#b"` / `"Blue#b"` row of
/// `M + 1` values per (channel, basis) pair, then one `"Diffuse#b"` row of
/// three albedo values per basis.
pub fn format_basis_csv(basis: &MaterialBasis) -> String {
    let mut out = String::new();

    for (channel, name) in CHANNEL_NAMES.iter().enumerate() {
        for b in 0..basis.basis_count() {
            out.push_str(&format!("{name}#{b}"));
            for m in 0..=basis.basis_resolution() {
                out.push_str(&format!(", {}", basis.specular_value(channel, m, b)));
            }
            out.push('\n');
        }
    }

    for b in 0..basis.basis_count() {
        let albedo = basis.diffuse_albedo(b);
        out.push_str(&format!(
            "Diffuse#{b}, {}, {}, {}\n",
            albedo[0], albedo[1], albedo[2]
        ));
    }

    out
}

/// Parses a basis CSV produced by [`format_basis_csv`] (or an external
/// serializer following the same convention). A trailing comma at the end of
/// a row is tolerated. Diffuse rows are optional; when absent the albedos
/// stay zero.
pub fn parse_basis_csv(
    text: &str,
    basis_count: usize,
    basis_resolution: usize,
    metallicity: f64,
) -> Result<MaterialBasis> {
    let separator = separator();
    let mut basis = MaterialBasis::new(basis_count, basis_resolution, metallicity);

    let mut lines = text.lines().filter(|line| !line.trim().is_empty());

    for (channel, name) in CHANNEL_NAMES.iter().enumerate() {
        for b in 0..basis_count {
            let line = lines.next().ok_or_else(|| {
                FitError::Parse(format!("missing row for {name}#{b}"))
            })?;
            let values = parse_row(separator, line, &format!("{name}#{b}"), basis_resolution + 1)?;
            for (m, value) in values.into_iter().enumerate() {
                basis.set_specular_value(channel, m, b, value);
            }
        }
    }

    for b in 0..basis_count {
        let Some(line) = lines.next() else {
            // Older files carry no diffuse rows.
            break;
        };
        let values = parse_row(separator, line, &format!("Diffuse#{b}"), 3)?;
        basis.set_diffuse_albedo(b, Vector3::new(values[0], values[1], values[2]));
    }

    Ok(basis)
}

/// Collapses repeated separators and surrounding whitespace, mirroring the
/// writer's "value, value" layout.
fn separator() -> &'static Regex {
    static SEPARATOR: OnceLock<Regex> = OnceLock::new();
    SEPARATOR.get_or_init(|| Regex::new(r"\s*,+\s*").unwrap())
}

fn parse_row(
    separator: &Regex,
    line: &str,
    expected_tag: &str,
    expected_values: usize,
) -> Result<Vec<f64>> {
    let mut elements: Vec<&str> = separator.split(line.trim()).collect();

    // A trailing separator leaves one empty element at the end.
    if elements.last() == Some(&"") {
        elements.pop();
    }

    let tag = elements
        .first()
        .copied()
        .ok_or_else(|| FitError::Parse("empty row".into()))?;
    if tag != expected_tag {
        return Err(FitError::Parse(format!(
            "unexpected row tag: expected {expected_tag}, found {tag}"
        )));
    }

    if elements.len() != expected_values + 1 {
        return Err(FitError::Parse(format!(
            "row {expected_tag} holds {} values, expected {expected_values}",
            elements.len() - 1
        )));
    }

    elements[1..]
        .iter()
        .map(|element| {
            element
                .parse::<f64>()
                .map_err(|e| FitError::Parse(format!("row {expected_tag}: {e}")))
        })
        .collect()
}

pub fn save_basis_functions(directory: &Path, basis: &MaterialBasis) -> Result<()> {
    fs::write(
        directory.join(BASIS_FUNCTIONS_FILENAME),
        format_basis_csv(basis),
    )?;
    Ok(())
}

pub fn load_basis_functions(
    directory: &Path,
    basis_count: usize,
    basis_resolution: usize,
    metallicity: f64,
) -> Result<MaterialBasis> {
    let text = fs::read_to_string(directory.join(BASIS_FUNCTIONS_FILENAME))?;
    parse_basis_csv(&text, basis_count, basis_resolution, metallicity)
}

/// Row 0 of the texel buffer maps to the bottom image row.
fn flipped_y(texel: usize, resolution: TextureResolution) -> (u32, u32) {
    let x = (texel % resolution.width) as u32;
    let y = (resolution.height - 1 - texel / resolution.width) as u32;
    (x, y)
}

fn quantize(value: f64) -> u8 {
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Writes one single-channel `weightsNN.png` per basis function.
pub fn save_weight_maps(directory: &Path, decomposition: &Decomposition) -> Result<()> {
    let resolution = decomposition.resolution();

    for b in 0..decomposition.basis().basis_count() {
        let mut image = GrayImage::new(resolution.width as u32, resolution.height as u32);
        for texel in 0..resolution.texel_count() {
            let (x, y) = flipped_y(texel, resolution);
            image.put_pixel(x, y, image::Luma([quantize(decomposition.weights(texel)[b])]));
        }
        image.save(directory.join(format!("weights{b:02}.png")))?;
    }
    Ok(())
}

/// Packed variant: four basis functions per RGBA image, named
/// `weightsNNMM.png` after the first and last basis index it covers.
pub fn save_packed_weight_maps(directory: &Path, decomposition: &Decomposition) -> Result<()> {
    let resolution = decomposition.resolution();
    let basis_count = decomposition.basis().basis_count();

    for group in 0..(basis_count + 3) / 4 {
        let first = group * 4;
        let mut image: ImageBuffer<Rgba<u8>, Vec<u8>> =
            ImageBuffer::new(resolution.width as u32, resolution.height as u32);

        for texel in 0..resolution.texel_count() {
            let (x, y) = flipped_y(texel, resolution);
            let mut pixel = [0u8; 4];
            for (slot, value) in pixel.iter_mut().enumerate() {
                let b = first + slot;
                if b < basis_count {
                    *value = quantize(decomposition.weights(texel)[b]);
                }
            }
            image.put_pixel(x, y, Rgba(pixel));
        }

        image.save(directory.join(format!("weights{first:02}{:02}.png", first + 3)))?;
    }
    Ok(())
}

/// Blends the basis diffuse albedos with the per-texel weights and writes the
/// gamma-encoded result as `diffuse_frombasis.png`.
pub fn save_diffuse_map(directory: &Path, decomposition: &Decomposition, gamma: f64) -> Result<()> {
    let resolution = decomposition.resolution();
    let basis = decomposition.basis();

    let mut image: ImageBuffer<Rgb<u8>, Vec<u8>> =
        ImageBuffer::new(resolution.width as u32, resolution.height as u32);

    for texel in 0..resolution.texel_count() {
        let weights = decomposition.weights(texel);

        let mut blended = Vector3::zeros();
        let mut weight_sum = 0.0;
        for b in 0..basis.basis_count() {
            blended += basis.diffuse_albedo(b) * weights[b];
            weight_sum += weights[b];
        }
        if weight_sum > 0.0 {
            blended /= weight_sum;
        }

        let encoded = blended.map(|v| v.max(0.0).powf(1.0 / gamma).min(1.0));
        let (x, y) = flipped_y(texel, resolution);
        image.put_pixel(
            x,
            y,
            Rgb([quantize(encoded[0]), quantize(encoded[1]), quantize(encoded[2])]),
        );
    }

    image.save(directory.join("diffuse_frombasis.png"))?;
    Ok(())
}
