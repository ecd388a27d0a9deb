//! Reader for the binary sample-dump format produced by the rasterization
//! pipeline.
//!
//! Layout (little endian): a header of two `u32` values (view count, texel
//! count), followed by `views * texels` records of eight `f32` values each:
//! color r/g/b, visibility, halfway index, geometric ratio, weight, n.l.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt};
use fit::error::{FitError, Result};
use fit::samples::{InMemoryStream, ReflectanceSample};

const HEADER_BYTES: u64 = 8;
const RECORD_BYTES: u64 = 32;

pub fn read_sample_dump(path: &Path) -> Result<InMemoryStream> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let view_count = reader.read_u32::<LittleEndian>()? as usize;
    let texel_count = reader.read_u32::<LittleEndian>()? as usize;

    let record_count = view_count
        .checked_mul(texel_count)
        .ok_or_else(|| FitError::Parse("sample dump header overflows".into()))?;

    // Cross-check the header against the file size before trusting it for
    // the allocation below; a mismatch usually means a truncated, padded, or
    // mislabeled dump.
    let expected_len = (record_count as u64)
        .checked_mul(RECORD_BYTES)
        .and_then(|bytes| bytes.checked_add(HEADER_BYTES))
        .ok_or_else(|| FitError::Parse("sample dump header overflows".into()))?;
    if file_len != expected_len {
        return Err(FitError::Parse(format!(
            "sample dump holds {file_len} bytes but its header declares {expected_len}"
        )));
    }

    let mut samples = Vec::with_capacity(record_count);
    let mut record = [0f32; 8];
    for _ in 0..record_count {
        reader.read_f32_into::<LittleEndian>(&mut record)?;
        samples.push(ReflectanceSample {
            color: [record[0] as f64, record[1] as f64, record[2] as f64],
            visibility: record[3] as f64,
            halfway_index: record[4] as f64,
            geom_ratio: record[5] as f64,
            weight: record[6] as f64,
            n_dot_l: record[7] as f64,
        });
    }

    Ok(InMemoryStream::new(view_count, texel_count, samples))
}

#[cfg(test)]
mod tests {
    use byteorder::{LittleEndian, WriteBytesExt};
    use fit::samples::ReflectanceStream;

    use super::*;

    fn write_dump(path: &Path, view_count: u32, texel_count: u32, records: &[[f32; 8]]) {
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(view_count).unwrap();
        bytes.write_u32::<LittleEndian>(texel_count).unwrap();
        for record in records {
            for &value in record {
                bytes.write_f32::<LittleEndian>(value).unwrap();
            }
        }
        std::fs::write(path, bytes).unwrap();
    }

    #[test]
    fn reads_a_well_formed_dump() {
        let path = std::env::temp_dir().join("specular-fit-test-dump.bin");
        write_dump(
            &path,
            1,
            2,
            &[
                [0.5, 0.25, 0.125, 1.0, 0.5, 0.9, 2.0, 0.8],
                [0.0; 8],
            ],
        );

        let stream = read_sample_dump(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(stream.view_count(), 1);
        assert_eq!(stream.texel_count(), 2);
        let sample = stream.view_samples(0)[0];
        assert!(sample.is_visible());
        assert_eq!(sample.color[0], 0.5);
        assert_eq!(sample.weight, 2.0);
        assert!(!stream.view_samples(0)[1].is_visible());
    }

    #[test]
    fn rejects_a_dump_with_extra_records() {
        let path = std::env::temp_dir().join("specular-fit-test-dump-extra.bin");
        write_dump(&path, 1, 1, &[[0.0; 8], [0.0; 8]]);

        let result = read_sample_dump(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(FitError::Parse(_))));
    }

    #[test]
    fn rejects_a_header_declaring_more_data_than_the_file_holds() {
        // A 8-byte file claiming the maximum record count must fail cleanly
        // instead of attempting the allocation its header implies.
        let path = std::env::temp_dir().join("specular-fit-test-dump-huge.bin");
        write_dump(&path, u32::MAX, u32::MAX, &[]);

        let result = read_sample_dump(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(FitError::Parse(_))));

        let truncated = std::env::temp_dir().join("specular-fit-test-dump-short.bin");
        write_dump(&truncated, 2, 3, &[[0.0; 8]]);

        let result = read_sample_dump(&truncated);
        std::fs::remove_file(&truncated).ok();
        assert!(matches!(result, Err(FitError::Parse(_))));
    }
}
