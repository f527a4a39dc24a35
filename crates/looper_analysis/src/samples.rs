//! Reading raw IQ captures.

use crate::error::{AnalysisError, Result};
use crate::fft::Complex;
use crate::params::SampleFormat;
use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read, Seek, SeekFrom};
use std::path::Path;

/// Read up to `max_samples` complex samples from `path`, skipping
/// `header_bytes` first. A trailing partial sample is ignored.
pub fn read_iq(
    path: &Path,
    format: SampleFormat,
    header_bytes: u64,
    max_samples: usize,
) -> Result<Vec<Complex>> {
    let file = File::open(path).map_err(|e| AnalysisError::io(path, e))?;
    let available = file
        .metadata()
        .map_err(|e| AnalysisError::io(path, e))?
        .len()
        .saturating_sub(header_bytes);
    let count = ((available / format.sample_size() as u64) as usize).min(max_samples);

    let mut reader = BufReader::new(file);
    reader
        .seek(SeekFrom::Start(header_bytes))
        .map_err(|e| AnalysisError::io(path, e))?;

    let mut samples = Vec::with_capacity(count);
    for _ in 0..count {
        match read_sample(&mut reader, format) {
            Ok(sample) => samples.push(sample),
            // Writer truncated the file under us; keep what we have
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(AnalysisError::io(path, e)),
        }
    }
    Ok(samples)
}

fn read_sample<R: Read>(reader: &mut R, format: SampleFormat) -> std::io::Result<Complex> {
    match format {
        SampleFormat::Cf32 => {
            let i = reader.read_f32::<LittleEndian>()?;
            let q = reader.read_f32::<LittleEndian>()?;
            Ok(Complex::new(i as f64, q as f64))
        }
        SampleFormat::Ci16 => {
            let i = reader.read_i16::<LittleEndian>()?;
            let q = reader.read_i16::<LittleEndian>()?;
            Ok(Complex::new(i as f64 / 32768.0, q as f64 / 32768.0))
        }
    }
}
