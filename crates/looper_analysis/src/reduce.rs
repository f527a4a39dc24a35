//! Truncating a spectrum to a fraction of its length.

use crate::artifact::SpectrumArtifact;
use std::path::{Path, PathBuf};

/// Keep the first `floor(len / factor)` points. `factor` must be positive.
pub fn reduce_spectrum(spectrum: &SpectrumArtifact, factor: f64) -> Option<SpectrumArtifact> {
    if !(factor.is_finite() && factor > 0.0) {
        return None;
    }
    let len = spectrum.frequencies.len().min(spectrum.power.len());
    let keep = ((len as f64 / factor) as usize).min(len);
    Some(SpectrumArtifact {
        frequencies: spectrum.frequencies[..keep].to_vec(),
        power: spectrum.power[..keep].to_vec(),
    })
}

/// `<input>_reduced_by_<factor>.npz`, next to the input. The factor always
/// carries a decimal point (`3.0`, `2.5`), as downstream tooling expects.
pub fn reduced_path(input: &Path, factor: f64) -> PathBuf {
    let mut name = input.as_os_str().to_os_string();
    name.push(format!("_reduced_by_{:?}.npz", factor));
    PathBuf::from(name)
}
