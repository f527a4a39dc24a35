//! Summing many spectrograms into one.

use crate::artifact::{SpectrogramArtifact, SPECTROGRAM_SUFFIX};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Result of an accumulation run.
#[derive(Debug, Default)]
pub struct AccumulateReport {
    /// Sum of all compatible spectrograms (axes of the first one)
    pub summed: Option<SpectrogramArtifact>,
    /// Number of spectrograms added into `summed`
    pub used: usize,
    /// Files that matched the suffix but could not be added
    pub skipped: Vec<(PathBuf, String)>,
}

/// Read a newline-separated list of paths, ignoring blank lines.
pub fn read_file_list(path: &Path) -> io::Result<Vec<PathBuf>> {
    let content = fs::read_to_string(path)?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(PathBuf::from)
        .collect())
}

/// Sum the power grids of every `*_spectrogram.npz` in `files`.
///
/// Entries with another suffix are ignored. A file that fails to load or
/// whose grid shape differs from the first loaded one is skipped and
/// reported; it never aborts the run.
pub fn accumulate<I>(files: I) -> AccumulateReport
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut report = AccumulateReport::default();
    for path in files {
        if !path.to_string_lossy().ends_with(SPECTROGRAM_SUFFIX) {
            continue;
        }
        let artifact = match SpectrogramArtifact::load(&path) {
            Ok(artifact) => artifact,
            Err(e) => {
                error!(file = %path.display(), error = %e, "Error loading spectrogram");
                report.skipped.push((path, e.to_string()));
                continue;
            }
        };

        match report.summed.as_mut() {
            None => report.summed = Some(artifact),
            Some(sum) => {
                if sum.rows() != artifact.rows() || sum.cols() != artifact.cols() {
                    let reason = format!(
                        "shape {}x{} does not match {}x{}",
                        artifact.rows(),
                        artifact.cols(),
                        sum.rows(),
                        sum.cols()
                    );
                    error!(file = %path.display(), %reason, "Skipping spectrogram");
                    report.skipped.push((path, reason));
                    continue;
                }
                for (acc, value) in sum.power.iter_mut().zip(&artifact.power) {
                    *acc += value;
                }
            }
        }
        report.used += 1;
        debug!(file = %path.display(), used = report.used, "Added spectrogram");
    }
    report
}
