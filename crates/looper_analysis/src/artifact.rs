//! Spectrogram and spectrum artifacts.

use crate::error::NpzError;
use crate::npz::{read_npz, write_npz, NpyArray};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SPECTROGRAM_SUFFIX: &str = "_spectrogram.npz";
pub const SPECTRUM_SUFFIX: &str = "_spectrum.npz";

/// Power over (time × frequency), with absolute frequency and time axes.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrogramArtifact {
    pub frequencies: Vec<f64>,
    pub times: Vec<f64>,
    /// Row-major: one row per time step, `frequencies.len()` columns
    pub power: Vec<f64>,
}

/// Time-averaged power spectrum.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumArtifact {
    pub frequencies: Vec<f64>,
    pub power: Vec<f64>,
}

/// Locations of the artifacts written for one input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub spectrogram: PathBuf,
    pub spectrum: PathBuf,
}

impl ArtifactSet {
    /// Artifact paths for `input_name` under `output_dir`.
    pub fn for_input(output_dir: &Path, input_name: &str) -> Self {
        Self {
            spectrogram: output_dir.join(format!("{}{}", input_name, SPECTROGRAM_SUFFIX)),
            spectrum: output_dir.join(format!("{}{}", input_name, SPECTRUM_SUFFIX)),
        }
    }
}

impl SpectrogramArtifact {
    pub fn rows(&self) -> usize {
        self.times.len()
    }

    pub fn cols(&self) -> usize {
        self.frequencies.len()
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        let cols = self.cols();
        &self.power[idx * cols..(idx + 1) * cols]
    }

    /// Average every `every` consecutive rows. A trailing partial group is
    /// dropped; each averaged row keeps the time of its first member.
    pub fn averaged(&self, every: usize) -> SpectrogramArtifact {
        let every = every.max(1);
        let cols = self.cols();
        let groups = self.rows() / every;
        let mut power = vec![0.0; groups * cols];
        let mut times = Vec::with_capacity(groups);
        for group in 0..groups {
            let out = &mut power[group * cols..(group + 1) * cols];
            for member in 0..every {
                for (acc, value) in out.iter_mut().zip(self.row(group * every + member)) {
                    *acc += value;
                }
            }
            for acc in out.iter_mut() {
                *acc /= every as f64;
            }
            times.push(self.times[group * every]);
        }
        SpectrogramArtifact {
            frequencies: self.frequencies.clone(),
            times,
            power,
        }
    }

    /// Mean over all rows.
    pub fn time_average(&self) -> SpectrumArtifact {
        let cols = self.cols();
        let mut power = vec![0.0; cols];
        for idx in 0..self.rows() {
            for (acc, value) in power.iter_mut().zip(self.row(idx)) {
                *acc += value;
            }
        }
        if self.rows() > 0 {
            for acc in power.iter_mut() {
                *acc /= self.rows() as f64;
            }
        }
        SpectrumArtifact {
            frequencies: self.frequencies.clone(),
            power,
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), NpzError> {
        write_npz(
            path,
            &[
                &NpyArray::vector(self.frequencies.clone()),
                &NpyArray::vector(self.times.clone()),
                &NpyArray::matrix(self.rows(), self.cols(), self.power.clone()),
            ],
        )
    }

    pub fn load(path: &Path) -> Result<Self, NpzError> {
        let mut arrays = read_npz(path)?.into_iter();
        let frequencies = take_vector(&mut arrays, "arr_0")?;
        let times = take_vector(&mut arrays, "arr_1")?;
        let grid = arrays
            .next()
            .ok_or_else(|| NpzError::MissingArray("arr_2".to_string()))?;
        if grid.shape != [times.len(), frequencies.len()] {
            return Err(NpzError::Shape {
                name: "arr_2".to_string(),
                shape: grid.shape,
            });
        }
        Ok(Self {
            frequencies,
            times,
            power: grid.data,
        })
    }
}

impl SpectrumArtifact {
    /// Frequency of maximal power, `None` for an empty spectrum.
    pub fn peak_frequency(&self) -> Option<f64> {
        self.power
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.is_nan())
            .max_by(|a, b| a.1.total_cmp(b.1))
            .and_then(|(idx, _)| self.frequencies.get(idx).copied())
    }

    pub fn save(&self, path: &Path) -> Result<(), NpzError> {
        write_npz(
            path,
            &[
                &NpyArray::vector(self.frequencies.clone()),
                &NpyArray::vector(self.power.clone()),
            ],
        )
    }

    pub fn load(path: &Path) -> Result<Self, NpzError> {
        let mut arrays = read_npz(path)?.into_iter();
        let frequencies = take_vector(&mut arrays, "arr_0")?;
        let power = take_vector(&mut arrays, "arr_1")?;
        Ok(Self { frequencies, power })
    }
}

fn take_vector(
    arrays: &mut impl Iterator<Item = NpyArray>,
    name: &str,
) -> Result<Vec<f64>, NpzError> {
    let array = arrays
        .next()
        .ok_or_else(|| NpzError::MissingArray(name.to_string()))?;
    if array.shape.len() != 1 {
        return Err(NpzError::Shape {
            name: name.to_string(),
            shape: array.shape,
        });
    }
    Ok(array.data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SpectrogramArtifact {
        SpectrogramArtifact {
            frequencies: vec![10.0, 20.0],
            times: vec![0.0, 1.0, 2.0, 3.0, 4.0],
            power: vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 100.0, 100.0],
        }
    }

    #[test]
    fn test_averaged_drops_partial_group() {
        let averaged = sample().averaged(2);
        assert_eq!(averaged.times, vec![0.0, 2.0]);
        assert_eq!(averaged.power, vec![2.0, 3.0, 6.0, 7.0]);
    }

    #[test]
    fn test_averaged_by_one_is_identity() {
        assert_eq!(sample().averaged(1), sample());
    }

    #[test]
    fn test_time_average_and_peak() {
        let spectrum = sample().averaged(2).time_average();
        assert_eq!(spectrum.power, vec![4.0, 5.0]);
        assert_eq!(spectrum.peak_frequency(), Some(20.0));
    }

    #[test]
    fn test_spectrogram_save_and_load() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.tiq_spectrogram.npz");
        let artifact = sample();
        artifact.save(&path).unwrap();
        assert_eq!(SpectrogramArtifact::load(&path).unwrap(), artifact);
    }

    #[test]
    fn test_spectrum_file_is_not_a_spectrogram() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("a.tiq_spectrum.npz");
        sample().time_average().save(&path).unwrap();
        assert!(matches!(
            SpectrogramArtifact::load(&path),
            Err(NpzError::MissingArray(_))
        ));
    }

    #[test]
    fn test_artifact_names() {
        let set = ArtifactSet::for_input(Path::new("/out"), "cap-2024.tiq");
        assert_eq!(set.spectrogram, PathBuf::from("/out/cap-2024.tiq_spectrogram.npz"));
        assert_eq!(set.spectrum, PathBuf::from("/out/cap-2024.tiq_spectrum.npz"));
    }
}
