//! The per-file analysis step.
//!
//! The engine only sees the [`Analyzer`] trait. [`SpectrogramAnalyzer`] is the
//! built-in implementation: power spectrogram of a raw IQ capture, averaged
//! over `navg` frames, plus its time-averaged spectrum.

use crate::artifact::{ArtifactSet, SpectrogramArtifact};
use crate::error::{AnalysisError, Result};
use crate::fft::{fft_in_place, fftshift, hann, shifted_frequencies, Complex};
use crate::params::{AnalysisParams, Window};
use crate::samples::read_iq;
use std::path::Path;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Turns one input file into durable artifacts under `output_dir`.
pub trait Analyzer: Send + Sync {
    fn analyze(
        &self,
        input: &Path,
        output_dir: &Path,
        params: &AnalysisParams,
    ) -> Result<ArtifactSet>;
}

#[derive(Debug, Default, Clone)]
pub struct SpectrogramAnalyzer;

impl SpectrogramAnalyzer {
    pub fn new() -> Self {
        Self
    }

    /// Compute the averaged spectrogram of `input` without writing anything.
    pub fn spectrogram(&self, input: &Path, params: &AnalysisParams) -> Result<SpectrogramArtifact> {
        params.validate().map_err(AnalysisError::InvalidParams)?;

        let samples = read_iq(
            input,
            params.sample_format,
            params.header_bytes,
            params.requested_samples(),
        )?;
        let frames = samples.len() / params.lframes;
        if frames == 0 {
            return Err(AnalysisError::InputTooShort {
                path: input.to_path_buf(),
                samples: samples.len(),
                needed: params.lframes,
            });
        }
        if frames < params.nframes {
            warn!(
                input = %input.display(),
                frames,
                requested = params.nframes,
                "Capture shorter than requested, using available frames"
            );
        }

        let raw = power_spectrogram(&samples, frames, params);
        Ok(raw.averaged(params.navg))
    }
}

impl Analyzer for SpectrogramAnalyzer {
    fn analyze(
        &self,
        input: &Path,
        output_dir: &Path,
        params: &AnalysisParams,
    ) -> Result<ArtifactSet> {
        let start = Instant::now();
        let name = input
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| AnalysisError::Failed(format!("no file name in {}", input.display())))?;

        let spectrogram = self.spectrogram(input, params)?;
        if spectrogram.rows() == 0 {
            return Err(AnalysisError::Failed(format!(
                "{} has fewer than navg={} frames",
                input.display(),
                params.navg
            )));
        }
        let spectrum = spectrogram.time_average();

        let artifacts = ArtifactSet::for_input(output_dir, &name);
        spectrogram.save(&artifacts.spectrogram)?;
        spectrum.save(&artifacts.spectrum)?;

        info!(
            input = %input.display(),
            rows = spectrogram.rows(),
            bins = spectrogram.cols(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Finished analysis"
        );
        Ok(artifacts)
    }
}

fn power_spectrogram(
    samples: &[Complex],
    frames: usize,
    params: &AnalysisParams,
) -> SpectrogramArtifact {
    let n = params.lframes;
    let window = match params.window {
        Window::Rectangular => None,
        Window::Hann => Some(hann(n)),
    };

    let mut power = Vec::with_capacity(frames * n);
    let mut buf = vec![Complex::default(); n];
    for frame in samples.chunks_exact(n).take(frames) {
        buf.copy_from_slice(frame);
        if let Some(w) = window.as_ref() {
            for (value, coeff) in buf.iter_mut().zip(w) {
                *value = value.scale(*coeff);
            }
        }
        fft_in_place(&mut buf);
        let start = power.len();
        power.extend(buf.iter().map(|bin| bin.norm_sqr() / n as f64));
        fftshift(&mut power[start..]);
    }

    let frequencies = shifted_frequencies(n, 1.0 / params.sample_rate)
        .into_iter()
        .map(|f| f + params.center_frequency)
        .collect();
    let frame_duration = n as f64 / params.sample_rate;
    let times = (0..frames).map(|i| i as f64 * frame_duration).collect();
    debug!(frames, bins = n, "Computed power spectrogram");

    SpectrogramArtifact {
        frequencies,
        times,
        power,
    }
}
