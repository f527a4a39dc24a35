//! Analysis parameters, resolved from the `[analysis]` configuration section.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sample encoding of a raw IQ capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Interleaved little-endian f32 I/Q pairs
    #[default]
    Cf32,
    /// Interleaved little-endian i16 I/Q pairs, scaled to [-1, 1)
    Ci16,
}

impl SampleFormat {
    /// Bytes per complex sample
    pub fn sample_size(self) -> usize {
        match self {
            SampleFormat::Cf32 => 8,
            SampleFormat::Ci16 => 4,
        }
    }
}

/// Window applied to each frame before the FFT.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Window {
    #[default]
    Rectangular,
    Hann,
}

/// Parameters handed to the analyzer for every file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisParams {
    /// Number of frames to read
    pub nframes: usize,
    /// Samples per frame (FFT length)
    pub lframes: usize,
    /// Number of consecutive frames averaged into one spectrogram row
    pub navg: usize,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: f64,

    #[serde(default)]
    pub center_frequency: f64,

    #[serde(default)]
    pub sample_format: SampleFormat,

    #[serde(default)]
    pub window: Window,

    /// Bytes to skip at the start of every capture
    #[serde(default)]
    pub header_bytes: u64,

    /// Pipeline-specific keys (display bounds, masks) passed through untouched.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

fn default_sample_rate() -> f64 {
    1.0
}

impl AnalysisParams {
    pub fn new(nframes: usize, lframes: usize, navg: usize) -> Self {
        Self {
            nframes,
            lframes,
            navg,
            sample_rate: default_sample_rate(),
            center_frequency: 0.0,
            sample_format: SampleFormat::default(),
            window: Window::default(),
            header_bytes: 0,
            extra: BTreeMap::new(),
        }
    }

    /// Check numeric invariants. Returns a description of the first violation.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.nframes == 0 {
            return Err("nframes must be at least 1".to_string());
        }
        if self.lframes < 2 || !self.lframes.is_power_of_two() {
            return Err(format!(
                "lframes must be a power of two >= 2, got {}",
                self.lframes
            ));
        }
        if self.navg == 0 {
            return Err("navg must be at least 1".to_string());
        }
        if !(self.sample_rate.is_finite() && self.sample_rate > 0.0) {
            return Err(format!(
                "sample_rate must be positive, got {}",
                self.sample_rate
            ));
        }
        if !self.center_frequency.is_finite() {
            return Err("center_frequency must be finite".to_string());
        }
        Ok(())
    }

    /// Number of samples the analyzer wants to read.
    pub fn requested_samples(&self) -> usize {
        self.nframes.saturating_mul(self.lframes)
    }
}
