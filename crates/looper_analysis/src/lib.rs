//! Looper Analysis - spectrogram artifacts for IQ captures
//!
//! The ingestion engine hands every ready capture to an [`Analyzer`]. The
//! built-in [`SpectrogramAnalyzer`] writes two NumPy archives per capture:
//!
//! - `<capture>_spectrogram.npz`: `arr_0` frequencies, `arr_1` times,
//!   `arr_2` power grid (time × frequency)
//! - `<capture>_spectrum.npz`: `arr_0` frequencies, `arr_1` mean power
//!
//! The batch utilities (`looper-addup`, `looper-reduce`, `looper-drift`)
//! consume those archives after the fact.

pub mod accumulate;
pub mod analyzer;
pub mod artifact;
pub mod drift;
pub mod error;
pub mod fft;
pub mod npz;
pub mod params;
pub mod reduce;
pub mod samples;

// Re-exports for convenience
pub use analyzer::{Analyzer, SpectrogramAnalyzer};
pub use artifact::{
    ArtifactSet, SpectrogramArtifact, SpectrumArtifact, SPECTROGRAM_SUFFIX, SPECTRUM_SUFFIX,
};
pub use error::{AnalysisError, NpzError, Result};
pub use params::{AnalysisParams, SampleFormat, Window};
