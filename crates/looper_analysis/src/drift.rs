//! Peak-frequency drift over a series of spectra.
//!
//! Capture names carry their acquisition time, e.g.
//! `IQ-2024.05.17.10.21.33.123.tiq_spectrum.npz`: the token after the first
//! `-`, cut at `.tiq`, parsed with [`TIMESTAMP_FORMAT`].

use crate::artifact::{SpectrumArtifact, SPECTRUM_SUFFIX};
use chrono::NaiveDateTime;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

pub const TIMESTAMP_FORMAT: &str = "%Y.%m.%d.%H.%M.%S%.f";
pub const DRIFT_TABLE_NAME: &str = "output.txt";

#[derive(Error, Debug)]
pub enum DriftError {
    #[error("no timestamp token in '{0}'")]
    MissingToken(String),

    #[error("bad timestamp '{token}' in '{name}': {source}")]
    BadTimestamp {
        name: String,
        token: String,
        #[source]
        source: chrono::ParseError,
    },

    #[error("cannot read spectrum '{name}': {reason}")]
    Load { name: String, reason: String },

    #[error("spectrum '{0}' is empty")]
    Empty(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DriftPoint {
    pub timestamp: NaiveDateTime,
    pub f_max: f64,
}

#[derive(Debug, Default)]
pub struct DriftReport {
    /// Files whose name ended with the spectrum suffix
    pub matched: usize,
    /// Sorted by timestamp
    pub points: Vec<DriftPoint>,
    pub failures: Vec<DriftError>,
}

/// Recover the acquisition time from a capture-derived file name.
pub fn timestamp_from_name(name: &str) -> Result<NaiveDateTime, DriftError> {
    let token = name
        .split('-')
        .nth(1)
        .and_then(|rest| rest.split(".tiq").next())
        .filter(|token| !token.is_empty())
        .ok_or_else(|| DriftError::MissingToken(name.to_string()))?;
    NaiveDateTime::parse_from_str(token, TIMESTAMP_FORMAT).map_err(|source| {
        DriftError::BadTimestamp {
            name: name.to_string(),
            token: token.to_string(),
            source,
        }
    })
}

/// Scan `dir` for spectra and extract one drift point per file.
pub fn collect_drift(dir: &Path) -> io::Result<DriftReport> {
    let mut report = DriftReport::default();
    let mut names: Vec<String> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(SPECTRUM_SUFFIX))
        .collect();
    names.sort();

    for name in names {
        report.matched += 1;
        match drift_point(&dir.join(&name), &name) {
            Ok(point) => report.points.push(point),
            Err(e) => {
                warn!(file = %name, error = %e, "Skipping spectrum");
                report.failures.push(e);
            }
        }
    }
    report.points.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    Ok(report)
}

fn drift_point(path: &Path, name: &str) -> Result<DriftPoint, DriftError> {
    let timestamp = timestamp_from_name(name)?;
    let spectrum = SpectrumArtifact::load(path).map_err(|e| DriftError::Load {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    let f_max = spectrum
        .peak_frequency()
        .ok_or_else(|| DriftError::Empty(name.to_string()))?;
    Ok(DriftPoint { timestamp, f_max })
}

/// Write the drift table as `# Timestamp, f_max` followed by one row per point.
pub fn write_drift_table(path: &Path, points: &[DriftPoint]) -> io::Result<PathBuf> {
    let mut out = io::BufWriter::new(fs::File::create(path)?);
    writeln!(out, "# Timestamp, f_max")?;
    for point in points {
        writeln!(
            out,
            "{} {}",
            point.timestamp.format("%Y-%m-%d %H:%M:%S%.6f"),
            point.f_max
        )?;
    }
    out.flush()?;
    Ok(path.to_path_buf())
}
