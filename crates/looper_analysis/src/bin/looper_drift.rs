//! Extract the peak frequency of every spectrum in a directory over time.
//!
//! Usage:
//!     looper-drift /data/spectra

use anyhow::{bail, Context, Result};
use clap::Parser;
use looper_analysis::drift::{collect_drift, write_drift_table, DRIFT_TABLE_NAME};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "looper-drift",
    about = "Extract f_max from *_spectrum.npz files and tabulate it over time"
)]
struct Args {
    /// Directory containing the spectrum archives
    directory: PathBuf,
}

fn main() -> Result<()> {
    let args = Args::parse();
    looper_logging::init_stderr_logging(false);

    if !args.directory.is_dir() {
        bail!(
            "The specified path '{}' is not a valid directory.",
            args.directory.display()
        );
    }

    let report = collect_drift(&args.directory)
        .with_context(|| format!("Failed to read {}", args.directory.display()))?;
    if report.matched == 0 {
        bail!("No files matching the pattern '_spectrum.npz' were found in the directory.");
    }

    let table = write_drift_table(&args.directory.join(DRIFT_TABLE_NAME), &report.points)
        .context("Failed to write drift table")?;
    info!(
        points = report.points.len(),
        failures = report.failures.len(),
        "Timestamps and f_max values saved to {}",
        table.display()
    );
    Ok(())
}
