//! Keep the first 1/N of a spectrum.
//!
//! Usage:
//!     looper-reduce capture_spectrum.npz [--reduce-by 3]
//!
//! `--reduce_by` is accepted as well, for existing scripts.

use anyhow::{bail, Context, Result};
use clap::Parser;
use looper_analysis::reduce::{reduce_spectrum, reduced_path};
use looper_analysis::SpectrumArtifact;
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "looper-reduce", about = "Reduce the data in a spectrum file")]
struct Args {
    /// Spectrum archive (.npz)
    input_file: PathBuf,

    /// Factor to reduce the data by
    #[arg(long, alias = "reduce_by", default_value_t = 3.0)]
    reduce_by: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    looper_logging::init_stderr_logging(false);

    let spectrum = SpectrumArtifact::load(&args.input_file)
        .with_context(|| format!("Failed to load {}", args.input_file.display()))?;
    let Some(reduced) = reduce_spectrum(&spectrum, args.reduce_by) else {
        bail!("--reduce-by must be a positive number, got {}", args.reduce_by);
    };

    let output = reduced_path(&args.input_file, args.reduce_by);
    reduced
        .save(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    info!(
        from = spectrum.power.len(),
        to = reduced.power.len(),
        "Reduced data saved to {}",
        output.display()
    );
    Ok(())
}
