//! Sum the power grids of many `*_spectrogram.npz` files.
//!
//! Usage:
//!     looper-addup files.txt [--output summed.npz]

use anyhow::{Context, Result};
use clap::Parser;
use looper_analysis::accumulate::{accumulate, read_file_list};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser, Debug)]
#[command(
    name = "looper-addup",
    about = "Sum the power grids of spectrogram files listed in a file"
)]
struct Args {
    /// File containing one spectrogram path per line
    file_list: PathBuf,

    /// Output archive (default: <file_list>_sum.npz)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    looper_logging::init_stderr_logging(args.verbose);

    let files = read_file_list(&args.file_list)
        .with_context(|| format!("Failed to read file list: {}", args.file_list.display()))?;
    let report = accumulate(files);

    let Some(summed) = report.summed else {
        info!("No files ending with '_spectrogram.npz' found. Nothing to do.");
        return Ok(());
    };

    let output = args.output.unwrap_or_else(|| {
        let mut name = args.file_list.clone().into_os_string();
        name.push("_sum.npz");
        PathBuf::from(name)
    });
    summed
        .save(&output)
        .with_context(|| format!("Failed to write {}", output.display()))?;

    info!(
        used = report.used,
        skipped = report.skipped.len(),
        rows = summed.rows(),
        bins = summed.cols(),
        output = %output.display(),
        "Summed spectrograms"
    );
    Ok(())
}
