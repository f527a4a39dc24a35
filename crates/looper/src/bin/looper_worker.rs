//! Worker process: analyze one capture.
//!
//! Reads a single `WorkerTask` frame from stdin, runs the analysis, and
//! writes a single `WorkOutcome` frame to stdout. Logs go to stderr, which
//! the service inherits. Spawned by the service; not meant to be run by hand.

use anyhow::{Context, Result};
use looper::wire::{read_frame, write_frame, WorkerTask};
use looper::worker::process_task;
use looper_analysis::SpectrogramAnalyzer;
use std::io::{self, BufReader, BufWriter};
use std::process::ExitCode;

fn run() -> Result<()> {
    let mut stdin = BufReader::new(io::stdin().lock());
    let task: WorkerTask = read_frame(&mut stdin)
        .context("Failed to read task from stdin")?
        .context("No task received on stdin")?;

    let outcome = process_task(&task, &SpectrogramAnalyzer::new());

    let mut stdout = BufWriter::new(io::stdout().lock());
    write_frame(&mut stdout, &outcome).context("Failed to write outcome to stdout")?;
    Ok(())
}

fn main() -> ExitCode {
    looper_logging::init_stderr_logging(std::env::var_os("LOOPER_WORKER_VERBOSE").is_some());
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("looper-worker: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
