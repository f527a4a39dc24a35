//! Looper service entry point.
//!
//! ```bash
//! looper --config /etc/looper/looper.toml
//! looper --config looper.toml --once --in-process -v
//! ```
//!
//! Startup is all-or-nothing: settings and ledger are loaded and validated
//! before anything is written. SIGINT/SIGTERM request an orderly shutdown
//! (the running batch finishes and is committed); a second signal exits
//! immediately.

use anyhow::{Context, Result};
use clap::Parser;
use looper::discovery::source_for;
use looper::dispatch::{AnalysisEngine, Dispatcher, InProcessEngine, SubprocessEngine};
use looper::{CancellationToken, Ledger, Scheduler, Settings};
use looper_analysis::SpectrogramAnalyzer;
use looper_logging::LogConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Exit code after a forced second interrupt
const FORCED_EXIT_CODE: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "looper")]
#[command(version, about = "Process new IQ captures exactly once")]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "LOOPER_CONFIG")]
    config: PathBuf,

    /// Run a single cycle and exit
    #[arg(long)]
    once: bool,

    /// Analyze on pool threads instead of worker processes
    #[arg(long)]
    in_process: bool,

    /// Enable debug logging on the console
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match Settings::load(&cli.config) {
        Ok(settings) => settings,
        Err(e) => {
            looper_logging::init_stderr_logging(cli.verbose);
            error!("{}", e);
            eprintln!("looper: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = looper_logging::init_logging(LogConfig {
        app_name: "looper",
        verbose: cli.verbose,
        log_dir: settings.paths.log_dir.as_deref(),
    }) {
        eprintln!("Warning: file logging unavailable ({:#}), logging to stderr only", e);
        looper_logging::init_stderr_logging(cli.verbose);
    }

    match run(cli, settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("looper: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli, settings: Settings) -> Result<()> {
    info!(config = %cli.config.display(), "Configuration loaded");

    let ledger = Ledger::load(&settings.paths.state_file)?;
    settings
        .prepare_dirs()
        .context("Failed to create output directories")?;

    let cancel = CancellationToken::new();
    install_signal_handlers(cancel.clone())?;

    let engine: Arc<dyn AnalysisEngine> = if cli.in_process {
        info!("Running analyses in-process");
        Arc::new(InProcessEngine::new(Arc::new(SpectrogramAnalyzer::new())))
    } else {
        let engine = SubprocessEngine::new(settings.worker_timeout());
        info!(worker = %engine.binary().display(), "Running analyses in worker processes");
        Arc::new(engine)
    };
    let dispatcher = Dispatcher::new(engine, settings.processing.num_cores);
    let source = source_for(&settings);

    let mut scheduler = Scheduler::new(settings, ledger, source, dispatcher, cancel);
    if cli.once {
        let report = scheduler.run_once();
        scheduler.shutdown();
        info!(
            discovered = report.discovered,
            ready = report.ready,
            succeeded = report.succeeded,
            failed = report.failed,
            deferred = report.deferred,
            "Single cycle finished"
        );
    } else {
        scheduler.run();
    }
    Ok(())
}

/// First signal cancels the token; a second one exits at once.
fn install_signal_handlers(cancel: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use signal_hook::consts::{SIGINT, SIGTERM};
        use signal_hook::iterator::Signals;

        let mut signals =
            Signals::new([SIGINT, SIGTERM]).context("Failed to install signal handlers")?;
        std::thread::spawn(move || {
            for sig in signals.forever() {
                if cancel.is_cancelled() {
                    warn!("Received signal {} again, exiting immediately", sig);
                    std::process::exit(FORCED_EXIT_CODE);
                }
                info!("Received signal {}, finishing current batch...", sig);
                cancel.cancel();
            }
        });
    }

    #[cfg(windows)]
    {
        ctrlc::set_handler(move || {
            if cancel.is_cancelled() {
                warn!("Received Ctrl+C again, exiting immediately");
                std::process::exit(FORCED_EXIT_CODE);
            }
            info!("Received Ctrl+C, finishing current batch...");
            cancel.cancel();
        })
        .context("Failed to install Ctrl+C handler")?;
    }

    Ok(())
}
