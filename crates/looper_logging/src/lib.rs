//! Shared logging utilities for Looper binaries.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str = "looper=info,looper_analysis=info";
/// Rotated generations kept next to the live file
const ROTATED_LOG_FILES: usize = 4;
const MAX_LOG_FILE_SIZE: u64 = 1024 * 1024;

/// Logging configuration shared by Looper binaries.
pub struct LogConfig<'a> {
    pub app_name: &'a str,
    pub verbose: bool,
    /// Directory for the rolling log file. Falls back to `~/.looper/logs`.
    pub log_dir: Option<&'a Path>,
}

/// Initialize tracing with a rolling file writer and stderr output.
pub fn init_logging(config: LogConfig<'_>) -> Result<()> {
    let log_dir = match config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
            dir.to_path_buf()
        }
        None => ensure_logs_dir().context("Failed to ensure log directory")?,
    };
    let log_file = LogFile::open(
        &log_dir,
        config.app_name,
        ROTATED_LOG_FILES,
        MAX_LOG_FILE_SIZE,
    )
    .with_context(|| format!("Failed to open log file in {}", log_dir.display()))?;

    let file_filter = default_filter();
    let console_filter = if config.verbose {
        EnvFilter::new("debug")
    } else {
        default_filter()
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(log_file))
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(())
}

/// Initialize stderr-only logging. Used by worker processes, whose stderr is
/// inherited by the service, and by the batch utilities.
pub fn init_stderr_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        default_filter()
    };
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .try_init();
}

fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER))
}

/// Get the Looper home directory: ~/.looper
pub fn looper_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("LOOPER_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".looper")
}

/// Get the logs directory: ~/.looper/logs
pub fn logs_dir() -> PathBuf {
    looper_home().join("logs")
}

/// Ensure the logs directory exists.
pub fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-capped log file. When the next write would push `<name>.log` past
/// `limit`, it becomes `<name>.log.1`, older generations shift up by one and
/// anything beyond `keep` generations is overwritten.
struct LogFile {
    path: PathBuf,
    keep: usize,
    limit: u64,
    file: File,
    written: u64,
}

impl LogFile {
    fn open(dir: &Path, name: &str, keep: usize, limit: u64) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.log", sanitize_name(name)));
        let file = append_to(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path,
            keep: keep.max(1),
            limit,
            file,
            written,
        })
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(format!(".{}", n));
        PathBuf::from(name)
    }

    fn roll(&mut self) -> io::Result<()> {
        self.file.flush()?;
        for n in (1..=self.keep).rev() {
            let from = if n == 1 {
                self.path.clone()
            } else {
                self.generation(n - 1)
            };
            match fs::rename(&from, self.generation(n)) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        self.file = append_to(&self.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for LogFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // An empty file is never rolled, so oversized records are written whole
        if self.written > 0 && self.written + buf.len() as u64 > self.limit {
            self.roll()?;
        }
        let n = self.file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn append_to(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn sanitize_name(name: &str) -> String {
    name.replace(
        |c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_'),
        "_",
    )
}
