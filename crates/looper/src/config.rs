//! Configuration for the Looper service
//!
//! Settings are read once from a TOML file and validated before the
//! scheduling loop starts. Any problem here is fatal and happens before the
//! first side effect.

use looper_analysis::AnalysisParams;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Sections and keys that must be present in every configuration file.
const REQUIRED_KEYS: &[(&str, &[&str])] = &[
    ("paths", &["state_file", "output_dir"]),
    (
        "processing",
        &["num_cores", "interval_seconds", "file_ready_seconds"],
    ),
    ("analysis", &["nframes", "lframes", "navg"]),
];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Config file {path} is not valid TOML: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Missing section: [{0}]")]
    MissingSection(String),

    #[error("Missing key: {key} in section: [{section}]")]
    MissingKey { section: String, key: String },

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Immutable settings, shared by the scheduling loop and every worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub paths: PathsConfig,
    pub processing: ProcessingConfig,
    pub analysis: AnalysisParams,
    #[serde(default)]
    pub publish: PublishConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory watched for new captures (directory-scan mode)
    #[serde(default)]
    pub monitor_dir: Option<PathBuf>,
    /// Processed-files ledger
    pub state_file: PathBuf,
    /// Where artifacts are written
    pub output_dir: PathBuf,
    /// Line-oriented list of captures; selects manifest mode when set
    #[serde(default)]
    pub manifest_file: Option<PathBuf>,
    /// Directory manifest entries are resolved under (by file name)
    #[serde(default)]
    pub source_dir: Option<PathBuf>,
    /// Best-effort copy target for the latest spectrogram
    #[serde(default)]
    pub publish_dir: Option<PathBuf>,
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Maximum number of concurrent analyses
    pub num_cores: usize,
    /// Pause between scheduling cycles
    pub interval_seconds: f64,
    /// Size-stability window of the readiness gate
    pub file_ready_seconds: f64,
    /// Accepted capture suffix, compared case-insensitively
    #[serde(default = "default_suffix")]
    pub suffix: String,
    /// Failed attempts after which a capture is given up on
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Per-item deadline for worker processes
    #[serde(default)]
    pub worker_timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PublishConfig {
    /// Fixed file name for the published spectrogram (e.g. a web page asset)
    #[serde(default)]
    pub static_name: Option<String>,
    /// Also copy each processed capture into the output directory
    #[serde(default)]
    pub copy_input: bool,
}

fn default_suffix() -> String {
    ".tiq".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

/// How candidates are found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryMode {
    Directory {
        dir: PathBuf,
    },
    Manifest {
        manifest: PathBuf,
        source_dir: Option<PathBuf>,
    },
}

impl Settings {
    /// Load and validate settings from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|err| match err {
            ConfigError::Parse { source, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    /// Parse and validate settings from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let table: toml::Table = content.parse().map_err(|source| ConfigError::Parse {
            path: PathBuf::new(),
            source,
        })?;
        check_required_keys(&table)?;

        let settings: Settings = toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Invalid(e.message().to_string()))?;
        settings.validated()
    }

    fn validated(mut self) -> Result<Self, ConfigError> {
        if self.paths.monitor_dir.is_none() && self.paths.manifest_file.is_none() {
            return Err(ConfigError::MissingKey {
                section: "paths".to_string(),
                key: "monitor_dir".to_string(),
            });
        }
        if self.processing.num_cores == 0 {
            return Err(ConfigError::Invalid(
                "processing.num_cores must be at least 1".to_string(),
            ));
        }
        if self.processing.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "processing.max_attempts must be at least 1".to_string(),
            ));
        }
        check_seconds("processing.interval_seconds", self.processing.interval_seconds)?;
        check_seconds(
            "processing.file_ready_seconds",
            self.processing.file_ready_seconds,
        )?;
        if let Some(timeout) = self.processing.worker_timeout_seconds {
            check_seconds("processing.worker_timeout_seconds", timeout)?;
            if timeout == 0.0 {
                return Err(ConfigError::Invalid(
                    "processing.worker_timeout_seconds must be positive".to_string(),
                ));
            }
        }
        let suffix = self.processing.suffix.trim().to_lowercase();
        if suffix.is_empty() {
            return Err(ConfigError::Invalid(
                "processing.suffix must not be empty".to_string(),
            ));
        }
        self.processing.suffix = suffix;
        if let Some(name) = self.publish.static_name.as_deref() {
            if name.is_empty() || name.contains('/') || name.contains('\\') {
                return Err(ConfigError::Invalid(format!(
                    "publish.static_name must be a plain file name, got '{}'",
                    name
                )));
            }
        }
        self.analysis
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("analysis: {}", e)))?;
        Ok(self)
    }

    pub fn discovery_mode(&self) -> DiscoveryMode {
        match (&self.paths.manifest_file, &self.paths.monitor_dir) {
            (Some(manifest), _) => DiscoveryMode::Manifest {
                manifest: manifest.clone(),
                source_dir: self.paths.source_dir.clone(),
            },
            (None, Some(dir)) => DiscoveryMode::Directory { dir: dir.clone() },
            // validated() guarantees one of the two
            (None, None) => DiscoveryMode::Directory {
                dir: PathBuf::from("."),
            },
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.processing.interval_seconds)
    }

    pub fn ready_window(&self) -> Duration {
        Duration::from_secs_f64(self.processing.file_ready_seconds)
    }

    pub fn worker_timeout(&self) -> Option<Duration> {
        self.processing
            .worker_timeout_seconds
            .map(Duration::from_secs_f64)
    }

    /// Create output and publish directories. Called after validation only.
    pub fn prepare_dirs(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.paths.output_dir)?;
        if let Some(dir) = &self.paths.publish_dir {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

fn check_required_keys(table: &toml::Table) -> Result<(), ConfigError> {
    for (section, keys) in REQUIRED_KEYS {
        let Some(entry) = table.get(*section) else {
            return Err(ConfigError::MissingSection(section.to_string()));
        };
        let Some(entry) = entry.as_table() else {
            return Err(ConfigError::Invalid(format!(
                "[{}] must be a table",
                section
            )));
        };
        for key in *keys {
            if !entry.contains_key(*key) {
                return Err(ConfigError::MissingKey {
                    section: section.to_string(),
                    key: key.to_string(),
                });
            }
        }
    }
    Ok(())
}

fn check_seconds(name: &str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{} must be a non-negative number of seconds, got {}",
            name, value
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use looper_analysis::SampleFormat;

    const VALID: &str = r#"
[paths]
monitor_dir = "/data/incoming"
state_file = "/data/state.json"
output_dir = "/data/out"

[processing]
num_cores = 4
interval_seconds = 10
file_ready_seconds = 1.5

[analysis]
nframes = 100
lframes = 1024
navg = 10
sample_format = "ci16"
zzmin = -120.0
mask = false
"#;

    #[test]
    fn test_valid_config() {
        let settings = Settings::from_toml_str(VALID).unwrap();
        assert_eq!(settings.processing.num_cores, 4);
        assert_eq!(settings.poll_interval(), Duration::from_secs(10));
        assert_eq!(settings.ready_window(), Duration::from_millis(1500));
        assert_eq!(settings.processing.suffix, ".tiq");
        assert_eq!(settings.processing.max_attempts, 3);
        assert_eq!(settings.analysis.sample_format, SampleFormat::Ci16);
        assert_eq!(settings.analysis.extra.len(), 2);
        assert_eq!(settings.publish, PublishConfig::default());
        assert_eq!(
            settings.discovery_mode(),
            DiscoveryMode::Directory {
                dir: PathBuf::from("/data/incoming")
            }
        );
    }

    #[test]
    fn test_missing_section() {
        let toml = VALID.replace("[processing]", "[processingx]");
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSection(s) if s == "processing"));
    }

    #[test]
    fn test_missing_key() {
        let toml = VALID.replace("navg = 10", "");
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(
            matches!(err, ConfigError::MissingKey { ref section, ref key } if section == "analysis" && key == "navg"),
            "got {err}"
        );
        assert_eq!(err.to_string(), "Missing key: navg in section: [analysis]");
    }

    #[test]
    fn test_unparseable_file() {
        let err = Settings::from_toml_str("[paths\nstate_file = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_io_error_names_file() {
        let err = Settings::load(Path::new("/nonexistent/looper.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/looper.toml"));
    }

    #[test]
    fn test_wrong_type_is_invalid() {
        let toml = VALID.replace("num_cores = 4", "num_cores = \"four\"");
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_zero_workers_rejected() {
        let toml = VALID.replace("num_cores = 4", "num_cores = 0");
        assert!(matches!(
            Settings::from_toml_str(&toml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_analysis_params_validated() {
        let toml = VALID.replace("lframes = 1024", "lframes = 1000");
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(err.to_string().contains("power of two"));
    }

    #[test]
    fn test_manifest_mode_without_monitor_dir() {
        let toml = VALID.replace(
            "monitor_dir = \"/data/incoming\"",
            "manifest_file = \"/data/sync.txt\"\nsource_dir = \"/lustre/run\"",
        );
        let settings = Settings::from_toml_str(&toml).unwrap();
        assert_eq!(
            settings.discovery_mode(),
            DiscoveryMode::Manifest {
                manifest: PathBuf::from("/data/sync.txt"),
                source_dir: Some(PathBuf::from("/lustre/run")),
            }
        );
    }

    #[test]
    fn test_neither_monitor_dir_nor_manifest() {
        let toml = VALID.replace("monitor_dir = \"/data/incoming\"", "");
        let err = Settings::from_toml_str(&toml).unwrap_err();
        assert!(matches!(err, ConfigError::MissingKey { ref key, .. } if key == "monitor_dir"));
    }

    #[test]
    fn test_suffix_is_normalized() {
        let toml = VALID.replace("num_cores = 4", "num_cores = 4\nsuffix = \" .RAW \"");
        let settings = Settings::from_toml_str(&toml).unwrap();
        assert_eq!(settings.processing.suffix, ".raw");
    }

    #[test]
    fn test_settings_survive_json() {
        let settings = Settings::from_toml_str(VALID).unwrap();
        let json = serde_json::to_string(&settings).unwrap();
        let parsed: Settings = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, settings);
    }
}
