//! Durable record of processed captures.
//!
//! The ledger is a versioned JSON document:
//!
//! ```json
//! {"version": 1, "processed": ["a.tiq", "b.tiq"], "failures": {"c.tiq": 2}}
//! ```
//!
//! Every persist writes the whole document to a temporary sibling, syncs it,
//! and renames it over the previous file, so a crash leaves either the old or
//! the new ledger on disk, never a torn one. `failures` counts failed attempts
//! per identifier and never marks anything processed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};

pub const LEDGER_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Failed to access ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Ledger {path} is corrupt (refusing to treat it as empty): {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize ledger {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Ledger {path} has version {found}, this build supports up to {supported}")]
    UnsupportedVersion {
        path: PathBuf,
        found: u32,
        supported: u32,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    #[serde(default)]
    processed: BTreeSet<String>,
    #[serde(default)]
    failures: BTreeMap<String, u32>,
}

#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    processed: BTreeSet<String>,
    failures: BTreeMap<String, u32>,
    dirty: bool,
}

impl Ledger {
    /// Load the ledger at `path`. A missing file is an empty ledger.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let content = match fs::read(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "No ledger found, starting empty");
                return Ok(Self::empty(path));
            }
            Err(source) => {
                return Err(LedgerError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        let file: LedgerFile =
            serde_json::from_slice(&content).map_err(|source| LedgerError::Corrupt {
                path: path.to_path_buf(),
                source,
            })?;
        if file.version > LEDGER_VERSION {
            return Err(LedgerError::UnsupportedVersion {
                path: path.to_path_buf(),
                found: file.version,
                supported: LEDGER_VERSION,
            });
        }

        info!(
            path = %path.display(),
            processed = file.processed.len(),
            failing = file.failures.len(),
            "Loaded ledger"
        );
        Ok(Self {
            path: path.to_path_buf(),
            processed: file.processed,
            failures: file.failures,
            dirty: false,
        })
    }

    /// An in-memory ledger that persists to `path` on the first commit.
    pub fn empty(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            processed: BTreeSet::new(),
            failures: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn contains(&self, id: &str) -> bool {
        self.processed.contains(id)
    }

    pub fn len(&self) -> usize {
        self.processed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processed.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.processed.iter().map(String::as_str)
    }

    /// Failed attempts recorded for `id`.
    pub fn attempts(&self, id: &str) -> u32 {
        self.failures.get(id).copied().unwrap_or(0)
    }

    /// Whether `id` has used up its retries.
    pub fn is_exhausted(&self, id: &str, max_attempts: u32) -> bool {
        self.attempts(id) >= max_attempts
    }

    /// Count one more failed attempt. Persisted with the next commit.
    pub fn record_failure(&mut self, id: &str) -> u32 {
        let attempts = self.failures.entry(id.to_string()).or_insert(0);
        *attempts += 1;
        self.dirty = true;
        *attempts
    }

    /// Merge `new_ids` and durably persist the full ledger.
    ///
    /// Returns how many identifiers were new. The in-memory set is updated
    /// even if persisting fails; the next commit or flush retries the write.
    pub fn commit<I, S>(&mut self, new_ids: I) -> Result<usize, LedgerError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut added = 0;
        for id in new_ids {
            let id = id.into();
            self.failures.remove(&id);
            if self.processed.insert(id) {
                added += 1;
            }
        }
        if added > 0 {
            self.dirty = true;
        }
        if self.dirty {
            self.persist()?;
        }
        Ok(added)
    }

    /// Persist if anything changed since the last successful write.
    pub fn flush(&mut self) -> Result<(), LedgerError> {
        if self.dirty {
            self.persist()?;
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<(), LedgerError> {
        let document = LedgerFile {
            version: LEDGER_VERSION,
            processed: self.processed.clone(),
            failures: self.failures.clone(),
        };
        let bytes = encode(&self.path, &document)?;
        write_atomic(&self.path, &bytes).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.dirty = false;
        debug!(
            path = %self.path.display(),
            processed = self.processed.len(),
            "Ledger saved"
        );
        Ok(())
    }
}

fn encode<T: Serialize>(path: &Path, document: &T) -> Result<Vec<u8>, LedgerError> {
    let mut bytes =
        serde_json::to_vec_pretty(document).map_err(|source| LedgerError::Serialize {
            path: path.to_path_buf(),
            source,
        })?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Atomic write via temp file + fsync + rename
fn write_atomic(path: &Path, content: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;

    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    let temp_path = parent.join(format!(".{}.{}.tmp", name, std::process::id()));

    let result = (|| {
        let mut file = File::create(&temp_path)?;
        file.write_all(content)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();
    if let Err(e) = result {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    #[cfg(unix)]
    {
        // Make the rename itself durable
        File::open(&parent)?.sync_all()?;
    }

    Ok(())
}
