//! Candidate discovery: directory scan or manifest.
//!
//! Both sources drop identifiers the ledger already holds and identifiers
//! that used up their retries. Readiness is checked later by the scheduler.

use crate::config::{DiscoveryMode, Settings};
use crate::ledger::Ledger;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, error};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Failed to list {path}: {source}")]
    ListDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to read manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A file eligible for processing this cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFile {
    /// Ledger identifier
    pub id: String,
    pub path: PathBuf,
}

pub trait CandidateSource: Send {
    fn discover(
        &self,
        ledger: &Ledger,
        max_attempts: u32,
    ) -> Result<Vec<CandidateFile>, DiscoveryError>;

    fn describe(&self) -> String;
}

/// Build the source selected by configuration.
pub fn source_for(settings: &Settings) -> Box<dyn CandidateSource> {
    let suffix = settings.processing.suffix.clone();
    match settings.discovery_mode() {
        DiscoveryMode::Directory { dir } => Box::new(DirectorySource::new(dir, suffix)),
        DiscoveryMode::Manifest {
            manifest,
            source_dir,
        } => Box::new(ManifestSource::new(manifest, source_dir, suffix)),
    }
}

fn has_suffix(name: &str, suffix: &str) -> bool {
    name.to_lowercase().ends_with(&suffix.to_lowercase())
}

/// Keeps `id` unless it is processed or exhausted.
fn is_pending(ledger: &Ledger, id: &str, max_attempts: u32) -> bool {
    if ledger.contains(id) {
        return false;
    }
    if ledger.is_exhausted(id, max_attempts) {
        debug!(id = %id, attempts = ledger.attempts(id), "Skipping, retries exhausted");
        return false;
    }
    true
}

/// Non-recursive scan of a watched directory. Identifier = file name.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    suffix: String,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, suffix: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            suffix: suffix.into(),
        }
    }
}

impl CandidateSource for DirectorySource {
    fn discover(
        &self,
        ledger: &Ledger,
        max_attempts: u32,
    ) -> Result<Vec<CandidateFile>, DiscoveryError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| DiscoveryError::ListDir {
            path: self.dir.clone(),
            source,
        })?;

        let mut candidates = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(dir = %self.dir.display(), error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            // Follows symlinks, like a plain stat
            let is_file = fs::metadata(entry.path())
                .map(|m| m.is_file())
                .unwrap_or(false);
            if !is_file {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                debug!(path = %entry.path().display(), "Skipping non UTF-8 name");
                continue;
            };
            if !has_suffix(&name, &self.suffix) || !is_pending(ledger, &name, max_attempts) {
                continue;
            }
            candidates.push(CandidateFile {
                path: entry.path(),
                id: name,
            });
        }
        candidates.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(candidates)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.dir.display())
    }
}

/// Line-oriented list of captures maintained by an external sync job.
/// Identifier = resolved path.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    manifest: PathBuf,
    source_dir: Option<PathBuf>,
    suffix: String,
}

impl ManifestSource {
    pub fn new(
        manifest: impl Into<PathBuf>,
        source_dir: Option<PathBuf>,
        suffix: impl Into<String>,
    ) -> Self {
        Self {
            manifest: manifest.into(),
            source_dir,
            suffix: suffix.into(),
        }
    }

    fn resolve(&self, entry: &str) -> Option<PathBuf> {
        let raw = Path::new(entry);
        match &self.source_dir {
            Some(dir) => raw.file_name().map(|name| dir.join(name)),
            None if raw.is_absolute() => Some(raw.to_path_buf()),
            None => Some(
                self.manifest
                    .parent()
                    .map(|base| base.join(raw))
                    .unwrap_or_else(|| raw.to_path_buf()),
            ),
        }
    }
}

/// First whitespace-separated token of every non-blank line.
pub fn parse_manifest(content: &str) -> Vec<&str> {
    content
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .collect()
}

impl CandidateSource for ManifestSource {
    fn discover(
        &self,
        ledger: &Ledger,
        max_attempts: u32,
    ) -> Result<Vec<CandidateFile>, DiscoveryError> {
        let content =
            fs::read_to_string(&self.manifest).map_err(|source| DiscoveryError::Manifest {
                path: self.manifest.clone(),
                source,
            })?;

        let mut seen = HashSet::new();
        let mut candidates = Vec::new();
        for entry in parse_manifest(&content) {
            if !has_suffix(entry, &self.suffix) {
                continue;
            }
            let Some(path) = self.resolve(entry) else {
                continue;
            };
            if !path.is_file() {
                debug!(entry = %entry, path = %path.display(), "Manifest entry does not exist");
                continue;
            }
            let id = path.to_string_lossy().into_owned();
            if !seen.insert(id.clone()) || !is_pending(ledger, &id, max_attempts) {
                continue;
            }
            candidates.push(CandidateFile { id, path });
        }
        Ok(candidates)
    }

    fn describe(&self) -> String {
        format!("manifest {}", self.manifest.display())
    }
}

/// Log identifiers that just crossed the retry cap.
pub fn report_exhausted(ledger: &Ledger, ids: &[String], max_attempts: u32) {
    for id in ids {
        if ledger.is_exhausted(id, max_attempts) {
            error!(
                id = %id,
                attempts = ledger.attempts(id),
                "Giving up after repeated failures; remove it from the ledger failures to retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"iq").unwrap();
        path
    }

    #[test]
    fn test_directory_filters_suffix_and_ledger() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "b.tiq");
        touch(tmp.path(), "A.TIQ");
        touch(tmp.path(), "c.tiq");
        touch(tmp.path(), "notes.txt");
        fs::create_dir(tmp.path().join("sub.tiq")).unwrap();

        let mut ledger = Ledger::empty(&tmp.path().join("state.json"));
        ledger.commit(["c.tiq"]).unwrap();

        let source = DirectorySource::new(tmp.path(), ".tiq");
        let ids: Vec<String> = source
            .discover(&ledger, 3)
            .unwrap()
            .into_iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(ids, vec!["A.TIQ".to_string(), "b.tiq".to_string()]);
    }

    #[test]
    fn test_directory_discovery_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "x.tiq");
        touch(tmp.path(), "y.tiq");
        let ledger = Ledger::empty(&tmp.path().join("state.json"));
        let source = DirectorySource::new(tmp.path(), ".tiq");
        assert_eq!(
            source.discover(&ledger, 3).unwrap(),
            source.discover(&ledger, 3).unwrap()
        );
    }

    #[test]
    fn test_directory_skips_exhausted() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "bad.tiq");
        let mut ledger = Ledger::empty(&tmp.path().join("state.json"));
        ledger.record_failure("bad.tiq");
        ledger.record_failure("bad.tiq");
        let source = DirectorySource::new(tmp.path(), ".tiq");
        assert_eq!(source.discover(&ledger, 3).unwrap().len(), 1);
        assert!(source.discover(&ledger, 2).unwrap().is_empty());
    }

    #[test]
    fn test_missing_directory_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::empty(&tmp.path().join("state.json"));
        let source = DirectorySource::new(tmp.path().join("nope"), ".tiq");
        assert!(matches!(
            source.discover(&ledger, 3),
            Err(DiscoveryError::ListDir { .. })
        ));
    }

    #[test]
    fn test_parse_manifest_first_token() {
        let content = "/a/x.tiq 1024 2024-05-01\n\n   \n  /a/y.tiq\n";
        assert_eq!(parse_manifest(content), vec!["/a/x.tiq", "/a/y.tiq"]);
    }

    #[test]
    fn test_manifest_resolves_under_source_dir() {
        let tmp = TempDir::new().unwrap();
        let data = tmp.path().join("data");
        fs::create_dir(&data).unwrap();
        touch(&data, "one.tiq");
        touch(&data, "two.tiq");
        touch(&data, "three.tiq");
        touch(&data, "four.dat");

        let manifest = tmp.path().join("sync.txt");
        fs::write(
            &manifest,
            "/remote/one.tiq 100\n\n/remote/two.tiq\n/remote/four.dat\n/remote/three.tiq size=3\n/remote/one.tiq\n/remote/missing.tiq\n",
        )
        .unwrap();

        let ledger = Ledger::empty(&tmp.path().join("state.json"));
        let source = ManifestSource::new(&manifest, Some(data.clone()), ".tiq");
        let candidates = source.discover(&ledger, 3).unwrap();
        let paths: Vec<PathBuf> = candidates.iter().map(|c| c.path.clone()).collect();
        assert_eq!(
            paths,
            vec![data.join("one.tiq"), data.join("two.tiq"), data.join("three.tiq")]
        );
        assert_eq!(candidates[0].id, data.join("one.tiq").to_string_lossy());
    }

    #[test]
    fn test_manifest_relative_to_its_directory() {
        let tmp = TempDir::new().unwrap();
        touch(tmp.path(), "rel.tiq");
        let manifest = tmp.path().join("sync.txt");
        fs::write(&manifest, "rel.tiq\n").unwrap();

        let mut ledger = Ledger::empty(&tmp.path().join("state.json"));
        let source = ManifestSource::new(&manifest, None, ".tiq");
        let candidates = source.discover(&ledger, 3).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].path, tmp.path().join("rel.tiq"));

        ledger.commit([candidates[0].id.clone()]).unwrap();
        assert!(source.discover(&ledger, 3).unwrap().is_empty());
    }

    #[test]
    fn test_missing_manifest_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let ledger = Ledger::empty(&tmp.path().join("state.json"));
        let source = ManifestSource::new(tmp.path().join("sync.txt"), None, ".tiq");
        assert!(matches!(
            source.discover(&ledger, 3),
            Err(DiscoveryError::Manifest { .. })
        ));
    }
}
