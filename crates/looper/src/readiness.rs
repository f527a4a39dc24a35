//! Size-stability check for files that may still be written.

use crate::cancel::CancellationToken;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady(String),
    /// Shutdown was requested during the wait
    Cancelled,
}

/// Samples a file's size twice, `window` apart. Equal sizes mean ready.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    window: Duration,
    cancel: CancellationToken,
}

impl ReadinessGate {
    pub fn new(window: Duration, cancel: CancellationToken) -> Self {
        Self { window, cancel }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn check(&self, path: &Path) -> Readiness {
        let before = match file_size(path) {
            Some(size) => size,
            None => return Readiness::NotReady("file vanished before first sample".to_string()),
        };
        if self.cancel.sleep(self.window) {
            return Readiness::Cancelled;
        }
        match file_size(path) {
            Some(after) if after == before => Readiness::Ready,
            Some(after) => Readiness::NotReady(format!("size changed {} -> {}", before, after)),
            None => Readiness::NotReady("file vanished during the wait".to_string()),
        }
    }

    pub fn is_ready(&self, path: &Path) -> bool {
        let readiness = self.check(path);
        if let Readiness::NotReady(reason) = &readiness {
            debug!(path = %path.display(), reason = %reason, "Not ready");
        }
        readiness == Readiness::Ready
    }
}

fn file_size(path: &Path) -> Option<u64> {
    fs::metadata(path).ok().map(|m| m.len())
}
