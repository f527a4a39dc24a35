//! Best-effort post-steps after a successful analysis.
//!
//! Nothing here fails an item: every problem comes back as a warning string.

use crate::config::Settings;
use looper_analysis::ArtifactSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Run the configured post-steps and return the warnings they produced.
pub fn publish(artifacts: &ArtifactSet, input: &Path, settings: &Settings) -> Vec<String> {
    let mut warnings = Vec::new();

    if let Some(dir) = &settings.paths.publish_dir {
        let target = publish_target(dir, &artifacts.spectrogram, settings);
        match target.and_then(|t| copy_replacing(&artifacts.spectrogram, &t).map(|_| t)) {
            Ok(target) => debug!(target = %target.display(), "Published spectrogram"),
            Err(e) => warnings.push(format!("publish to {} failed: {}", dir.display(), e)),
        }
    }

    if settings.publish.copy_input {
        let result = input
            .file_name()
            .ok_or_else(|| std::io::Error::other("input has no file name"))
            .and_then(|name| {
                let target = settings.paths.output_dir.join(name);
                copy_replacing(input, &target)
            });
        if let Err(e) = result {
            warnings.push(format!("copying input {} failed: {}", input.display(), e));
        }
    }

    for warning in &warnings {
        warn!(input = %input.display(), "{}", warning);
    }
    warnings
}

fn publish_target(dir: &Path, artifact: &Path, settings: &Settings) -> std::io::Result<PathBuf> {
    match (&settings.publish.static_name, artifact.file_name()) {
        (Some(name), _) => Ok(dir.join(name)),
        (None, Some(name)) => Ok(dir.join(name)),
        (None, None) => Err(std::io::Error::other("artifact has no file name")),
    }
}

/// Copy through a temp sibling so readers of `target` never see a partial file.
fn copy_replacing(source: &Path, target: &Path) -> std::io::Result<()> {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = target.with_file_name(format!(".{}.{}.part", name, std::process::id()));
    if let Err(e) = fs::copy(source, &temp).and_then(|_| fs::rename(&temp, target)) {
        let _ = fs::remove_file(&temp);
        return Err(e);
    }
    Ok(())
}
