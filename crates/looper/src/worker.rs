//! Processing of a single candidate. Shared by the in-process engine and the
//! `looper-worker` binary.

use crate::dispatch::{FailureKind, OutcomeStatus, WorkOutcome};
use crate::publish::publish;
use crate::wire::WorkerTask;
use looper_analysis::Analyzer;
use std::time::Instant;
use tracing::{info, warn};

/// Analyze one candidate and run the post-steps. Never panics on bad input;
/// analyzer errors become a failed outcome.
pub fn process_task(task: &WorkerTask, analyzer: &dyn Analyzer) -> WorkOutcome {
    let start = Instant::now();
    let candidate = &task.candidate;
    let settings = &task.settings;

    let status = match analyzer.analyze(
        &candidate.path,
        &settings.paths.output_dir,
        &settings.analysis,
    ) {
        Ok(artifacts) => {
            let warnings = publish(&artifacts, &candidate.path, settings);
            info!(id = %candidate.id, "Processed");
            OutcomeStatus::Success {
                artifacts,
                warnings,
            }
        }
        Err(e) => {
            warn!(id = %candidate.id, error = %e, "Analysis failed");
            OutcomeStatus::Failed {
                reason: e.to_string(),
                kind: FailureKind::Analysis,
            }
        }
    };

    WorkOutcome {
        id: candidate.id.clone(),
        path: candidate.path.clone(),
        status,
        elapsed_ms: start.elapsed().as_millis() as u64,
    }
}
