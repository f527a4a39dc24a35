//! The polling loop: discover, gate, dispatch, commit, sleep.
//!
//! ```text
//! Idle --interval--> Discovering --ready items--> Dispatching --commit--> Idle
//!                        |  no ready items                ^
//!                        +--------------------------------+ (back to Idle)
//! any state --cancel observed--> ShuttingDown (final flush)
//! ```
//!
//! The ledger is owned here and touched only between batches, on the
//! control thread.

use crate::cancel::CancellationToken;
use crate::config::Settings;
use crate::discovery::{report_exhausted, CandidateSource};
use crate::dispatch::{Dispatcher, FailureKind, OutcomeStatus};
use crate::ledger::Ledger;
use crate::readiness::{Readiness, ReadinessGate};
use std::fmt;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Discovering,
    Dispatching,
    ShuttingDown,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoopState::Idle => "idle",
            LoopState::Discovering => "discovering",
            LoopState::Dispatching => "dispatching",
            LoopState::ShuttingDown => "shutting_down",
        };
        f.write_str(name)
    }
}

/// What one cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub discovered: usize,
    pub ready: usize,
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Dispatched but not attempted (worker could not start); not counted
    /// toward the retry cap
    pub deferred: usize,
    /// Cancellation was observed during the cycle
    pub interrupted: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub succeeded: usize,
    pub failed: usize,
}

pub struct Scheduler {
    settings: Settings,
    ledger: Ledger,
    source: Box<dyn CandidateSource>,
    gate: ReadinessGate,
    dispatcher: Dispatcher,
    cancel: CancellationToken,
    state: LoopState,
}

impl Scheduler {
    pub fn new(
        settings: Settings,
        ledger: Ledger,
        source: Box<dyn CandidateSource>,
        dispatcher: Dispatcher,
        cancel: CancellationToken,
    ) -> Self {
        let gate = ReadinessGate::new(settings.ready_window(), cancel.clone());
        Self {
            settings,
            ledger,
            source,
            gate,
            dispatcher,
            cancel,
            state: LoopState::Idle,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn into_ledger(self) -> Ledger {
        self.ledger
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!(from = %self.state, to = %next, "State change");
            self.state = next;
        }
    }

    /// Run a single discover/gate/dispatch/commit cycle.
    pub fn run_once(&mut self) -> CycleReport {
        let mut report = CycleReport::default();
        if self.cancel.is_cancelled() {
            report.interrupted = true;
            self.transition(LoopState::ShuttingDown);
            return report;
        }

        self.transition(LoopState::Discovering);
        let max_attempts = self.settings.processing.max_attempts;
        let candidates = match self.source.discover(&self.ledger, max_attempts) {
            Ok(candidates) => candidates,
            Err(e) => {
                error!(source = %self.source.describe(), error = %e, "Discovery failed");
                self.transition(LoopState::Idle);
                return report;
            }
        };
        report.discovered = candidates.len();

        let mut ready = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            match self.gate.check(&candidate.path) {
                Readiness::Ready => ready.push(candidate),
                Readiness::NotReady(reason) => {
                    debug!(id = %candidate.id, reason = %reason, "Deferred to a later cycle");
                }
                Readiness::Cancelled => {
                    report.interrupted = true;
                    break;
                }
            }
        }
        report.ready = ready.len();

        if report.interrupted || self.cancel.is_cancelled() {
            report.interrupted = true;
            info!(ready = ready.len(), "Shutdown requested before dispatch");
            self.transition(LoopState::ShuttingDown);
            return report;
        }
        if ready.is_empty() {
            debug!(discovered = report.discovered, "Nothing ready");
            self.transition(LoopState::Idle);
            return report;
        }

        self.transition(LoopState::Dispatching);
        info!(
            count = ready.len(),
            workers = self.dispatcher.workers(),
            "Dispatching batch"
        );
        report.dispatched = ready.len();
        let outcomes = self.dispatcher.run_batch(&ready, &self.settings);

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Success { .. } => succeeded.push(outcome.id),
                OutcomeStatus::Failed {
                    reason,
                    kind: FailureKind::Spawn,
                } => {
                    // Never attempted: stays pending, no failure recorded
                    error!(
                        id = %outcome.id,
                        reason = %reason,
                        "Worker could not be started; item left pending"
                    );
                    report.deferred += 1;
                }
                OutcomeStatus::Failed { reason, kind } => {
                    let attempts = self.ledger.record_failure(&outcome.id);
                    warn!(
                        id = %outcome.id,
                        kind = ?kind,
                        attempts,
                        max_attempts,
                        reason = %reason,
                        "Item failed"
                    );
                    failed.push(outcome.id);
                }
            }
        }
        report.succeeded = succeeded.len();
        report.failed = failed.len();

        match self.ledger.commit(succeeded) {
            Ok(added) => info!(
                added,
                failed = report.failed,
                deferred = report.deferred,
                total = self.ledger.len(),
                "Batch committed"
            ),
            Err(e) => error!(
                error = %e,
                "Failed to persist ledger; retrying with the next commit"
            ),
        }
        report_exhausted(&self.ledger, &failed, max_attempts);

        if self.cancel.is_cancelled() {
            report.interrupted = true;
            self.transition(LoopState::ShuttingDown);
        } else {
            self.transition(LoopState::Idle);
        }
        report
    }

    /// Loop until cancelled. The first cycle runs immediately.
    pub fn run(&mut self) -> RunSummary {
        let mut summary = RunSummary::default();
        info!(
            source = %self.source.describe(),
            workers = self.dispatcher.workers(),
            interval = ?self.settings.poll_interval(),
            processed = self.ledger.len(),
            "Looper started"
        );

        loop {
            let report = self.run_once();
            summary.cycles += 1;
            summary.succeeded += report.succeeded;
            summary.failed += report.failed;
            if report.interrupted || self.state == LoopState::ShuttingDown {
                break;
            }
            if self.cancel.sleep(self.settings.poll_interval()) {
                break;
            }
        }

        self.shutdown();
        info!(
            cycles = summary.cycles,
            succeeded = summary.succeeded,
            failed = summary.failed,
            "Looper stopped"
        );
        summary
    }

    /// Final ledger flush. Errors are logged, never raised.
    pub fn shutdown(&mut self) {
        self.transition(LoopState::ShuttingDown);
        if let Err(e) = self.ledger.flush() {
            error!(error = %e, "Final ledger save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discovery::DirectorySource;
    use crate::dispatch::{AnalysisEngine, InProcessEngine, SubprocessEngine};
    use looper_analysis::{AnalysisError, AnalysisParams, Analyzer, ArtifactSet};
    use std::fs;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    struct NamedFailures(&'static [&'static str]);

    impl Analyzer for NamedFailures {
        fn analyze(
            &self,
            input: &Path,
            output_dir: &Path,
            _params: &AnalysisParams,
        ) -> looper_analysis::Result<ArtifactSet> {
            let name = input.file_name().unwrap().to_string_lossy().into_owned();
            if self.0.contains(&name.as_str()) {
                return Err(AnalysisError::Failed("scripted".to_string()));
            }
            Ok(ArtifactSet::for_input(output_dir, &name))
        }
    }

    /// Succeeds on every item, cancelling the shared token from inside the
    /// batch as a signal arriving mid-dispatch would.
    struct CancelsMidBatch {
        cancel: CancellationToken,
        calls: AtomicUsize,
    }

    impl Analyzer for CancelsMidBatch {
        fn analyze(
            &self,
            input: &Path,
            output_dir: &Path,
            _params: &AnalysisParams,
        ) -> looper_analysis::Result<ArtifactSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.cancel();
            std::thread::sleep(Duration::from_millis(20));
            let name = input.file_name().unwrap().to_string_lossy().into_owned();
            Ok(ArtifactSet::for_input(output_dir, &name))
        }
    }

    fn scheduler(
        root: &Path,
        failing: &'static [&'static str],
        cancel: CancellationToken,
    ) -> Scheduler {
        let engine = Arc::new(InProcessEngine::new(Arc::new(NamedFailures(failing))));
        scheduler_with(root, engine, cancel)
    }

    fn scheduler_with(
        root: &Path,
        engine: Arc<dyn AnalysisEngine>,
        cancel: CancellationToken,
    ) -> Scheduler {
        let toml = format!(
            r#"
[paths]
monitor_dir = {dir:?}
state_file = {state:?}
output_dir = {out:?}

[processing]
num_cores = 2
interval_seconds = 0.05
file_ready_seconds = 0
max_attempts = 2

[analysis]
nframes = 4
lframes = 8
navg = 1
"#,
            dir = root.join("in").to_string_lossy(),
            state = root.join("state.json").to_string_lossy(),
            out = root.join("out").to_string_lossy(),
        );
        let settings = Settings::from_toml_str(&toml).unwrap();
        let ledger = Ledger::load(&settings.paths.state_file).unwrap();
        let source = Box::new(DirectorySource::new(root.join("in"), ".tiq"));
        Scheduler::new(settings, ledger, source, Dispatcher::new(engine, 2), cancel)
    }

    fn inputs(root: &Path, names: &[&str]) {
        let dir = root.join("in");
        fs::create_dir_all(&dir).unwrap();
        for name in names {
            fs::write(dir.join(name), b"iq").unwrap();
        }
    }

    #[test]
    fn test_cycle_commits_successes_only() {
        let tmp = TempDir::new().unwrap();
        inputs(tmp.path(), &["a.tiq", "b.tiq", "c.tiq"]);
        let mut scheduler = scheduler(tmp.path(), &["b.tiq"], CancellationToken::new());

        let report = scheduler.run_once();
        assert_eq!(
            report,
            CycleReport {
                discovered: 3,
                ready: 3,
                dispatched: 3,
                succeeded: 2,
                failed: 1,
                deferred: 0,
                interrupted: false,
            }
        );
        assert_eq!(scheduler.state(), LoopState::Idle);
        assert!(scheduler.ledger().contains("a.tiq"));
        assert!(!scheduler.ledger().contains("b.tiq"));
        assert_eq!(scheduler.ledger().attempts("b.tiq"), 1);
    }

    #[test]
    fn test_retry_cap_stops_redispatch() {
        let tmp = TempDir::new().unwrap();
        inputs(tmp.path(), &["bad.tiq"]);
        let mut scheduler = scheduler(tmp.path(), &["bad.tiq"], CancellationToken::new());

        assert_eq!(scheduler.run_once().dispatched, 1);
        assert_eq!(scheduler.run_once().dispatched, 1);
        assert_eq!(scheduler.run_once().dispatched, 0);

        let reloaded = Ledger::load(&tmp.path().join("state.json")).unwrap();
        assert_eq!(reloaded.attempts("bad.tiq"), 2);
        assert!(!reloaded.contains("bad.tiq"));
    }

    #[test]
    fn test_empty_directory_goes_idle() {
        let tmp = TempDir::new().unwrap();
        inputs(tmp.path(), &[]);
        let mut scheduler = scheduler(tmp.path(), &[], CancellationToken::new());
        assert_eq!(scheduler.run_once(), CycleReport::default());
        assert_eq!(scheduler.state(), LoopState::Idle);
    }

    #[test]
    fn test_discovery_error_is_not_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut scheduler = scheduler(tmp.path(), &[], CancellationToken::new());
        let report = scheduler.run_once();
        assert_eq!(report.discovered, 0);
        assert_eq!(scheduler.state(), LoopState::Idle);
    }

    #[test]
    fn test_cancelled_before_cycle() {
        let tmp = TempDir::new().unwrap();
        inputs(tmp.path(), &["a.tiq"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut scheduler = scheduler(tmp.path(), &[], cancel);

        let report = scheduler.run_once();
        assert!(report.interrupted);
        assert_eq!(report.dispatched, 0);
        assert_eq!(scheduler.state(), LoopState::ShuttingDown);
    }

    #[test]
    fn test_run_stops_on_cancel_and_flushes() {
        let tmp = TempDir::new().unwrap();
        inputs(tmp.path(), &["a.tiq", "b.tiq"]);
        let cancel = CancellationToken::new();
        let mut scheduler = scheduler(tmp.path(), &[], cancel.clone());

        let canceller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(200));
            cancel.cancel();
        });
        let summary = scheduler.run();
        canceller.join().unwrap();

        assert!(summary.cycles >= 1);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(scheduler.state(), LoopState::ShuttingDown);
        let reloaded = Ledger::load(&tmp.path().join("state.json")).unwrap();
        assert_eq!(reloaded.len(), 2);
    }

    #[test]
    fn test_missing_worker_does_not_burn_retries() {
        let tmp = TempDir::new().unwrap();
        inputs(tmp.path(), &["good.tiq"]);
        let engine = Arc::new(SubprocessEngine::with_binary(
            tmp.path().join("missing-worker"),
            None,
        ));
        let mut scheduler = scheduler_with(tmp.path(), engine, CancellationToken::new());

        // max_attempts is 2; spawn failures must not count
        for _ in 0..4 {
            let report = scheduler.run_once();
            assert_eq!(report.discovered, 1);
            assert_eq!(report.dispatched, 1);
            assert_eq!(report.deferred, 1);
            assert_eq!(report.failed, 0);
        }
        assert_eq!(scheduler.ledger().attempts("good.tiq"), 0);
        assert!(!scheduler.ledger().contains("good.tiq"));

        scheduler.shutdown();
        let reloaded = Ledger::load(&tmp.path().join("state.json")).unwrap();
        assert!(!reloaded.is_exhausted("good.tiq", 2));
    }

    #[test]
    fn test_cancel_during_dispatch_finishes_and_commits_batch() {
        let tmp = TempDir::new().unwrap();
        inputs(tmp.path(), &["a.tiq", "b.tiq", "c.tiq"]);
        let cancel = CancellationToken::new();
        let analyzer = Arc::new(CancelsMidBatch {
            cancel: cancel.clone(),
            calls: AtomicUsize::new(0),
        });
        let engine = Arc::new(InProcessEngine::new(analyzer.clone()));
        let mut scheduler = scheduler_with(tmp.path(), engine, cancel);

        let summary = scheduler.run();

        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.failed, 0);
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.state(), LoopState::ShuttingDown);
        let reloaded = Ledger::load(&tmp.path().join("state.json")).unwrap();
        let ids: Vec<&str> = reloaded.ids().collect();
        assert_eq!(ids, vec!["a.tiq", "b.tiq", "c.tiq"]);
    }
}
