//! Bounded parallel execution of a batch of candidates.
//!
//! The [`Dispatcher`] fans a batch out over `num_cores` pool threads. Each
//! thread hands items to an [`AnalysisEngine`]: either a `looper-worker`
//! child process per item ([`SubprocessEngine`]) or the analyzer directly on
//! the pool thread ([`InProcessEngine`]). Whatever happens to one item, every
//! item gets exactly one [`WorkOutcome`], in input order.

use crate::config::Settings;
use crate::discovery::CandidateFile;
use crate::wire::{read_frame, write_frame, WorkerTask};
use crate::worker::process_task;
use looper_analysis::{Analyzer, ArtifactSet};
use serde::{Deserialize, Serialize};
use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, error, warn};

/// Env var overriding the worker binary location
pub const WORKER_BIN_ENV: &str = "LOOPER_WORKER_BIN";
const WORKER_BIN_NAME: &str = "looper-worker";

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(
        "Worker binary '{}' not found. Build it with `cargo build -p looper --bin looper-worker` or set {}.",
        .binary.display(),
        WORKER_BIN_ENV
    )]
    WorkerNotFound { binary: PathBuf },

    #[error("Failed to spawn worker: {0}")]
    Spawn(#[source] io::Error),

    #[error("Worker protocol error: {0}")]
    Protocol(#[source] io::Error),

    #[error("Worker exited ({status}) without reporting an outcome")]
    NoOutcome { status: String },

    #[error("Worker exceeded {0:?} and was killed")]
    TimedOut(Duration),
}

impl DispatchError {
    fn kind(&self) -> FailureKind {
        match self {
            DispatchError::WorkerNotFound { .. } | DispatchError::Spawn(_) => FailureKind::Spawn,
            DispatchError::TimedOut(_) => FailureKind::TimedOut,
            DispatchError::Protocol(_) | DispatchError::NoOutcome { .. } => FailureKind::Crashed,
        }
    }
}

/// Result of processing one candidate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOutcome {
    pub id: String,
    pub path: PathBuf,
    pub status: OutcomeStatus,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success {
        artifacts: ArtifactSet,
        /// Best-effort post-step problems
        #[serde(default)]
        warnings: Vec<String>,
    },
    Failed {
        reason: String,
        kind: FailureKind,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The analyzer reported an error
    Analysis,
    /// The worker panicked, died, or spoke garbage
    Crashed,
    TimedOut,
    /// The worker could not be started
    Spawn,
}

impl WorkOutcome {
    pub fn failed(
        candidate: &CandidateFile,
        reason: String,
        kind: FailureKind,
        elapsed: Duration,
    ) -> Self {
        Self {
            id: candidate.id.clone(),
            path: candidate.path.clone(),
            status: OutcomeStatus::Failed { reason, kind },
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self.status, OutcomeStatus::Success { .. })
    }
}

/// Runs one task to completion. Implementations must not panic on bad
/// input; the dispatcher still isolates panics if they do.
pub trait AnalysisEngine: Send + Sync {
    fn run(&self, task: &WorkerTask) -> WorkOutcome;
}

/// Runs the analyzer on the pool thread.
pub struct InProcessEngine {
    analyzer: Arc<dyn Analyzer>,
}

impl InProcessEngine {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self { analyzer }
    }
}

impl AnalysisEngine for InProcessEngine {
    fn run(&self, task: &WorkerTask) -> WorkOutcome {
        process_task(task, self.analyzer.as_ref())
    }
}

/// Runs every task in its own `looper-worker` process.
pub struct SubprocessEngine {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl SubprocessEngine {
    /// Locate the worker binary: env override, then next to the current
    /// executable, then `PATH`.
    pub fn new(timeout: Option<Duration>) -> Self {
        let binary = std::env::var(WORKER_BIN_ENV)
            .map(PathBuf::from)
            .ok()
            .or_else(|| {
                std::env::current_exe().ok().and_then(|exe| {
                    exe.parent()
                        .map(|dir| dir.join(WORKER_BIN_NAME))
                        .filter(|candidate| candidate.exists())
                })
            })
            .unwrap_or_else(|| PathBuf::from(WORKER_BIN_NAME));
        Self { binary, timeout }
    }

    pub fn with_binary(binary: PathBuf, timeout: Option<Duration>) -> Self {
        Self { binary, timeout }
    }

    pub fn binary(&self) -> &std::path::Path {
        &self.binary
    }

    fn spawn(&self) -> Result<Child, DispatchError> {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        // Own process group: a terminal Ctrl-C reaches the service only, so
        // in-flight analyses can finish while the loop shuts down.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        cmd.spawn().map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                DispatchError::WorkerNotFound {
                    binary: self.binary.clone(),
                }
            } else {
                DispatchError::Spawn(e)
            }
        })
    }

    fn execute(&self, task: &WorkerTask) -> Result<WorkOutcome, DispatchError> {
        let mut child = self.spawn()?;

        let sent = match child.stdin.take() {
            // Dropping stdin closes it; the worker reads exactly one frame.
            Some(mut stdin) => write_frame(&mut stdin, task),
            None => Err(io::Error::other("missing worker stdin")),
        };
        if let Err(e) = sent {
            kill_and_reap(&mut child);
            return Err(DispatchError::Protocol(e));
        }

        let Some(mut stdout) = child.stdout.take() else {
            kill_and_reap(&mut child);
            return Err(DispatchError::Protocol(io::Error::other(
                "missing worker stdout",
            )));
        };

        let reply: io::Result<Option<WorkOutcome>> = match self.timeout {
            None => read_frame(&mut stdout),
            Some(limit) => {
                let (tx, rx) = mpsc::channel();
                let reader = thread::spawn(move || {
                    let _ = tx.send(read_frame::<_, WorkOutcome>(&mut stdout));
                });
                match rx.recv_timeout(limit) {
                    Ok(reply) => {
                        let _ = reader.join();
                        reply
                    }
                    Err(_) => {
                        warn!(id = %task.candidate.id, timeout = ?limit, "Worker timed out, killing it");
                        kill_and_reap(&mut child);
                        let _ = reader.join();
                        return Err(DispatchError::TimedOut(limit));
                    }
                }
            }
        };

        let status = child.wait().map_err(DispatchError::Protocol)?;
        match reply {
            Ok(Some(outcome)) => {
                if !status.success() {
                    debug!(id = %outcome.id, status = %describe_status(&status), "Worker exited non-zero after replying");
                }
                check_reply(task, outcome)
            }
            Ok(None) => Err(DispatchError::NoOutcome {
                status: describe_status(&status),
            }),
            Err(e) => Err(DispatchError::Protocol(e)),
        }
    }
}

impl AnalysisEngine for SubprocessEngine {
    fn run(&self, task: &WorkerTask) -> WorkOutcome {
        let start = Instant::now();
        match self.execute(task) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(id = %task.candidate.id, error = %e, "Worker failed");
                WorkOutcome::failed(&task.candidate, e.to_string(), e.kind(), start.elapsed())
            }
        }
    }
}

/// A reply must describe the item it was sent.
fn check_reply(task: &WorkerTask, outcome: WorkOutcome) -> Result<WorkOutcome, DispatchError> {
    if outcome.id != task.candidate.id {
        return Err(DispatchError::Protocol(io::Error::other(format!(
            "worker replied for '{}' while processing '{}'",
            outcome.id, task.candidate.id
        ))));
    }
    Ok(outcome)
}

fn kill_and_reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn describe_status(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("killed by signal {}", signal);
        }
    }
    match status.code() {
        Some(code) => format!("exit code {}", code),
        None => "unknown status".to_string(),
    }
}

/// Fans batches out over a fixed number of pool threads.
pub struct Dispatcher {
    engine: Arc<dyn AnalysisEngine>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(engine: Arc<dyn AnalysisEngine>, workers: usize) -> Self {
        Self {
            engine,
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Process `items` with at most `workers` in flight. Blocks until every
    /// item has an outcome; outcomes come back in input order.
    pub fn run_batch(&self, items: &[CandidateFile], settings: &Settings) -> Vec<WorkOutcome> {
        if items.is_empty() {
            return Vec::new();
        }
        let threads = self.workers.min(items.len());
        let next = AtomicUsize::new(0);
        let (tx, rx) = mpsc::channel::<(usize, WorkOutcome)>();

        thread::scope(|scope| {
            for _ in 0..threads {
                let tx = tx.clone();
                let next = &next;
                let engine = &self.engine;
                scope.spawn(move || loop {
                    let idx = next.fetch_add(1, Ordering::SeqCst);
                    let Some(candidate) = items.get(idx) else {
                        break;
                    };
                    let start = Instant::now();
                    let task = WorkerTask {
                        candidate: candidate.clone(),
                        settings: settings.clone(),
                    };
                    let outcome = catch_unwind(AssertUnwindSafe(|| engine.run(&task)))
                        .unwrap_or_else(|panic| {
                            let reason = panic_message(panic.as_ref());
                            error!(id = %candidate.id, reason = %reason, "Analysis panicked");
                            WorkOutcome::failed(
                                candidate,
                                format!("panicked: {}", reason),
                                FailureKind::Crashed,
                                start.elapsed(),
                            )
                        });
                    if tx.send((idx, outcome)).is_err() {
                        break;
                    }
                });
            }
        });
        drop(tx);

        let mut slots: Vec<Option<WorkOutcome>> = vec![None; items.len()];
        for (idx, outcome) in rx {
            slots[idx] = Some(outcome);
        }
        slots
            .into_iter()
            .zip(items)
            .map(|(slot, candidate)| {
                slot.unwrap_or_else(|| {
                    WorkOutcome::failed(
                        candidate,
                        "no outcome reported".to_string(),
                        FailureKind::Crashed,
                        Duration::ZERO,
                    )
                })
            })
            .collect()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use looper_analysis::{AnalysisError, AnalysisParams};
    use std::path::Path;
    use tempfile::TempDir;

    /// Writes empty artifacts; fails or panics for chosen names.
    struct ScriptedAnalyzer {
        fail: &'static str,
        panic: &'static str,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl ScriptedAnalyzer {
        fn new(fail: &'static str, panic: &'static str) -> Self {
            Self {
                fail,
                panic,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl Analyzer for ScriptedAnalyzer {
        fn analyze(
            &self,
            input: &Path,
            output_dir: &Path,
            _params: &AnalysisParams,
        ) -> looper_analysis::Result<ArtifactSet> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(20));
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let name = input.file_name().unwrap().to_string_lossy().into_owned();
            if name == self.panic {
                panic!("boom in {}", name);
            }
            if name == self.fail {
                return Err(AnalysisError::Failed("scripted".to_string()));
            }
            Ok(ArtifactSet::for_input(output_dir, &name))
        }
    }

    fn settings(root: &Path) -> Settings {
        let toml = format!(
            r#"
[paths]
monitor_dir = {root:?}
state_file = {state:?}
output_dir = {out:?}

[processing]
num_cores = 2
interval_seconds = 1
file_ready_seconds = 0

[analysis]
nframes = 4
lframes = 8
navg = 1
"#,
            root = root.to_string_lossy(),
            state = root.join("state.json").to_string_lossy(),
            out = root.join("out").to_string_lossy(),
        );
        Settings::from_toml_str(&toml).unwrap()
    }

    fn candidates(root: &Path, n: usize) -> Vec<CandidateFile> {
        (1..=n)
            .map(|i| CandidateFile {
                id: format!("f{}.tiq", i),
                path: root.join(format!("f{}.tiq", i)),
            })
            .collect()
    }

    #[test]
    fn test_one_outcome_per_item_in_order() {
        let tmp = TempDir::new().unwrap();
        let analyzer = Arc::new(ScriptedAnalyzer::new("f3.tiq", "none"));
        let dispatcher = Dispatcher::new(Arc::new(InProcessEngine::new(analyzer.clone())), 2);
        let items = candidates(tmp.path(), 5);

        let outcomes = dispatcher.run_batch(&items, &settings(tmp.path()));
        assert_eq!(outcomes.len(), 5);
        for (outcome, item) in outcomes.iter().zip(&items) {
            assert_eq!(outcome.id, item.id);
        }
        let ok: Vec<bool> = outcomes.iter().map(WorkOutcome::is_success).collect();
        assert_eq!(ok, vec![true, true, false, true, true]);
        assert!(analyzer.peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn test_panic_is_isolated() {
        let tmp = TempDir::new().unwrap();
        let analyzer = Arc::new(ScriptedAnalyzer::new("none", "f2.tiq"));
        let dispatcher = Dispatcher::new(Arc::new(InProcessEngine::new(analyzer)), 3);
        let outcomes = dispatcher.run_batch(&candidates(tmp.path(), 4), &settings(tmp.path()));

        assert_eq!(outcomes.len(), 4);
        match &outcomes[1].status {
            OutcomeStatus::Failed { reason, kind } => {
                assert_eq!(*kind, FailureKind::Crashed);
                assert!(reason.contains("boom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 3);
    }

    #[test]
    fn test_empty_batch() {
        let tmp = TempDir::new().unwrap();
        let analyzer = Arc::new(ScriptedAnalyzer::new("none", "none"));
        let dispatcher = Dispatcher::new(Arc::new(InProcessEngine::new(analyzer)), 4);
        assert!(dispatcher.run_batch(&[], &settings(tmp.path())).is_empty());
    }

    #[test]
    fn test_missing_worker_binary_fails_items() {
        let tmp = TempDir::new().unwrap();
        let engine = SubprocessEngine::with_binary(tmp.path().join("no-such-worker"), None);
        let dispatcher = Dispatcher::new(Arc::new(engine), 2);
        let outcomes = dispatcher.run_batch(&candidates(tmp.path(), 2), &settings(tmp.path()));

        assert_eq!(outcomes.len(), 2);
        for outcome in outcomes {
            match outcome.status {
                OutcomeStatus::Failed { kind, reason } => {
                    assert_eq!(kind, FailureKind::Spawn);
                    assert!(reason.contains(WORKER_BIN_ENV));
                }
                other => panic!("expected failure, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_outcome_wire_shape() {
        let outcome = WorkOutcome {
            id: "a.tiq".to_string(),
            path: PathBuf::from("/in/a.tiq"),
            status: OutcomeStatus::Failed {
                reason: "bad".to_string(),
                kind: FailureKind::TimedOut,
            },
            elapsed_ms: 7,
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"]["status"], "failed");
        assert_eq!(json["status"]["kind"], "timed_out");
    }

    #[test]
    fn test_reply_for_other_item_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let items = candidates(tmp.path(), 2);
        let task = WorkerTask {
            candidate: items[0].clone(),
            settings: settings(tmp.path()),
        };

        let reply = |item: &CandidateFile| {
            WorkOutcome::failed(item, "x".to_string(), FailureKind::Analysis, Duration::ZERO)
        };
        let own = reply(&items[0]);
        assert_eq!(check_reply(&task, own.clone()).unwrap(), own);

        let stray = reply(&items[1]);
        let err = check_reply(&task, stray).unwrap_err();
        assert_eq!(err.kind(), FailureKind::Crashed);
        assert!(err.to_string().contains("f2.tiq"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn test_worker_answering_for_wrong_item_fails_it() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let items = candidates(tmp.path(), 2);
        // Canned success for f2 served to whoever asks
        let mut reply = Vec::new();
        let canned = WorkOutcome {
            id: items[1].id.clone(),
            path: items[1].path.clone(),
            status: OutcomeStatus::Success {
                artifacts: ArtifactSet::for_input(tmp.path(), "f2.tiq"),
                warnings: Vec::new(),
            },
            elapsed_ms: 1,
        };
        write_frame(&mut reply, &canned).unwrap();
        let reply_path = tmp.path().join("reply.bin");
        std::fs::write(&reply_path, reply).unwrap();

        let script = tmp.path().join("liar.sh");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\ncat > /dev/null\ncat {:?}\n",
                reply_path.to_string_lossy()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let engine = SubprocessEngine::with_binary(script, Some(Duration::from_secs(10)));
        let dispatcher = Dispatcher::new(Arc::new(engine), 1);
        let outcomes = dispatcher.run_batch(&items[..1], &settings(tmp.path()));

        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].id, "f1.tiq");
        assert!(matches!(
            outcomes[0].status,
            OutcomeStatus::Failed {
                kind: FailureKind::Crashed,
                ..
            }
        ));
    }
}
