//! Looper - exactly-once ingestion of IQ captures
//!
//! A long-running loop that finds new capture files (by scanning a watched
//! directory or reading a manifest), waits until each one has stopped
//! growing, runs a bounded batch of analyses in isolated worker processes,
//! and records every success in a durable ledger so nothing is processed
//! twice across restarts.
//!
//! # Components
//!
//! - [`config`]: TOML settings, validated up front
//! - [`ledger`]: versioned JSON record of processed identifiers
//! - [`discovery`]: directory and manifest candidate sources
//! - [`readiness`]: size-stability gate
//! - [`dispatch`]: worker pool, subprocess and in-process engines
//! - [`scheduler`]: the Idle/Discovering/Dispatching/ShuttingDown loop

pub mod cancel;
pub mod config;
pub mod discovery;
pub mod dispatch;
pub mod ledger;
pub mod publish;
pub mod readiness;
pub mod scheduler;
pub mod wire;
pub mod worker;

pub use cancel::CancellationToken;
pub use config::{ConfigError, DiscoveryMode, Settings};
pub use discovery::{source_for, CandidateFile, CandidateSource, DirectorySource, ManifestSource};
pub use dispatch::{
    AnalysisEngine, Dispatcher, FailureKind, InProcessEngine, OutcomeStatus, SubprocessEngine,
    WorkOutcome,
};
pub use ledger::{Ledger, LedgerError};
pub use readiness::{Readiness, ReadinessGate};
pub use scheduler::{CycleReport, LoopState, RunSummary, Scheduler};
pub use wire::WorkerTask;
