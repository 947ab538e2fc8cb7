//! IPC Message Types
//!
//! Every payload on the wire is one of the tagged unions below, serialized
//! with rkyv. Failures cross the process boundary as plain [`Fault`] records.

use rkyv::{Archive, Deserialize as RkyvDeserialize, Serialize as RkyvSerialize};
use serde::{Deserialize, Serialize};

/// Messages sent from a worker to the orchestrator
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum WorkerMessage {
    /// One-time setup finished (database ready, registry loaded)
    Started {
        /// Protocol version for compatibility
        protocol_version: u32,
        /// Worker number assigned at spawn
        worker: u32,
    },

    /// Idle, requesting work
    Ready,

    /// Exiting cleanly after a `Finish` command
    Finished,

    /// Outcome of the suite that was just executed
    Result(SuiteOutcome),
}

impl WorkerMessage {
    /// Short name used in protocol mismatch descriptions
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerMessage::Started { .. } => "started",
            WorkerMessage::Ready => "ready",
            WorkerMessage::Finished => "finished",
            WorkerMessage::Result(_) => "result",
        }
    }
}

/// Commands sent from the orchestrator to a worker
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum OrchestratorCommand {
    /// Execute the named suite
    Run {
        /// Suite identifier
        suite: String,
    },

    /// No more work: send `Finished` and exit
    Finish,

    /// Process teardown: exit immediately
    Shutdown,
}

/// Whether a fault came from a failed assertion or an unexpected panic
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize, Serialize, Deserialize,
)]
#[archive(check_bytes)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// An assertion did not hold
    Failure,
    /// The test panicked for any other reason
    Error,
}

/// A single failed or errored test, as plain data
#[derive(Debug, Clone, PartialEq, Archive, RkyvSerialize, RkyvDeserialize, Serialize, Deserialize)]
#[archive(check_bytes)]
pub struct Fault {
    /// Failure or error
    pub kind: FaultKind,
    /// Suite the test belongs to
    pub suite: String,
    /// Test name
    pub test: String,
    /// Human-readable message
    pub message: String,
    /// Captured backtrace, when available
    pub backtrace: Option<String>,
}

/// Summary of one executed suite
#[derive(Debug, Clone, PartialEq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct SuiteOutcome {
    /// Suite identifier
    pub suite: String,
    /// Number of tests executed
    pub test_count: u64,
    /// Number of assertions evaluated
    pub assertion_count: u64,
    /// Assertion failures
    pub failures: Vec<Fault>,
    /// Unexpected panics
    pub errors: Vec<Fault>,
    /// Time spent executing the suite inside the worker
    pub duration_nanos: u64,
}

impl SuiteOutcome {
    /// Outcome for a suite that ran no tests
    pub fn empty(suite: impl Into<String>) -> Self {
        Self {
            suite: suite.into(),
            ..Default::default()
        }
    }

    /// Whether every test in the suite passed
    pub fn passed(&self) -> bool {
        self.failures.is_empty() && self.errors.is_empty()
    }

    /// All faults, failures first
    pub fn faults(&self) -> impl Iterator<Item = &Fault> {
        self.failures.iter().chain(self.errors.iter())
    }
}

/// Kind of a run option
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum OptionKind {
    /// Pull in the suites registered under a module path
    Require,
}

/// One `[kind, value]` pair of a run request
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RunOption {
    /// Option kind
    pub kind: OptionKind,
    /// Option value
    pub value: String,
}

impl RunOption {
    /// A `require` option
    pub fn require(value: impl Into<String>) -> Self {
        Self {
            kind: OptionKind::Require,
            value: value.into(),
        }
    }
}

/// Run configuration record handed to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq, Default, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub struct RunRequest {
    /// Run name; also the timing key namespace
    pub name: String,
    /// Option pairs
    pub options: Vec<RunOption>,
    /// Source files whose suites should run
    pub files: Vec<String>,
}

impl RunRequest {
    /// Request with no options or files (selects every registered suite)
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Values of all `require` options
    pub fn requires(&self) -> impl Iterator<Item = &str> {
        self.options
            .iter()
            .filter(|o| o.kind == OptionKind::Require)
            .map(|o| o.value.as_str())
    }
}

/// Commands sent to a resident host process
#[derive(Debug, Clone, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum HostCommand {
    /// Run one batch of suites
    Run(RunRequest),
    /// Stop serving
    Shutdown,
}

/// Replies from a resident host process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Archive, RkyvSerialize, RkyvDeserialize)]
#[archive(check_bytes)]
pub enum HostReply {
    /// Host finished loading
    Started,
    /// Host is idle and accepts a command
    Ready,
    /// The last run passed
    Success,
    /// The last run failed or broke
    Failure,
}
